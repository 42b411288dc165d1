use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use lumen_service::caching::{CacheKey, DiskCache};
use lumen_service::{DataSource, ImageError, ImageLoader, ImageRequest, ImageResult, Size};

use crate::utils::{Recorder, ScriptedFetcher};

async fn setup(fetcher: Arc<ScriptedFetcher>) -> (ImageLoader, Recorder, DiskCache, lumen_test::TempDir) {
    lumen_test::setup();
    let cache_dir = lumen_test::tempdir();
    let disk = DiskCache::open(cache_dir.path(), 1 << 20).await.unwrap();
    let recorder = Recorder::default();
    let loader = ImageLoader::builder()
        .fetcher(fetcher)
        .disk_cache(disk.clone())
        .event_listener_factory(recorder.factory())
        .build()
        .unwrap();
    (loader, recorder, disk, cache_dir)
}

#[tokio::test]
async fn test_cold_then_warm_load() {
    let fetcher = Arc::new(ScriptedFetcher::png(64, 32));
    let (loader, recorder, disk, _cache_dir) = setup(fetcher.clone()).await;
    let request = ImageRequest::new("img://A");

    let result = loader.execute(request.clone()).await;
    assert!(result.is_success());
    insta::assert_yaml_snapshot!(recorder.take(), @r###"
    ---
    - Started
    - FetchStarted
    - FetchCompleted(network)
    - DecodeStarted
    - DecodeCompleted
    - MemoryCacheWrite
    - DiskCacheWrite
    - Success(network)
    "###);
    assert_eq!(disk.len(), 1);

    let result = loader.execute(request).await;
    assert_eq!(result.image().unwrap().size(), Size::new(64, 32));
    insta::assert_yaml_snapshot!(recorder.take(), @r###"
    ---
    - Started
    - MemoryCacheHit
    - Success(memory)
    "###);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_disk_hit_in_fresh_loader() {
    let fetcher = Arc::new(ScriptedFetcher::png(64, 32));
    let (loader, _recorder, disk, _cache_dir) = setup(fetcher.clone()).await;
    assert!(loader.execute(ImageRequest::new("img://A")).await.is_success());

    // a second loader shares the disk cache, but has a cold memory cache
    let recorder = Recorder::default();
    let loader = ImageLoader::builder()
        .fetcher(fetcher.clone())
        .disk_cache(disk)
        .event_listener_factory(recorder.factory())
        .build()
        .unwrap();

    let request = ImageRequest::new("img://A").with_size(Size::new(16, 16));
    let ImageResult::Success(success) = loader.execute(request).await else {
        panic!("expected success");
    };
    assert_eq!(success.data_source, DataSource::Disk);
    assert_eq!(success.image.size(), Size::new(16, 8));
    insta::assert_yaml_snapshot!(recorder.take(), @r###"
    ---
    - Started
    - DiskCacheHit
    - DecodeStarted
    - DecodeCompleted
    - MemoryCacheWrite
    - Success(disk)
    "###);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_failure_is_terminal() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let (loader, recorder, disk, _cache_dir) = setup(fetcher).await;

    let result = loader.execute(ImageRequest::new("img://missing")).await;
    assert_eq!(result.error(), Some(&ImageError::NotFound));
    assert_eq!(
        recorder.take(),
        ["Started", "FetchStarted", "Failure(not found)"]
    );
    assert!(disk.is_empty());
    assert!(loader.memory_cache().is_empty());
}

#[tokio::test]
async fn test_load_stream() {
    let fetcher = Arc::new(ScriptedFetcher::png(32, 32));
    let (loader, _recorder, _disk, _cache_dir) = setup(fetcher).await;

    let thumbnail = ImageRequest::new("img://A").with_size(Size::new(8, 8));
    assert!(loader.execute(thumbnail.clone()).await.is_success());
    let placeholder_key = CacheKey::from_request(&thumbnail).memory;

    let request = ImageRequest::new("img://A").with_placeholder_key(placeholder_key);
    let results: Vec<_> = loader.load(request).collect().await;
    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], ImageResult::Loading));
    let ImageResult::Success(placeholder) = &results[1] else {
        panic!("expected the placeholder");
    };
    assert!(!placeholder.is_complete);
    assert_eq!(placeholder.image.size(), Size::new(8, 8));
    assert!(results[2].is_terminal());
    assert_eq!(results[2].image().unwrap().size(), Size::new(32, 32));
}

#[tokio::test]
async fn test_one_terminal_event_per_enqueued_request() {
    let fetcher =
        Arc::new(ScriptedFetcher::png(8, 8).with_delay(Duration::from_millis(200)));
    let (loader, recorder, _disk, _cache_dir) = setup(fetcher).await;

    let disposables: Vec<_> = ["img://A", "img://B", "img://C"]
        .into_iter()
        .map(|model| loader.enqueue(ImageRequest::new(model).with_tag("gallery")))
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(loader.cancel_tag("gallery"), 3);

    for disposable in disposables {
        let result = disposable.result().await;
        assert_eq!(result.error(), Some(&ImageError::Cancelled));
    }

    let events = recorder.take();
    let terminal: Vec<_> = events
        .iter()
        .filter(|event| {
            ["Success", "Failure", "Cancelled"]
                .iter()
                .any(|name| event.starts_with(name))
        })
        .collect();
    assert_eq!(terminal, ["Cancelled", "Cancelled", "Cancelled"]);
}
