use std::sync::Arc;

use lumen_service::caching::{CacheKey, cleanup};
use lumen_service::config::Config;
use lumen_service::{DataSource, ImageLoader, ImageLoaderBuilder, ImageRequest, ImageResult};

use crate::utils::{Recorder, ScriptedFetcher};

async fn loader_from_config(
    config: &Config,
    fetcher: Arc<ScriptedFetcher>,
    recorder: &Recorder,
) -> ImageLoader {
    ImageLoaderBuilder::from_config(config)
        .await
        .unwrap()
        .fetcher(fetcher)
        .event_listener_factory(recorder.factory())
        .build()
        .unwrap()
}

fn config(cache_dir: &lumen_test::TempDir) -> Config {
    Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_unreadable_entry_is_replaced() {
    lumen_test::setup();
    let cache_dir = lumen_test::tempdir();
    let config = config(&cache_dir);
    let fetcher = Arc::new(ScriptedFetcher::png(8, 8));
    let recorder = Recorder::default();
    let request = ImageRequest::new("img://A");

    let loader = loader_from_config(&config, fetcher.clone(), &recorder).await;
    assert!(loader.execute(request.clone()).await.is_success());
    drop(loader);

    let key = CacheKey::from_request(&request);
    let path = cache_dir.path().join("images").join(key.disk.file_name());
    assert!(path.is_file());
    std::fs::write(&path, b"corrupted").unwrap();
    recorder.take();

    // a fresh loader has a cold memory cache and goes to disk
    let loader = loader_from_config(&config, fetcher.clone(), &recorder).await;
    let ImageResult::Success(success) = loader.execute(request.clone()).await else {
        panic!("expected success");
    };
    assert_eq!(success.data_source, DataSource::Network);
    insta::assert_yaml_snapshot!(recorder.take(), @r###"
    ---
    - Started
    - DiskCacheHit
    - DecodeStarted
    - FetchStarted
    - FetchCompleted(network)
    - DecodeStarted
    - DecodeCompleted
    - MemoryCacheWrite
    - DiskCacheWrite
    - Success(network)
    "###);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(std::fs::read(&path).unwrap(), lumen_test::png_bytes(8, 8));
}

#[tokio::test]
async fn test_externally_deleted_entry() {
    let cache_dir = lumen_test::tempdir();
    let config = config(&cache_dir);
    let fetcher = Arc::new(ScriptedFetcher::png(8, 8));
    let recorder = Recorder::default();
    let request = ImageRequest::new("img://A");

    let loader = loader_from_config(&config, fetcher.clone(), &recorder).await;
    assert!(loader.execute(request.clone()).await.is_success());
    let disk = loader.disk_cache().unwrap().clone();
    assert_eq!(disk.len(), 1);

    let key = CacheKey::from_request(&request);
    std::fs::remove_file(disk.directory().join(key.disk.file_name())).unwrap();
    loader.memory_cache().clear();

    assert!(loader.execute(request).await.is_success());
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(disk.len(), 1);
    assert!(disk.contains(&key.disk));
}

#[tokio::test]
async fn test_no_temporary_files_remain() {
    let cache_dir = lumen_test::tempdir();
    let config = config(&cache_dir);
    let fetcher = Arc::new(ScriptedFetcher::png(8, 8));
    let loader = loader_from_config(&config, fetcher, &Recorder::default()).await;

    let loads = ["img://A", "img://B", "img://C", "img://A"]
        .map(|model| loader.execute(ImageRequest::new(model)));
    for result in futures::future::join_all(loads).await {
        assert!(result.is_success());
    }

    let mut names: Vec<_> = std::fs::read_dir(cache_dir.path().join("images"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|name| name.len() == 64 && !name.ends_with(".tmp")));

    let stats = cleanup(&config, false).await.unwrap();
    assert_eq!(stats.removed_files, 0);
    assert_eq!(stats.retained_files, 3);
}
