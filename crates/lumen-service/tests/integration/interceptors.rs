use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use lumen_service::interceptor::{
    Chain, HeaderInterceptor, Interceptor, LoggingInterceptor, RetryInterceptor,
};
use lumen_service::{ImageError, ImageLoader, ImageRequest, ImageResult};

use crate::utils::{Recorder, ScriptedFetcher, fetch_error, png};

/// Records the headers of every request passing through.
#[derive(Default)]
struct HeaderSpy {
    seen: Mutex<Vec<Option<String>>>,
}

impl Interceptor for HeaderSpy {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult> {
        let request = chain.request().clone();
        self.seen
            .lock()
            .unwrap()
            .push(request.headers.get("X-Client").cloned());
        chain.proceed(request)
    }
}

#[tokio::test]
async fn test_retry_produces_one_success() {
    lumen_test::setup();
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        fetch_error(),
        fetch_error(),
        png(16, 16),
    ]));
    let spy = Arc::new(HeaderSpy::default());
    let recorder = Recorder::default();

    let loader = ImageLoader::builder()
        .fetcher(fetcher.clone())
        .interceptor(Arc::new(
            HeaderInterceptor::default().with_header("X-Client", "lumen"),
        ))
        .interceptor(Arc::new(RetryInterceptor::new(3)))
        .interceptor(spy.clone())
        .interceptor(Arc::new(LoggingInterceptor))
        .event_listener_factory(recorder.factory())
        .build()
        .unwrap();

    let result = loader.execute(ImageRequest::new("img://A")).await;
    assert!(result.is_success());
    assert_eq!(fetcher.calls(), 3);

    // the retry re-runs everything after it, with the headers added before it
    assert_eq!(*spy.seen.lock().unwrap(), vec![Some("lumen".to_owned()); 3]);

    insta::assert_yaml_snapshot!(recorder.take(), @r###"
    ---
    - Started
    - FetchStarted
    - FetchStarted
    - FetchStarted
    - FetchCompleted(network)
    - DecodeStarted
    - DecodeCompleted
    - MemoryCacheWrite
    - Success(network)
    "###);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![fetch_error()]));
    let recorder = Recorder::default();
    let loader = ImageLoader::builder()
        .fetcher(fetcher.clone())
        .interceptor(Arc::new(RetryInterceptor::new(2)))
        .event_listener_factory(recorder.factory())
        .build()
        .unwrap();

    let result = loader.execute(ImageRequest::new("img://A")).await;
    assert!(matches!(result.error(), Some(ImageError::FetchError(_))));
    assert_eq!(fetcher.calls(), 3);

    let events = recorder.take();
    assert_eq!(events.iter().filter(|e| e.starts_with("Failure")).count(), 1);
    assert_eq!(events.last().unwrap(), "Failure(fetch failed: 503 Service Unavailable)");
}

#[tokio::test]
async fn test_request_headers_win_over_defaults() {
    let fetcher = Arc::new(ScriptedFetcher::png(4, 4));
    let spy = Arc::new(HeaderSpy::default());
    let loader = ImageLoader::builder()
        .fetcher(fetcher)
        .interceptor(Arc::new(
            HeaderInterceptor::default().with_header("x-client", "default"),
        ))
        .interceptor(spy.clone())
        .build()
        .unwrap();

    let request = ImageRequest::new("img://A").with_header("X-Client", "custom");
    assert!(loader.execute(request).await.is_success());
    assert_eq!(*spy.seen.lock().unwrap(), [Some("custom".to_owned())]);
}
