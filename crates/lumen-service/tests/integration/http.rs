use std::sync::Arc;
use std::time::Duration;

use lumen_service::config::Config;
use lumen_service::interceptor::RetryInterceptor;
use lumen_service::utils::http::FetchTimeouts;
use lumen_service::{DataSource, ImageError, ImageLoader, ImageLoaderBuilder, ImageRequest, Size};

#[tokio::test]
async fn test_flaky_server_with_retries() {
    lumen_test::setup();
    let server = lumen_test::image_server();
    let loader = ImageLoader::builder()
        .interceptor(Arc::new(RetryInterceptor::new(lumen_test::FLAKY_FAILURES)))
        .build()
        .unwrap();

    let request = ImageRequest::new(server.url("/flaky/40x20.png"));
    let result = loader.execute(request.clone()).await;
    assert_eq!(result.image().unwrap().size(), Size::new(40, 20));
    assert_eq!(
        server.all_hits(),
        [("/flaky/40x20.png".to_owned(), lumen_test::FLAKY_FAILURES + 1)]
    );

    // served from memory from now on
    let lumen_service::ImageResult::Success(success) = loader.execute(request).await else {
        panic!("expected success");
    };
    assert_eq!(success.data_source, DataSource::Memory);
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_flaky_server_without_retries() {
    let server = lumen_test::image_server();
    let loader = ImageLoader::builder().build().unwrap();

    let result = loader
        .execute(ImageRequest::new(server.url("/flaky/8x8.png")))
        .await;
    assert!(matches!(result.error(), Some(ImageError::FetchError(_))));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_default_headers_from_config() {
    let server = lumen_test::image_server();
    let mut config = Config::default();
    config
        .default_headers
        .insert("Authorization".into(), lumen_test::AUTH_TOKEN.into());
    let loader = ImageLoaderBuilder::from_config(&config)
        .await
        .unwrap()
        .build()
        .unwrap();

    let result = loader
        .execute(ImageRequest::new(server.url("/protected/8x8.png")))
        .await;
    assert!(result.is_success());

    let result = loader
        .execute(
            ImageRequest::new(server.url("/protected/16x16.png"))
                .with_header("authorization", "Bearer wrong"),
        )
        .await;
    assert!(matches!(result.error(), Some(ImageError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_fetch_timeout() {
    let server = lumen_test::image_server();
    let loader = ImageLoader::builder()
        .timeouts(FetchTimeouts {
            connect: Duration::from_secs(1),
            max_download: Duration::from_millis(50),
        })
        .build()
        .unwrap();

    let result = loader
        .execute(ImageRequest::new(server.url("/delay/1000/8x8.png")))
        .await;
    assert!(matches!(result.error(), Some(ImageError::Timeout(_))));
}

#[tokio::test]
async fn test_garbage_is_malformed() {
    let server = lumen_test::image_server();
    let loader = ImageLoader::builder().build().unwrap();

    let result = loader
        .execute(ImageRequest::new(server.url("/garbage.png")))
        .await;
    assert!(matches!(result.error(), Some(ImageError::Malformed(_))));
}
