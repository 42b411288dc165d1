//! Support to fetch images from the local filesystem.

use std::io;
use std::path::Path;

use futures::future::{BoxFuture, FutureExt};

use crate::error::ImageError;
use crate::types::{DataSource, ImageModel, ImageRequest};

use super::{FetchResult, ImageFetcher};

/// Reads image files from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemFetcher;

impl FilesystemFetcher {
    async fn fetch_path(&self, path: &Path) -> Result<FetchResult, ImageError> {
        tracing::debug!("Fetching image from `{}`", path.display());

        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ImageError::NotFound,
            io::ErrorKind::PermissionDenied => ImageError::PermissionDenied(e.to_string()),
            _ => ImageError::fetch_error(&e),
        })?;

        Ok(FetchResult::bytes(bytes, DataSource::Disk))
    }
}

impl ImageFetcher for FilesystemFetcher {
    fn handles(&self, model: &ImageModel) -> bool {
        matches!(model, ImageModel::Path(_))
    }

    fn fetch<'a>(&'a self, request: &'a ImageRequest) -> BoxFuture<'a, FetchResult> {
        async move {
            match &request.model {
                ImageModel::Path(path) => self.fetch_path(path).await.into(),
                other => FetchResult::error(ImageError::Unsupported(format!(
                    "`{other}` is not a file"
                ))),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_file() {
        lumen_test::setup();
        let dir = lumen_test::tempdir();
        let path = dir.path().join("image.png");
        std::fs::write(&path, lumen_test::png_bytes(8, 8)).unwrap();

        let request = ImageRequest::new(path);
        assert!(FilesystemFetcher.handles(&request.model));

        let result = FilesystemFetcher.fetch(&request).await;
        assert!(matches!(
            result,
            FetchResult::Success {
                data_source: DataSource::Disk,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let dir = lumen_test::tempdir();
        let request = ImageRequest::new(dir.path().join("i-do-not-exist.png"));

        let FetchResult::Error { error } = FilesystemFetcher.fetch(&request).await else {
            panic!("expected an error");
        };
        assert_eq!(error, ImageError::NotFound);
    }
}
