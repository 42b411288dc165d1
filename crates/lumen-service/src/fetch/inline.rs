use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::ImageError;
use crate::types::{DataSource, ImageModel, ImageRequest};

use super::{FetchResult, ImageFetcher};

/// Serves images that are part of the request itself, either as encoded bytes or as an already
/// decoded bitmap.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineFetcher;

impl ImageFetcher for InlineFetcher {
    fn handles(&self, model: &ImageModel) -> bool {
        matches!(model, ImageModel::Bytes { .. } | ImageModel::Bitmap { .. })
    }

    fn fetch<'a>(&'a self, request: &'a ImageRequest) -> BoxFuture<'a, FetchResult> {
        let result = match &request.model {
            ImageModel::Bytes { bytes, .. } => FetchResult::bytes(bytes.clone(), DataSource::Inline),
            ImageModel::Bitmap { image, .. } => {
                FetchResult::decoded(Arc::clone(image), DataSource::Inline)
            }
            other => FetchResult::error(ImageError::Unsupported(format!(
                "`{other}` is not an inline image"
            ))),
        };
        future::ready(result).boxed()
    }
}
