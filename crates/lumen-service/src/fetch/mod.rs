//! Retrieval of image bytes.
//!
//! An [`ImageFetcher`] turns the model of a request into either encoded bytes or an already
//! decoded image. The loader asks its fetchers in order and uses the first one that
//! [`handles`](ImageFetcher::handles) the model. Custom fetchers are consulted before the
//! built-in [`InlineFetcher`], [`FilesystemFetcher`] and [`HttpFetcher`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::decode::DecodedImage;
use crate::error::ImageError;
use crate::types::{DataSource, ImageModel, ImageRequest};

mod filesystem;
mod http;
mod inline;

pub use filesystem::FilesystemFetcher;
pub use http::HttpFetcher;
pub use inline::InlineFetcher;

/// The outcome of a fetch.
#[derive(Clone)]
pub enum FetchResult {
    /// Encoded image bytes, which still have to be decoded.
    Success {
        bytes: Bytes,
        mime_type: Option<String>,
        data_source: DataSource,
    },
    Error {
        error: ImageError,
    },
    /// An image that is already decoded, skipping the decoder entirely.
    Decoded {
        image: Arc<DecodedImage>,
        width: u32,
        height: u32,
        data_source: DataSource,
    },
}

impl FetchResult {
    pub fn bytes(bytes: impl Into<Bytes>, data_source: DataSource) -> Self {
        let bytes = bytes.into();
        let mime_type = crate::decode::ImageDecoder::sniff_mime_type(&bytes).map(String::from);
        Self::Success {
            bytes,
            mime_type,
            data_source,
        }
    }

    pub fn decoded(image: Arc<DecodedImage>, data_source: DataSource) -> Self {
        Self::Decoded {
            width: image.width(),
            height: image.height(),
            image,
            data_source,
        }
    }

    pub fn error(error: ImageError) -> Self {
        Self::Error { error }
    }

    pub fn data_source(&self) -> Option<DataSource> {
        match self {
            Self::Success { data_source, .. } | Self::Decoded { data_source, .. } => {
                Some(*data_source)
            }
            Self::Error { .. } => None,
        }
    }
}

impl fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success {
                bytes,
                mime_type,
                data_source,
            } => f
                .debug_struct("Success")
                .field("len", &bytes.len())
                .field("mime_type", mime_type)
                .field("data_source", data_source)
                .finish(),
            Self::Error { error } => f.debug_struct("Error").field("error", error).finish(),
            Self::Decoded {
                width,
                height,
                data_source,
                ..
            } => f
                .debug_struct("Decoded")
                .field("width", width)
                .field("height", height)
                .field("data_source", data_source)
                .finish(),
        }
    }
}

impl From<Result<FetchResult, ImageError>> for FetchResult {
    fn from(result: Result<FetchResult, ImageError>) -> Self {
        result.unwrap_or_else(Self::error)
    }
}

/// Retrieves the encoded bytes, or a decoded image, for a request.
pub trait ImageFetcher: Send + Sync + fmt::Debug {
    /// Whether this fetcher is able to fetch the given model.
    fn handles(&self, model: &ImageModel) -> bool;

    /// Fetches the image for `request`.
    ///
    /// Timeouts are the fetcher's responsibility. Cancellation happens by dropping the future.
    fn fetch<'a>(&'a self, request: &'a ImageRequest) -> BoxFuture<'a, FetchResult>;
}
