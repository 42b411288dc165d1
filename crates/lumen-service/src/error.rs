use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading an image.
///
/// The variants mirror the failure taxonomy of the pipeline: transient fetch failures, decode
/// failures, cancellation, and unexpected internal errors. Cache-layer problems never show up
/// here, as a broken cache tier only degrades to a miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The image was not found at its source.
    #[error("not found")]
    NotFound,
    /// The image could not be fetched due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The image could not be fetched due to a timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The image could not be fetched due to another problem, like connection loss, DNS
    /// resolution, or a 5xx server response.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// The bytes were fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// There is no fetcher or decoder able to handle the requested model.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The load was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the loader itself.
    #[error("internal error")]
    InternalError,
}

impl ImageError {
    /// Whether retrying the same request has a realistic chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FetchError(_) | Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short, stable tag for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::FetchError(_) => "fetcherror",
            Self::Malformed(_) => "malformed",
            Self::Unsupported(_) => "unsupported",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal",
        }
    }

    /// Creates a [`FetchError`](Self::FetchError) from the innermost source of `error`.
    pub fn fetch_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }
        Self::FetchError(error.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for ImageError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<image::ImageError> for ImageError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => Self::Unsupported(e.to_string()),
            // the image exceeds the decoder's allocation limit
            image::ImageError::Limits(e) => Self::Unsupported(e.to_string()),
            image::ImageError::IoError(e) => Self::from_std_error(e),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ImageError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::FetchError("request timed out".into());
        }
        Self::fetch_error(&error)
    }
}
