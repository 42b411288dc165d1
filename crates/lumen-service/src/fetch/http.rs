//! Support to fetch images over HTTP.

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, StatusCode, Url, header};

use crate::error::ImageError;
use crate::types::{DataSource, ImageModel, ImageRequest};
use crate::utils::http::FetchTimeouts;

use super::{FetchResult, ImageFetcher};

/// Fetches images from `http` and `https` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeouts: FetchTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: FetchTimeouts) -> Self {
        Self { client, timeouts }
    }

    async fn fetch_url(&self, url: &Url, request: &ImageRequest) -> Result<FetchResult, ImageError> {
        tracing::debug!("Fetching image from `{}`", url);

        let mut builder = self.client.get(url.clone());
        for (key, value) in &request.headers {
            if let Ok(key) = header::HeaderName::from_bytes(key.as_bytes()) {
                builder = builder.header(key, value.as_str());
            }
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();

        if status.is_success() {
            let mime_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(String::from);
            let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;

            tracing::trace!(%url, len = bytes.len(), "fetched image");
            return Ok(FetchResult::Success {
                bytes,
                mime_type,
                data_source: DataSource::Network,
            });
        }

        tracing::debug!(%url, %status, "unexpected status code");
        Err(match status {
            StatusCode::NOT_FOUND => ImageError::NotFound,
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                let details = response.text().await.unwrap_or_default();
                ImageError::PermissionDenied(format!("{status}: {details}").trim().to_owned())
            }
            _ => ImageError::FetchError(status.to_string()),
        })
    }

    fn map_error(&self, error: reqwest::Error) -> ImageError {
        if error.is_timeout() {
            ImageError::Timeout(self.timeouts.max_download)
        } else {
            error.into()
        }
    }
}

impl ImageFetcher for HttpFetcher {
    fn handles(&self, model: &ImageModel) -> bool {
        matches!(model, ImageModel::Url(url) if matches!(url.scheme(), "http" | "https"))
    }

    fn fetch<'a>(&'a self, request: &'a ImageRequest) -> BoxFuture<'a, FetchResult> {
        async move {
            match &request.model {
                ImageModel::Url(url) => self.fetch_url(url, request).await.into(),
                other => FetchResult::error(ImageError::Unsupported(format!(
                    "`{other}` is not an http url"
                ))),
            }
        }
        .boxed()
    }
}
