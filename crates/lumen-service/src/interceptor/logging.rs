use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};

use crate::types::ImageResult;

use super::{Chain, Interceptor};

/// Logs the start and outcome of every request that passes through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult> {
        async move {
            let request = chain.request().clone();
            let model = request.model.id();
            let start = Instant::now();
            tracing::debug!(
                %model,
                size = ?request.size,
                priority = ?request.priority,
                "loading image"
            );

            let result = chain.proceed(request).await;
            let elapsed = start.elapsed();
            match &result {
                ImageResult::Success(success) => tracing::debug!(
                    %model,
                    source = %success.data_source,
                    ?elapsed,
                    "loaded image",
                ),
                ImageResult::Failure(failure) if failure.error.is_cancelled() => {
                    tracing::debug!(%model, ?elapsed, "image load cancelled")
                }
                ImageResult::Failure(failure) => tracing::info!(
                    %model,
                    error = %failure.error,
                    ?elapsed,
                    "failed to load image",
                ),
                ImageResult::Loading => {}
            }
            result
        }
        .boxed()
    }
}
