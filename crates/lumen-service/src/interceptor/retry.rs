use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::error::ImageError;
use crate::types::ImageResult;

use super::{Chain, Interceptor};

type RetryPredicate = dyn Fn(&ImageError) -> bool + Send + Sync;

/// Re-runs the rest of the chain when it fails.
///
/// By default only [transient](ImageError::is_transient) errors are retried. A cancelled request
/// is never retried.
#[derive(Clone)]
pub struct RetryInterceptor {
    max_retries: usize,
    delay: Option<Duration>,
    predicate: Arc<RetryPredicate>,
}

impl RetryInterceptor {
    /// Retries a failed request up to `max_retries` times.
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            delay: None,
            predicate: Arc::new(ImageError::is_transient),
        }
    }

    /// Waits for `delay` before each retry.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Only retries errors for which `predicate` returns `true`.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ImageError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    fn should_retry(&self, result: &ImageResult) -> bool {
        match result.error() {
            Some(error) => !error.is_cancelled() && (self.predicate)(error),
            None => false,
        }
    }
}

impl fmt::Debug for RetryInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryInterceptor")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Interceptor for RetryInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult> {
        async move {
            let mut retries = 0;
            loop {
                let result = chain.proceed(chain.request().clone()).await;
                if retries >= self.max_retries || !self.should_retry(&result) {
                    break result;
                }

                retries += 1;
                tracing::debug!(
                    model = %chain.request().model,
                    error = result.error().map(tracing::field::display),
                    retries,
                    "retrying image load",
                );
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        .boxed()
    }
}
