//! The interceptor chain every request passes through.
//!
//! Interceptors wrap the loading pipeline. The first registered interceptor sees a request first
//! and its result last. Each one receives a [`Chain`], can inspect the current request with
//! [`Chain::request`], and either forwards a (possibly modified) request with
//! [`Chain::proceed`], or short-circuits by returning a result of its own. The last link of the
//! chain forwards to the [`Terminal`] stage, which does the actual loading.
//!
//! [`Chain::proceed`] may be called more than once, which is how the [`RetryInterceptor`]
//! re-runs everything that comes after it.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::types::{ImageRequest, ImageResult};

mod headers;
mod logging;
mod retry;
mod rewrite;

pub use headers::HeaderInterceptor;
pub use logging::LoggingInterceptor;
pub use retry::RetryInterceptor;
pub use rewrite::RewriteInterceptor;

/// Observes or modifies requests and their results.
pub trait Interceptor: Send + Sync {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult>;
}

/// The stage at the end of an interceptor chain.
pub trait Terminal: Send + Sync {
    fn execute(&self, request: ImageRequest) -> BoxFuture<'_, ImageResult>;
}

/// The remainder of an interceptor chain, as seen by one interceptor.
pub struct Chain<'a> {
    request: ImageRequest,
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Chain<'a> {
    pub fn new(
        request: ImageRequest,
        interceptors: &'a [Arc<dyn Interceptor>],
        terminal: &'a dyn Terminal,
    ) -> Self {
        Self {
            request,
            interceptors,
            terminal,
        }
    }

    /// The request as it was handed to this link.
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// Forwards `request` to the next interceptor, or to the terminal stage.
    pub fn proceed(&self, request: ImageRequest) -> BoxFuture<'a, ImageResult> {
        match self.interceptors.split_first() {
            Some((next, rest)) => next.intercept(Chain::new(request, rest, self.terminal)),
            None => self.terminal.execute(request),
        }
    }

    /// Runs the whole chain, starting at the first interceptor.
    pub(crate) fn run(self) -> BoxFuture<'a, ImageResult> {
        let Self {
            request,
            interceptors,
            terminal,
        } = self;
        match interceptors.split_first() {
            Some((first, rest)) => first.intercept(Chain::new(request, rest, terminal)),
            None => terminal.execute(request),
        }
    }
}
