use std::fmt;

use futures::future::BoxFuture;
use url::Url;

use crate::types::{ImageModel, ImageResult};

use super::{Chain, Interceptor};

type RewriteFn = dyn Fn(&Url) -> Option<Url> + Send + Sync;

/// Rewrites the URLs of network requests with a caller supplied function.
///
/// The function returns `None` to leave a URL untouched. Requests for anything other than URLs
/// are passed through as they are.
pub struct RewriteInterceptor {
    rewrite: Box<RewriteFn>,
}

impl RewriteInterceptor {
    pub fn new<F>(rewrite: F) -> Self
    where
        F: Fn(&Url) -> Option<Url> + Send + Sync + 'static,
    {
        Self {
            rewrite: Box::new(rewrite),
        }
    }
}

impl fmt::Debug for RewriteInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteInterceptor").finish_non_exhaustive()
    }
}

impl Interceptor for RewriteInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult> {
        let request = chain.request();
        let rewritten = match &request.model {
            ImageModel::Url(url) => (self.rewrite)(url),
            _ => None,
        };

        match rewritten {
            Some(url) => {
                tracing::trace!(from = %request.model, to = %url, "rewrote image url");
                chain.proceed(request.clone().with_model(url))
            }
            None => chain.proceed(request.clone()),
        }
    }
}
