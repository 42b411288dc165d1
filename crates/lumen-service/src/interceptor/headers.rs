use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::types::ImageResult;

use super::{Chain, Interceptor};

/// Adds default headers to every request.
///
/// Headers the request already carries take precedence over the defaults. Header names are
/// compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct HeaderInterceptor {
    headers: BTreeMap<String, String>,
}

impl HeaderInterceptor {
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl Interceptor for HeaderInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, ImageResult> {
        let mut request = chain.request().clone();
        for (name, value) in &self.headers {
            let present = request
                .headers
                .keys()
                .any(|existing| existing.eq_ignore_ascii_case(name));
            if !present {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        chain.proceed(request)
    }
}
