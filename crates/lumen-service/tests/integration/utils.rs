use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use lumen_service::events::{
    EventListener, EventListenerFactory, ImageLoadEvent, SharedListenerFactory,
};
use lumen_service::fetch::{FetchResult, ImageFetcher};
use lumen_service::{DataSource, ImageError, ImageModel, ImageRequest};

/// Serves `img://` models from a script of canned results.
///
/// Once the script is down to its last entry, that entry is repeated for every further fetch.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchResult>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<FetchResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    /// Always serves a PNG of the given size.
    pub fn png(width: u32, height: u32) -> Self {
        Self::new(vec![png(width, height)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ImageFetcher for ScriptedFetcher {
    fn handles(&self, model: &ImageModel) -> bool {
        matches!(model, ImageModel::Url(url) if url.scheme() == "img")
    }

    fn fetch<'a>(&'a self, _request: &'a ImageRequest) -> BoxFuture<'a, FetchResult> {
        async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            match script.len() {
                0 => FetchResult::error(ImageError::NotFound),
                1 => script[0].clone(),
                _ => script.pop_front().unwrap(),
            }
        }
        .boxed()
    }
}

pub fn png(width: u32, height: u32) -> FetchResult {
    FetchResult::bytes(lumen_test::png_bytes(width, height), DataSource::Network)
}

pub fn fetch_error() -> FetchResult {
    FetchResult::error(ImageError::FetchError("503 Service Unavailable".into()))
}

/// Records the events of all requests, rendered like `Success(network)`.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn factory(&self) -> Arc<dyn EventListenerFactory> {
        let events = Arc::clone(&self.events);
        let listener: Arc<dyn EventListener> =
            Arc::new(move |event: &ImageLoadEvent| events.lock().unwrap().push(event.to_string()));
        Arc::new(SharedListenerFactory(listener))
    }

    /// Returns and clears the recorded events.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}
