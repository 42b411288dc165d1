//! Observation of the image loading pipeline.
//!
//! Every request emits a sequence of [`ImageLoadEvent`]s to an optional [`EventListener`], which
//! is created per request by the loader's [`EventListenerFactory`]. Listeners are invoked
//! synchronously on the task that runs the request, and only ever see the events by reference:
//! they can observe the pipeline, but never influence it.
//!
//! Every request emits exactly one terminal event, one of [`Success`](ImageLoadEvent::Success),
//! [`Failure`](ImageLoadEvent::Failure) or [`Cancelled`](ImageLoadEvent::Cancelled).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::ImageError;
use crate::types::{DataSource, ImageRequest};

mod metrics;

pub use metrics::{LoadMetrics, MetricsEventListener, RequestMetricsListener};

/// Something that happened while loading an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageLoadEvent {
    Started {
        model: Arc<str>,
    },
    MemoryCacheHit {
        model: Arc<str>,
    },
    MemoryCacheWrite {
        model: Arc<str>,
    },
    DiskCacheHit {
        model: Arc<str>,
        /// Time spent reading the cached bytes.
        duration: Duration,
    },
    DiskCacheWrite {
        model: Arc<str>,
        duration: Duration,
    },
    FetchStarted {
        model: Arc<str>,
    },
    FetchCompleted {
        model: Arc<str>,
        data_source: DataSource,
        duration: Duration,
    },
    DecodeStarted {
        model: Arc<str>,
    },
    DecodeCompleted {
        model: Arc<str>,
        duration: Duration,
    },
    Success {
        model: Arc<str>,
        data_source: DataSource,
        /// The total time since the request was started.
        duration: Duration,
    },
    Failure {
        model: Arc<str>,
        error: ImageError,
        duration: Duration,
    },
    Cancelled {
        model: Arc<str>,
        duration: Duration,
    },
}

impl ImageLoadEvent {
    /// The id of the model that is being loaded.
    pub fn model(&self) -> &str {
        match self {
            Self::Started { model }
            | Self::MemoryCacheHit { model }
            | Self::MemoryCacheWrite { model }
            | Self::DiskCacheHit { model, .. }
            | Self::DiskCacheWrite { model, .. }
            | Self::FetchStarted { model }
            | Self::FetchCompleted { model, .. }
            | Self::DecodeStarted { model }
            | Self::DecodeCompleted { model, .. }
            | Self::Success { model, .. }
            | Self::Failure { model, .. }
            | Self::Cancelled { model, .. } => model,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "Started",
            Self::MemoryCacheHit { .. } => "MemoryCacheHit",
            Self::MemoryCacheWrite { .. } => "MemoryCacheWrite",
            Self::DiskCacheHit { .. } => "DiskCacheHit",
            Self::DiskCacheWrite { .. } => "DiskCacheWrite",
            Self::FetchStarted { .. } => "FetchStarted",
            Self::FetchCompleted { .. } => "FetchCompleted",
            Self::DecodeStarted { .. } => "DecodeStarted",
            Self::DecodeCompleted { .. } => "DecodeCompleted",
            Self::Success { .. } => "Success",
            Self::Failure { .. } => "Failure",
            Self::Cancelled { .. } => "Cancelled",
        }
    }

    /// Whether this event ends a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Failure { .. } | Self::Cancelled { .. }
        )
    }
}

/// A compact, timing independent rendering, like `Success(network)`.
impl fmt::Display for ImageLoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Self::FetchCompleted { data_source, .. } | Self::Success { data_source, .. } => {
                write!(f, "({data_source})")
            }
            Self::Failure { error, .. } => write!(f, "({error})"),
            _ => Ok(()),
        }
    }
}

/// Observes the events of image requests.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ImageLoadEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ImageLoadEvent) + Send + Sync,
{
    fn on_event(&self, event: &ImageLoadEvent) {
        self(event)
    }
}

/// Creates the listener for a single request, or `None` if the request should not be observed.
pub trait EventListenerFactory: Send + Sync {
    fn create(&self, request: &ImageRequest) -> Option<Arc<dyn EventListener>>;
}

impl<F> EventListenerFactory for F
where
    F: Fn(&ImageRequest) -> Option<Arc<dyn EventListener>> + Send + Sync,
{
    fn create(&self, request: &ImageRequest) -> Option<Arc<dyn EventListener>> {
        self(request)
    }
}

/// A factory that hands the same listener to every request.
#[derive(Clone)]
pub struct SharedListenerFactory(pub Arc<dyn EventListener>);

impl EventListenerFactory for SharedListenerFactory {
    fn create(&self, _request: &ImageRequest) -> Option<Arc<dyn EventListener>> {
        Some(Arc::clone(&self.0))
    }
}

/// Forwards every event to a list of listeners, in order.
#[derive(Clone, Default)]
pub struct CompositeEventListener {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl CompositeEventListener {
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }
}

impl EventListener for CompositeEventListener {
    fn on_event(&self, event: &ImageLoadEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// Emits the events of a single request.
///
/// This makes sure that at most one terminal event is ever emitted, no matter how many code
/// paths race to finish the request.
pub(crate) struct EventEmitter {
    model: Arc<str>,
    listener: Option<Arc<dyn EventListener>>,
    finished: AtomicBool,
}

impl EventEmitter {
    pub fn new(model: Arc<str>, listener: Option<Arc<dyn EventListener>>) -> Self {
        Self {
            model,
            listener,
            finished: AtomicBool::new(false),
        }
    }

    pub fn model(&self) -> &Arc<str> {
        &self.model
    }

    /// Builds and emits an event for this request's model.
    pub fn emit(&self, make: impl FnOnce(Arc<str>) -> ImageLoadEvent) {
        let event = make(Arc::clone(&self.model));
        if event.is_terminal() && self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }

    /// Emits the terminal event, unless one was emitted already.
    pub fn finish(&self, make: impl FnOnce(Arc<str>) -> ImageLoadEvent) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };
        listener.on_event(&make(Arc::clone(&self.model)));
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
