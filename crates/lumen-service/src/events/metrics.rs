use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::metric;
use crate::types::{DataSource, ImageRequest};

use super::{EventListener, EventListenerFactory, ImageLoadEvent};

/// Timings and cache behavior of a single request, reconstructed from its events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadMetrics {
    pub model: String,
    pub memory_cache_hit: bool,
    pub disk_cache_hit: bool,
    pub disk_read_duration: Option<Duration>,
    pub disk_write_duration: Option<Duration>,
    pub fetch_duration: Option<Duration>,
    pub decode_duration: Option<Duration>,
    pub total_duration: Option<Duration>,
    pub data_source: Option<DataSource>,
    pub failed: bool,
    pub cancelled: bool,
}

#[derive(Default)]
struct Shared {
    last: Mutex<Option<LoadMetrics>>,
    in_flight: AtomicUsize,
}

/// Aggregates request timings purely from the event stream, and reports them to statsd.
///
/// This is an [`EventListenerFactory`]: every request gets its own [`RequestMetricsListener`],
/// so concurrent requests for the same model do not interfere. The metrics of the most recently
/// finished request are available through [`last_request`](Self::last_request).
#[derive(Clone, Default)]
pub struct MetricsEventListener {
    shared: Arc<Shared>,
}

impl MetricsEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the listener observing a single request.
    pub fn listener(&self) -> RequestMetricsListener {
        RequestMetricsListener {
            metrics: Mutex::new(None),
            shared: Arc::clone(&self.shared),
        }
    }

    /// The metrics of the most recently finished request.
    pub fn last_request(&self) -> Option<LoadMetrics> {
        lock(&self.shared.last).clone()
    }

    /// The number of requests that were started but did not finish yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MetricsEventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEventListener")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl EventListenerFactory for MetricsEventListener {
    fn create(&self, _request: &ImageRequest) -> Option<Arc<dyn EventListener>> {
        Some(Arc::new(self.listener()))
    }
}

/// Accumulates the [`LoadMetrics`] of one request, see [`MetricsEventListener`].
pub struct RequestMetricsListener {
    /// `None` until the request started.
    metrics: Mutex<Option<LoadMetrics>>,
    shared: Arc<Shared>,
}

impl EventListener for RequestMetricsListener {
    fn on_event(&self, event: &ImageLoadEvent) {
        report(event);

        let mut current = lock(&self.metrics);
        if let ImageLoadEvent::Started { .. } = event {
            if current.is_none() {
                self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            }
            *current = Some(LoadMetrics {
                model: event.model().to_owned(),
                ..Default::default()
            });
            return;
        }

        let Some(metrics) = current.as_mut() else {
            return;
        };
        match *event {
            ImageLoadEvent::MemoryCacheHit { .. } => metrics.memory_cache_hit = true,
            ImageLoadEvent::DiskCacheHit { duration, .. } => {
                metrics.disk_cache_hit = true;
                metrics.disk_read_duration = Some(duration);
            }
            ImageLoadEvent::DiskCacheWrite { duration, .. } => {
                metrics.disk_write_duration = Some(duration)
            }
            ImageLoadEvent::FetchCompleted { duration, .. } => {
                metrics.fetch_duration = Some(duration)
            }
            ImageLoadEvent::DecodeCompleted { duration, .. } => {
                metrics.decode_duration = Some(duration)
            }
            ImageLoadEvent::Success {
                data_source,
                duration,
                ..
            } => {
                metrics.data_source = Some(data_source);
                metrics.total_duration = Some(duration);
            }
            ImageLoadEvent::Failure { duration, .. } => {
                metrics.failed = true;
                metrics.total_duration = Some(duration);
            }
            ImageLoadEvent::Cancelled { duration, .. } => {
                metrics.cancelled = true;
                metrics.total_duration = Some(duration);
            }
            _ => {}
        }

        if event.is_terminal() {
            let finished = current.take();
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            *lock(&self.shared.last) = finished;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn report(event: &ImageLoadEvent) {
    match event {
        ImageLoadEvent::Started { .. } => metric!(counter("images.access") += 1),
        ImageLoadEvent::MemoryCacheHit { .. } => metric!(counter("images.memory.hit") += 1),
        ImageLoadEvent::DiskCacheHit { duration, .. } => {
            metric!(counter("images.disk.hit") += 1);
            metric!(timer("images.disk.read") = *duration);
        }
        ImageLoadEvent::DiskCacheWrite { duration, .. } => {
            metric!(counter("images.disk.write") += 1);
            metric!(timer("images.disk.write.duration") = *duration);
        }
        ImageLoadEvent::FetchCompleted {
            duration,
            data_source,
            ..
        } => metric!(timer("images.fetch") = *duration, "source" => data_source.as_str()),
        ImageLoadEvent::DecodeCompleted { duration, .. } => {
            metric!(timer("images.decode") = *duration)
        }
        ImageLoadEvent::Success {
            duration,
            data_source,
            ..
        } => metric!(
            timer("images.load.duration") = *duration,
            "status" => "success",
            "source" => data_source.as_str(),
        ),
        ImageLoadEvent::Failure {
            duration, error, ..
        } => metric!(
            timer("images.load.duration") = *duration,
            "status" => "failure",
            "error" => error.metrics_tag(),
        ),
        ImageLoadEvent::Cancelled { duration, .. } => {
            metric!(timer("images.load.duration") = *duration, "status" => "cancelled")
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(model: &str, source: DataSource) -> Vec<ImageLoadEvent> {
        let model: Arc<str> = Arc::from(model);
        vec![
            ImageLoadEvent::Started {
                model: model.clone(),
            },
            ImageLoadEvent::FetchStarted {
                model: model.clone(),
            },
            ImageLoadEvent::FetchCompleted {
                model: model.clone(),
                data_source: source,
                duration: Duration::from_millis(30),
            },
            ImageLoadEvent::DecodeStarted {
                model: model.clone(),
            },
            ImageLoadEvent::DecodeCompleted {
                model: model.clone(),
                duration: Duration::from_millis(7),
            },
            ImageLoadEvent::Success {
                model,
                data_source: source,
                duration: Duration::from_millis(40),
            },
        ]
    }

    fn memory_hit(model: &str) -> Vec<ImageLoadEvent> {
        let model: Arc<str> = Arc::from(model);
        vec![
            ImageLoadEvent::Started {
                model: model.clone(),
            },
            ImageLoadEvent::MemoryCacheHit {
                model: model.clone(),
            },
            ImageLoadEvent::Success {
                model,
                data_source: DataSource::Memory,
                duration: Duration::from_millis(1),
            },
        ]
    }

    #[test]
    fn test_reconstructs_timings() {
        let metrics = MetricsEventListener::new();
        let listener = metrics.create(&ImageRequest::new("img://A")).unwrap();
        for event in events("img://A", DataSource::Network) {
            listener.on_event(&event);
        }

        let last = metrics.last_request().unwrap();
        assert_eq!(last.model, "img://A");
        assert_eq!(last.fetch_duration, Some(Duration::from_millis(30)));
        assert_eq!(last.decode_duration, Some(Duration::from_millis(7)));
        assert_eq!(last.total_duration, Some(Duration::from_millis(40)));
        assert_eq!(last.data_source, Some(DataSource::Network));
        assert!(!last.memory_cache_hit);
        assert!(!last.failed);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn test_memory_hit() {
        let metrics = MetricsEventListener::new();
        let listener = metrics.listener();
        let events = memory_hit("img://A");
        listener.on_event(&events[0]);
        assert_eq!(metrics.in_flight(), 1);
        for event in &events[1..] {
            listener.on_event(event);
        }

        let last = metrics.last_request().unwrap();
        assert!(last.memory_cache_hit);
        assert_eq!(last.fetch_duration, None);
        assert_eq!(last.data_source, Some(DataSource::Memory));
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn test_interleaved_requests() {
        let metrics = MetricsEventListener::new();
        let (first, second) = (metrics.listener(), metrics.listener());
        let a = events("img://A", DataSource::Network);
        let b = events("img://B", DataSource::Disk);
        for (a, b) in a.iter().zip(&b) {
            first.on_event(a);
            second.on_event(b);
        }

        let last = metrics.last_request().unwrap();
        assert_eq!(last.model, "img://B");
        assert_eq!(last.data_source, Some(DataSource::Disk));
    }

    #[test]
    fn test_same_model_requests_are_separate() {
        let metrics = MetricsEventListener::new();
        let request = ImageRequest::new("img://A");
        let network = metrics.create(&request).unwrap();
        let memory = metrics.create(&request).unwrap();
        let fetched = events("img://A", DataSource::Network);
        let hit = memory_hit("img://A");

        network.on_event(&fetched[0]);
        memory.on_event(&hit[0]);
        assert_eq!(metrics.in_flight(), 2);
        for event in &fetched[1..] {
            network.on_event(event);
        }
        assert_eq!(metrics.in_flight(), 1);
        assert_eq!(metrics.last_request().unwrap().data_source, Some(DataSource::Network));

        for event in &hit[1..] {
            memory.on_event(event);
        }
        let last = metrics.last_request().unwrap();
        assert!(last.memory_cache_hit);
        assert_eq!(last.fetch_duration, None);
        assert_eq!(last.data_source, Some(DataSource::Memory));
        assert_eq!(metrics.in_flight(), 0);
    }
}
