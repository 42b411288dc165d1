//! The [`ImageLoader`], tying the caches, fetchers, decoder and interceptors together.
//!
//! Every request first runs through the interceptor chain. At its end sits the pipeline stage,
//! which consults the memory cache, then the disk cache, and finally fetches and decodes the
//! image, writing the result back to both cache tiers.
//!
//! The terminal event of a request is emitted by the loader once the whole chain has finished,
//! so that interceptors re-running the pipeline, like the
//! [`RetryInterceptor`](crate::interceptor::RetryInterceptor), still produce exactly one
//! `Success` or `Failure` per request.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheKey, CachedImage, DiskCache, DiskKey, LruMemoryCache, MemoryCache, MemoryKey,
    TwoTierMemoryCache,
};
use crate::config::{Config, MemoryCacheConfig, TilingConfig};
use crate::decode::{DecodedImage, ImageDecoder, fit_size};
use crate::error::ImageError;
use crate::events::{EventEmitter, EventListenerFactory, ImageLoadEvent};
use crate::fetch::{FetchResult, FilesystemFetcher, HttpFetcher, ImageFetcher, InlineFetcher};
use crate::interceptor::{Chain, HeaderInterceptor, Interceptor, Terminal};
use crate::subsampling::{ImageRegionDecoder, SubSamplingState};
use crate::types::{DataSource, ImageRequest, ImageResult, Size, SuccessResult};
use crate::utils::futures::CallOnDrop;
use crate::utils::http::{FetchTimeouts, create_client};

/// Configures and creates an [`ImageLoader`].
#[derive(Default)]
pub struct ImageLoaderBuilder {
    memory_cache: Option<Arc<dyn MemoryCache>>,
    disk_cache: Option<DiskCache>,
    fetchers: Vec<Arc<dyn ImageFetcher>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    listener_factory: Option<Arc<dyn EventListenerFactory>>,
    http_client: Option<reqwest::Client>,
    timeouts: FetchTimeouts,
    tiling: TilingConfig,
}

impl ImageLoaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with the caches, timeouts and default headers of `config`.
    ///
    /// This opens the disk cache if a `cache_dir` is configured.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let memory = &config.caches.memory;
        let memory_cache: Arc<dyn MemoryCache> = if memory.weak_references {
            Arc::new(TwoTierMemoryCache::new(memory.max_size))
        } else {
            Arc::new(LruMemoryCache::<MemoryKey>::new(memory.max_size))
        };

        let mut builder = Self::new()
            .memory_cache(memory_cache)
            .timeouts(FetchTimeouts::from_config(config))
            .tiling(config.tiling);

        if let Some(directory) = config.cache_dir("images") {
            let disk_cache = DiskCache::open(directory.clone(), config.caches.disk.max_size)
                .await
                .with_context(|| {
                    format!("failed to open disk cache at `{}`", directory.display())
                })?;
            builder = builder.disk_cache(disk_cache);
        }

        if !config.default_headers.is_empty() {
            let headers = HeaderInterceptor::new(config.default_headers.clone());
            builder = builder.interceptor(Arc::new(headers));
        }

        Ok(builder)
    }

    pub fn memory_cache(mut self, cache: Arc<dyn MemoryCache>) -> Self {
        self.memory_cache = Some(cache);
        self
    }

    pub fn disk_cache(mut self, cache: DiskCache) -> Self {
        self.disk_cache = Some(cache);
        self
    }

    /// Registers a custom fetcher. Custom fetchers are consulted before the built-in ones, in
    /// the order they were registered.
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    /// Appends an interceptor. The first interceptor is the outermost one.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn event_listener_factory(mut self, factory: Arc<dyn EventListenerFactory>) -> Self {
        self.listener_factory = Some(factory);
        self
    }

    /// Uses `client` for network fetches instead of creating one.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn timeouts(mut self, timeouts: FetchTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tiling(mut self, tiling: TilingConfig) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn build(self) -> Result<ImageLoader> {
        let client = match self.http_client {
            Some(client) => client,
            None => create_client(&self.timeouts).context("failed to create http client")?,
        };

        let mut fetchers = self.fetchers;
        fetchers.push(Arc::new(InlineFetcher));
        fetchers.push(Arc::new(FilesystemFetcher));
        fetchers.push(Arc::new(HttpFetcher::new(client, self.timeouts)));

        let memory_cache = self.memory_cache.unwrap_or_else(|| {
            Arc::new(TwoTierMemoryCache::new(MemoryCacheConfig::default().max_size))
        });

        Ok(ImageLoader {
            inner: Arc::new(LoaderInner {
                memory_cache,
                disk_cache: self.disk_cache,
                fetchers,
                interceptors: self.interceptors,
                listener_factory: self.listener_factory,
                decoder: ImageDecoder,
                tiling: self.tiling,
                enqueued: Mutex::default(),
            }),
        })
    }
}

#[derive(Default)]
struct EnqueuedRequests {
    next_id: u64,
    by_tag: HashMap<Arc<str>, HashMap<u64, CancellationToken>>,
}

struct LoaderInner {
    memory_cache: Arc<dyn MemoryCache>,
    disk_cache: Option<DiskCache>,
    fetchers: Vec<Arc<dyn ImageFetcher>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    listener_factory: Option<Arc<dyn EventListenerFactory>>,
    decoder: ImageDecoder,
    tiling: TilingConfig,
    enqueued: Mutex<EnqueuedRequests>,
}

impl LoaderInner {
    fn enqueued(&self) -> MutexGuard<'_, EnqueuedRequests> {
        self.enqueued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetcher(&self, request: &ImageRequest) -> Result<&dyn ImageFetcher, ImageError> {
        self.fetchers
            .iter()
            .find(|fetcher| fetcher.handles(&request.model))
            .map(|fetcher| fetcher.as_ref())
            .ok_or_else(|| {
                ImageError::Unsupported(format!("no fetcher for `{}`", request.model))
            })
    }
}

/// Loads images.
///
/// This is a cheap handle, clones share the same caches and configuration.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

impl fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("memory_size", &self.inner.memory_cache.size())
            .field("disk_cache", &self.inner.disk_cache)
            .field("fetchers", &self.inner.fetchers)
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

impl ImageLoader {
    pub fn builder() -> ImageLoaderBuilder {
        ImageLoaderBuilder::new()
    }

    /// Creates a loader as configured by `config`, see [`ImageLoaderBuilder::from_config`].
    pub async fn from_config(config: &Config) -> Result<Self> {
        ImageLoaderBuilder::from_config(config).await?.build()
    }

    pub fn memory_cache(&self) -> &Arc<dyn MemoryCache> {
        &self.inner.memory_cache
    }

    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.inner.disk_cache.as_ref()
    }

    pub fn tiling(&self) -> &TilingConfig {
        &self.inner.tiling
    }

    /// Loads an image, returning the final result.
    ///
    /// Dropping the returned future cancels the request, which emits a `Cancelled` event.
    pub async fn execute(&self, request: ImageRequest) -> ImageResult {
        let started = Instant::now();
        let listener = self
            .inner
            .listener_factory
            .as_ref()
            .and_then(|factory| factory.create(&request));
        let emitter = Arc::new(EventEmitter::new(Arc::from(request.model.id()), listener));
        emitter.emit(|model| ImageLoadEvent::Started { model });

        let mut cancelled = CallOnDrop::new({
            let emitter = Arc::clone(&emitter);
            move || {
                emitter.finish(|model| ImageLoadEvent::Cancelled {
                    model,
                    duration: started.elapsed(),
                })
            }
        });

        let stage = PipelineStage {
            inner: &self.inner,
            emitter: &emitter,
        };
        let result = Chain::new(request, &self.inner.interceptors, &stage)
            .run()
            .await;
        cancelled.disarm();

        let duration = started.elapsed();
        match result {
            ImageResult::Success(mut success) => {
                success.duration = duration;
                success.is_complete = true;
                let data_source = success.data_source;
                emitter.finish(|model| ImageLoadEvent::Success {
                    model,
                    data_source,
                    duration,
                });
                ImageResult::Success(success)
            }
            ImageResult::Failure(failure) if failure.error.is_cancelled() => {
                emitter.finish(|model| ImageLoadEvent::Cancelled { model, duration });
                ImageResult::failure(ImageError::Cancelled, duration)
            }
            ImageResult::Failure(failure) => {
                let error = failure.error.clone();
                emitter.finish(|model| ImageLoadEvent::Failure {
                    model,
                    error,
                    duration,
                });
                ImageResult::failure(failure.error, duration)
            }
            ImageResult::Loading => {
                tracing::error!(model = %emitter.model(), "interceptor returned an unfinished result");
                emitter.finish(|model| ImageLoadEvent::Failure {
                    model,
                    error: ImageError::InternalError,
                    duration,
                });
                ImageResult::failure(ImageError::InternalError, duration)
            }
        }
    }

    /// Loads an image, reporting its progress as a stream.
    ///
    /// The stream yields [`ImageResult::Loading`], then the placeholder image if the request
    /// names one that is in the memory cache, and finally exactly one terminal result. A
    /// cancelled load ends the stream without a terminal result. Dropping the stream cancels the
    /// load.
    pub fn load(&self, request: ImageRequest) -> BoxStream<'static, ImageResult> {
        let placeholder = request
            .placeholder_key
            .as_ref()
            .filter(|_| request.memory_cache_policy.read_enabled())
            .and_then(|key| self.inner.memory_cache.get(key))
            .map(|cached| {
                ImageResult::Success(SuccessResult {
                    image: cached.image,
                    data_source: DataSource::Memory,
                    duration: Duration::ZERO,
                    is_complete: false,
                })
            });

        let loader = self.clone();
        let head = stream::iter(std::iter::once(ImageResult::Loading).chain(placeholder));
        let terminal = stream::once(async move { loader.execute(request).await })
            .filter(|result| future::ready(!matches!(result.error(), Some(ImageError::Cancelled))));

        head.chain(terminal).boxed()
    }

    /// Spawns a load onto the runtime, returning a handle that can cancel it.
    ///
    /// Requests with a [tag](ImageRequest::tag) can also be cancelled in bulk with
    /// [`cancel_tag`](Self::cancel_tag). Dropping the handle does not cancel the load.
    pub fn enqueue(&self, request: ImageRequest) -> Disposable {
        let token = CancellationToken::new();
        let registration = request
            .tag
            .clone()
            .map(|tag| self.register(tag, token.clone()));

        let loader = self.clone();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let _registration = registration;
            let started = Instant::now();
            tokio::select! {
                result = loader.execute(request) => result,
                _ = cancelled.cancelled() => {
                    ImageResult::failure(ImageError::Cancelled, started.elapsed())
                }
            }
        });

        Disposable { token, handle }
    }

    /// Cancels all enqueued requests with the given tag, returning how many were cancelled.
    pub fn cancel_tag(&self, tag: &str) -> usize {
        let tokens = self.inner.enqueued().by_tag.remove(tag).unwrap_or_default();
        for token in tokens.values() {
            token.cancel();
        }
        tracing::debug!(tag, cancelled = tokens.len(), "cancelled tagged requests");
        tokens.len()
    }

    fn register(&self, tag: Arc<str>, token: CancellationToken) -> TagRegistration {
        let mut enqueued = self.inner.enqueued();
        let id = enqueued.next_id;
        enqueued.next_id += 1;
        enqueued
            .by_tag
            .entry(Arc::clone(&tag))
            .or_default()
            .insert(id, token);

        TagRegistration {
            inner: Arc::clone(&self.inner),
            tag,
            id,
        }
    }

    /// Opens the image of `request` for region decoding.
    ///
    /// The image is fetched by the first fetcher that handles it, and decoded completely at its
    /// original size. Interceptors and caches are not involved.
    pub async fn region_decoder(
        &self,
        request: &ImageRequest,
    ) -> Result<ImageRegionDecoder, ImageError> {
        let concurrency = self.inner.tiling.decoder_concurrency;
        match self.inner.fetcher(request)?.fetch(request).await {
            FetchResult::Success { bytes, .. } => {
                ImageRegionDecoder::from_bytes(bytes, concurrency).await
            }
            FetchResult::Decoded { image, .. } => Ok(ImageRegionDecoder::new(
                Arc::unwrap_or_clone(image),
                concurrency,
            )),
            FetchResult::Error { error } => Err(error),
        }
    }

    /// Opens the image of `request` for tiled display.
    pub async fn subsampling(&self, request: &ImageRequest) -> Result<SubSamplingState, ImageError> {
        let decoder = self.region_decoder(request).await?;
        Ok(SubSamplingState::new(Arc::new(decoder), self.inner.tiling))
    }
}

/// Removes an enqueued request from the tag registry once it finished.
struct TagRegistration {
    inner: Arc<LoaderInner>,
    tag: Arc<str>,
    id: u64,
}

impl Drop for TagRegistration {
    fn drop(&mut self) {
        let mut enqueued = self.inner.enqueued();
        if let Some(tokens) = enqueued.by_tag.get_mut(&self.tag) {
            tokens.remove(&self.id);
            if tokens.is_empty() {
                enqueued.by_tag.remove(&self.tag);
            }
        }
    }
}

/// A handle to an [enqueued](ImageLoader::enqueue) request.
#[derive(Debug)]
pub struct Disposable {
    token: CancellationToken,
    handle: JoinHandle<ImageResult>,
}

impl Disposable {
    /// Cancels the request, unless it finished already.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the request to finish.
    pub async fn result(self) -> ImageResult {
        match self.handle.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => {
                ImageResult::failure(ImageError::Cancelled, Duration::ZERO)
            }
            Err(error) => ImageResult::failure(ImageError::from_std_error(error), Duration::ZERO),
        }
    }
}

/// An image produced by the pipeline, before it is written to the caches.
struct Loaded {
    image: Arc<DecodedImage>,
    data_source: DataSource,
    /// The bytes to write to the disk cache, if any.
    encoded: Option<Bytes>,
}

/// The end of the interceptor chain, for a single request.
struct PipelineStage<'a> {
    inner: &'a LoaderInner,
    emitter: &'a EventEmitter,
}

impl Terminal for PipelineStage<'_> {
    fn execute(&self, request: ImageRequest) -> BoxFuture<'_, ImageResult> {
        async move {
            let start = Instant::now();
            match self.load(&request).await {
                Ok(success) => ImageResult::Success(success),
                Err(error) => ImageResult::failure(error, start.elapsed()),
            }
        }
        .boxed()
    }
}

impl PipelineStage<'_> {
    async fn load(&self, request: &ImageRequest) -> Result<SuccessResult, ImageError> {
        let start = Instant::now();
        let key = CacheKey::from_request(request);

        if request.memory_cache_policy.read_enabled() {
            if let Some(cached) = self.inner.memory_cache.get(&key.memory) {
                tracing::trace!(key = %key.memory, "memory cache hit");
                self.emitter
                    .emit(|model| ImageLoadEvent::MemoryCacheHit { model });
                return Ok(SuccessResult {
                    image: cached.image,
                    data_source: DataSource::Memory,
                    duration: start.elapsed(),
                    is_complete: true,
                });
            }
        }

        let loaded = match self.read_disk(request, &key.disk).await {
            Some(image) => Loaded {
                image,
                data_source: DataSource::Disk,
                encoded: None,
            },
            None => self.fetch(request).await?,
        };

        if request.memory_cache_policy.write_enabled() {
            let cached = CachedImage::new(Arc::clone(&loaded.image), loaded.data_source);
            self.inner.memory_cache.set(key.memory, cached);
            self.emitter
                .emit(|model| ImageLoadEvent::MemoryCacheWrite { model });
        }

        if let Some(encoded) = loaded.encoded {
            self.write_disk(&key.disk, &encoded).await;
        }

        Ok(SuccessResult {
            image: loaded.image,
            data_source: loaded.data_source,
            duration: start.elapsed(),
            is_complete: true,
        })
    }

    /// Reads and decodes the disk cache entry for `key`.
    ///
    /// Every failure is treated as a miss. Entries that fail to decode are removed.
    async fn read_disk(&self, request: &ImageRequest, key: &DiskKey) -> Option<Arc<DecodedImage>> {
        let disk = self.inner.disk_cache.as_ref()?;
        if !request.disk_cache_policy.read_enabled() {
            return None;
        }

        let start = Instant::now();
        let bytes = match read_entry(disk, key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::trace!(%key, "disk cache miss");
                return None;
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "failed to read from disk cache");
                return None;
            }
        };
        self.emitter.emit(|model| ImageLoadEvent::DiskCacheHit {
            model,
            duration: start.elapsed(),
        });

        // entries are stored with all transformations applied
        match self.decode(Bytes::from(bytes), request.size).await {
            Ok(image) => Some(image),
            Err(error) => {
                tracing::warn!(%key, %error, "discarding unreadable disk cache entry");
                if let Err(err) = disk.remove(key).await {
                    tracing::error!(error = &err as &dyn Error, "failed to remove cache entry");
                }
                None
            }
        }
    }

    async fn fetch(&self, request: &ImageRequest) -> Result<Loaded, ImageError> {
        let fetcher = self.inner.fetcher(request)?;

        self.emitter
            .emit(|model| ImageLoadEvent::FetchStarted { model });
        let start = Instant::now();
        let fetched = fetcher.fetch(request).await;

        let completed = |data_source| {
            self.emitter.emit(|model| ImageLoadEvent::FetchCompleted {
                model,
                data_source,
                duration: start.elapsed(),
            })
        };

        let transformed = !request.transformations.is_empty();
        let (image, raw, data_source) = match fetched {
            FetchResult::Success {
                bytes, data_source, ..
            } => {
                completed(data_source);
                // transformations see the full image, the result is downsampled afterwards
                let target = if transformed { None } else { request.size };
                let image = self.decode(bytes.clone(), target).await?;
                (image, Some(bytes), data_source)
            }
            FetchResult::Decoded {
                image, data_source, ..
            } => {
                completed(data_source);
                (image, None, data_source)
            }
            FetchResult::Error { error } => {
                tracing::debug!(model = %request.model, %error, "failed to fetch image");
                return Err(error);
            }
        };

        let write_disk = request.disk_cache_policy.write_enabled()
            && self.inner.disk_cache.is_some()
            && data_source != DataSource::Inline;

        let needs_fit = request
            .size
            .is_some_and(|target| fit_size(image.size(), target) != image.size());
        let (image, encoded) = if transformed {
            transform(image, request, write_disk).await?
        } else if needs_fit {
            (transform(image, request, false).await?.0, raw)
        } else {
            (image, raw)
        };

        Ok(Loaded {
            image,
            data_source,
            encoded: encoded.filter(|_| write_disk),
        })
    }

    async fn decode(&self, bytes: Bytes, target: Option<Size>) -> Result<Arc<DecodedImage>, ImageError> {
        self.emitter
            .emit(|model| ImageLoadEvent::DecodeStarted { model });
        let start = Instant::now();

        let decoder = self.inner.decoder;
        let image = run_blocking(move || decoder.decode(&bytes, target)).await?;

        self.emitter.emit(|model| ImageLoadEvent::DecodeCompleted {
            model,
            duration: start.elapsed(),
        });
        Ok(Arc::new(image))
    }

    async fn write_disk(&self, key: &DiskKey, bytes: &[u8]) {
        let Some(disk) = &self.inner.disk_cache else {
            return;
        };

        let start = Instant::now();
        match write_entry(disk, key, bytes).await {
            Ok(true) => self.emitter.emit(|model| ImageLoadEvent::DiskCacheWrite {
                model,
                duration: start.elapsed(),
            }),
            Ok(false) => tracing::trace!(%key, "disk cache entry is being written already"),
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "failed to write to disk cache")
            }
        }
    }
}

async fn read_entry(disk: &DiskCache, key: &DiskKey) -> io::Result<Option<Vec<u8>>> {
    let Some(mut snapshot) = disk.get(key).await? else {
        return Ok(None);
    };
    snapshot.read_to_end().await.map(Some)
}

/// Writes `bytes` to the disk cache, returning `false` if another write to `key` is in progress.
async fn write_entry(disk: &DiskCache, key: &DiskKey, bytes: &[u8]) -> io::Result<bool> {
    let Some(mut editor) = disk.edit(key).await? else {
        return Ok(false);
    };
    editor.write_all(bytes).await?;
    editor.commit().await?;
    Ok(true)
}

/// Applies the transformations of `request` and fits the result into the requested size.
///
/// With `encode`, the transformed image is also encoded as PNG for the disk cache.
async fn transform(
    image: Arc<DecodedImage>,
    request: &ImageRequest,
    encode: bool,
) -> Result<(Arc<DecodedImage>, Option<Bytes>), ImageError> {
    let transformations = request.transformations.clone();
    let target = request.size;

    run_blocking(move || {
        let mut image = Arc::unwrap_or_clone(image);
        for transformation in &transformations {
            image = transformation.transform(image)?;
        }
        let encoded = match encode {
            true => Some(Bytes::from(image.encode_png()?)),
            false => None,
        };
        Ok((Arc::new(image.fit_into(target)), encoded))
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T, ImageError>
where
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(error) if error.is_cancelled() => Err(ImageError::Cancelled),
        Err(error) => Err(ImageError::from_std_error(error)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::events::{EventListener, SharedListenerFactory};
    use crate::transform::Grayscale;
    use crate::types::{CachePolicy, ImageModel};

    use super::*;

    /// Serves `img://` models from a script of canned results.
    #[derive(Debug, Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<FetchResult>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<FetchResult>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn png(width: u32, height: u32) -> Self {
            Self::new(vec![FetchResult::bytes(
                lumen_test::png_bytes(width, height),
                DataSource::Network,
            )])
        }

        fn calls(&self) -> usize {
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
                    // the last entry is repeated forever
                    1 => script[0].clone(),
                    _ => script.pop_front().unwrap(),
                }
            }
            .boxed()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn EventListenerFactory>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn EventListener> = {
            let events = Arc::clone(&events);
            Arc::new(move |event: &ImageLoadEvent| events.lock().unwrap().push(event.to_string()))
        };
        (events, Arc::new(SharedListenerFactory(listener)))
    }

    fn loader(fetcher: Arc<ScriptedFetcher>) -> ImageLoader {
        ImageLoader::builder()
            .fetcher(fetcher)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_caches_in_memory() {
        lumen_test::setup();
        let fetcher = Arc::new(ScriptedFetcher::png(64, 32));
        let loader = loader(fetcher.clone());

        let request = ImageRequest::new("img://A").with_size(Size::new(32, 32));
        let ImageResult::Success(first) = loader.execute(request.clone()).await else {
            panic!("expected success");
        };
        assert_eq!(first.data_source, DataSource::Network);
        assert_eq!(first.image.size(), Size::new(32, 16));
        assert!(first.is_complete);

        let ImageResult::Success(second) = loader.execute(request).await else {
            panic!("expected success");
        };
        assert_eq!(second.data_source, DataSource::Memory);
        assert!(Arc::ptr_eq(&first.image, &second.image));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(loader.memory_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_policy_disabled() {
        let fetcher = Arc::new(ScriptedFetcher::png(8, 8));
        let loader = loader(fetcher.clone());

        let request =
            ImageRequest::new("img://A").with_memory_cache_policy(CachePolicy::Disabled);
        assert!(loader.execute(request.clone()).await.is_success());
        assert!(loader.execute(request).await.is_success());

        assert_eq!(fetcher.calls(), 2);
        assert!(loader.memory_cache().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_model() {
        let loader = ImageLoader::builder().build().unwrap();
        let result = loader.execute(ImageRequest::new("ftp://example.com/a.png")).await;
        assert!(matches!(result.error(), Some(ImageError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_malformed_bytes_are_not_cached() {
        let cache_dir = lumen_test::tempdir();
        let disk = DiskCache::open(cache_dir.path(), 1 << 20).await.unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![FetchResult::bytes(
            &b"not an image"[..],
            DataSource::Network,
        )]));
        let loader = ImageLoader::builder()
            .fetcher(fetcher)
            .disk_cache(disk.clone())
            .build()
            .unwrap();

        let result = loader.execute(ImageRequest::new("img://A")).await;
        assert!(matches!(result.error(), Some(ImageError::Malformed(_))));
        assert!(loader.memory_cache().is_empty());
        assert!(disk.is_empty());
    }

    #[tokio::test]
    async fn test_decoded_results_skip_the_decoder() {
        let (events, factory) = recorder();
        let image = Arc::new(DecodedImage::blank(4, 4));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![FetchResult::decoded(
            Arc::clone(&image),
            DataSource::Network,
        )]));
        let loader = ImageLoader::builder()
            .fetcher(fetcher)
            .event_listener_factory(factory)
            .build()
            .unwrap();

        let result = loader.execute(ImageRequest::new("img://A")).await;
        assert!(Arc::ptr_eq(result.image().unwrap(), &image));
        assert!(!events.lock().unwrap().iter().any(|e| e.starts_with("Decode")));
    }

    #[tokio::test]
    async fn test_transformed_images_are_stored_as_png() {
        let cache_dir = lumen_test::tempdir();
        let disk = DiskCache::open(cache_dir.path(), 1 << 20).await.unwrap();
        let fetcher = Arc::new(ScriptedFetcher::png(16, 16));
        let loader = ImageLoader::builder()
            .fetcher(fetcher.clone())
            .disk_cache(disk.clone())
            .build()
            .unwrap();

        let request = ImageRequest::new("img://A")
            .with_transformation(Arc::new(Grayscale))
            .with_size(Size::new(8, 8));
        let result = loader.execute(request.clone()).await;
        assert_eq!(result.image().unwrap().size(), Size::new(8, 8));

        let key = CacheKey::from_request(&request);
        let mut snapshot = disk.get(&key.disk).await.unwrap().unwrap();
        let bytes = snapshot.read_to_end().await.unwrap();
        let stored = ImageDecoder.decode(&bytes, None).unwrap();
        assert_eq!(stored.size(), Size::new(16, 16));
        assert!(stored.image().color().channel_count() <= 2);

        // a different size is served from disk, without fetching again
        loader.memory_cache().clear();
        let request = request.with_size(Size::new(4, 4));
        let ImageResult::Success(success) = loader.execute(request).await else {
            panic!("expected success");
        };
        assert_eq!(success.data_source, DataSource::Disk);
        assert_eq!(success.image.size(), Size::new(4, 4));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_load_stream() {
        let fetcher = Arc::new(ScriptedFetcher::png(8, 8));
        let loader = loader(fetcher);

        let thumbnail = ImageRequest::new("img://A").with_size(Size::new(2, 2));
        loader.execute(thumbnail.clone()).await;

        let request = ImageRequest::new("img://A")
            .with_placeholder_key(CacheKey::from_request(&thumbnail).memory);
        let results: Vec<_> = loader.load(request).collect().await;

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], ImageResult::Loading));
        let ImageResult::Success(placeholder) = &results[1] else {
            panic!("expected a placeholder");
        };
        assert!(!placeholder.is_complete);
        assert_eq!(placeholder.image.size(), Size::new(2, 2));
        assert!(results[2].is_terminal());
        assert_eq!(results[2].image().unwrap().size(), Size::new(8, 8));
    }

    #[tokio::test]
    async fn test_dropped_load_is_cancelled() {
        let (events, factory) = recorder();
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedFetcher::png(8, 8)
        });
        let loader = ImageLoader::builder()
            .fetcher(fetcher)
            .event_listener_factory(factory)
            .build()
            .unwrap();

        let mut stream = loader.load(ImageRequest::new("img://A"));
        assert!(matches!(stream.next().await, Some(ImageResult::Loading)));
        let timeout = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(timeout.is_err());
        drop(stream);

        assert_eq!(*events.lock().unwrap(), ["Started", "FetchStarted", "Cancelled"]);
    }

    #[tokio::test]
    async fn test_enqueue_and_dispose() {
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedFetcher::png(8, 8)
        });
        let loader = loader(fetcher);

        let disposable = loader.enqueue(ImageRequest::new("img://A"));
        disposable.dispose();
        assert!(disposable.is_disposed());

        let result = disposable.result().await;
        assert_eq!(result.error(), Some(&ImageError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_tag() {
        let (events, factory) = recorder();
        let fetcher = Arc::new(ScriptedFetcher {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedFetcher::png(8, 8)
        });
        let loader = ImageLoader::builder()
            .fetcher(fetcher.clone())
            .event_listener_factory(factory)
            .build()
            .unwrap();

        let gallery: Vec<_> = ["img://A", "img://B"]
            .into_iter()
            .map(|model| loader.enqueue(ImageRequest::new(model).with_tag("gallery")))
            .collect();
        let other = loader.enqueue(ImageRequest::new("img://C").with_tag("other"));

        // let the requests reach the fetcher
        while fetcher.calls() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(loader.cancel_tag("gallery"), 2);
        assert_eq!(loader.cancel_tag("gallery"), 0);
        for disposable in gallery {
            assert_eq!(disposable.result().await.error(), Some(&ImageError::Cancelled));
        }
        assert!(!other.is_finished());
        other.dispose();
        other.result().await;

        let cancelled = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| *event == "Cancelled")
            .count();
        assert_eq!(cancelled, 3);
        assert!(loader.inner.enqueued().by_tag.is_empty());
    }
}
