use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::caching::{CachedImage, LruMemoryCache};
use crate::config::TilingConfig;
use crate::decode::DecodedImage;
use crate::error::ImageError;
use crate::types::{DataSource, Size};

use super::geometry::{Transform, fit_scale, visible_rect};
use super::grid::{Tile, TileGrid, TileKey, calculate_sample_size_for_zoom};
use super::region::RegionDecoder;

/// The lifecycle of a [`SubSamplingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No viewport is known yet.
    Uninitialized,
    /// The grid is generated, the base tile is being decoded.
    BaseLoading,
    /// The base tile is ready and no foreground tiles are loading.
    BaseReady,
    /// Foreground tiles are being decoded.
    TilesUpdating,
}

/// What is published to the display after every change.
#[derive(Debug, Clone)]
pub struct TileSnapshot {
    pub phase: Phase,
    /// The sample size of the foreground tiles, or the base sample size if there are none.
    pub sample_size: u32,
    pub base: Option<Tile>,
    /// The visible foreground tiles, in row-major order.
    pub tiles: Vec<Tile>,
}

impl TileSnapshot {
    fn uninitialized() -> Self {
        Self {
            phase: Phase::Uninitialized,
            sample_size: 1,
            base: None,
            tiles: Vec::new(),
        }
    }

    /// The number of visible tiles that have a bitmap.
    pub fn loaded_tiles(&self) -> usize {
        self.tiles.iter().filter(|tile| tile.bitmap.is_some()).count()
    }
}

struct TileLoad {
    generation: u64,
    token: CancellationToken,
}

struct State {
    phase: Phase,
    grid: Option<Arc<TileGrid>>,
    viewport: Size,
    base: Option<Arc<DecodedImage>>,
    sample_size: u32,
    visible: Vec<TileKey>,
    loading: HashMap<TileKey, TileLoad>,
    /// Tiles that failed to decode, which are not retried until the next `initialize`.
    failed: HashSet<TileKey>,
    /// Tiles decoded since the last update. They are not restarted when the tile cache evicts
    /// them, only by the next `update_visible_tiles`.
    settled: HashSet<TileKey>,
    next_generation: u64,
}

impl State {
    fn cancel_all(&mut self) {
        for (_, load) in self.loading.drain() {
            load.token.cancel();
            metric!(counter("tiles.cancelled") += 1);
        }
    }

    fn update_phase(&mut self) {
        if self.base.is_none() {
            return;
        }
        self.phase = match self.loading.is_empty() {
            true => Phase::BaseReady,
            false => Phase::TilesUpdating,
        };
    }
}

struct Shared {
    decoder: Arc<dyn RegionDecoder>,
    config: TilingConfig,
    tiles: LruMemoryCache<TileKey>,
    state: Mutex<State>,
    snapshots: watch::Sender<TileSnapshot>,
}

/// Drives the tiled display of a large image.
///
/// After [`initialize`](Self::initialize) decoded the base tile, every call to
/// [`update_visible_tiles`](Self::update_visible_tiles) selects the foreground tiles for the
/// current pan and zoom, starts decoding the missing ones, and cancels decodes of tiles that are
/// no longer visible. Every change is published as a [`TileSnapshot`], see
/// [`subscribe`](Self::subscribe).
///
/// Foreground tiles are decoded on spawned tasks, so this has to be used within a tokio runtime.
#[derive(Clone)]
pub struct SubSamplingState {
    shared: Arc<Shared>,
}

impl fmt::Debug for SubSamplingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SubSamplingState")
            .field("phase", &state.phase)
            .field("viewport", &state.viewport)
            .field("sample_size", &state.sample_size)
            .field("visible", &state.visible.len())
            .field("loading", &state.loading.len())
            .finish()
    }
}

impl SubSamplingState {
    pub fn new(decoder: Arc<dyn RegionDecoder>, config: TilingConfig) -> Self {
        let (snapshots, _) = watch::channel(TileSnapshot::uninitialized());
        let state = State {
            phase: Phase::Uninitialized,
            grid: None,
            viewport: Size::new(0, 0),
            base: None,
            sample_size: 1,
            visible: Vec::new(),
            loading: HashMap::new(),
            failed: HashSet::new(),
            settled: HashSet::new(),
            next_generation: 0,
        };

        Self {
            shared: Arc::new(Shared {
                decoder,
                config,
                tiles: LruMemoryCache::new(config.tile_cache_size),
                state: Mutex::new(state),
                snapshots,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to the published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<TileSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> TileSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn grid(&self) -> Option<Arc<TileGrid>> {
        self.lock().grid.clone()
    }

    /// The number of foreground tiles that are currently being decoded.
    pub fn loading(&self) -> usize {
        self.lock().loading.len()
    }

    pub fn tile_cache(&self) -> &LruMemoryCache<TileKey> {
        &self.shared.tiles
    }

    /// Generates the tile grid for `viewport` and decodes the base tile.
    ///
    /// The tile cache is grown to hold at least one viewport worth of tiles. Calling this again,
    /// for example after the viewport was resized, starts over.
    pub async fn initialize(&self, viewport: Size) -> Result<(), ImageError> {
        let image_size = self.shared.decoder.image_size();
        let tile_size = self.shared.config.tile_size;
        let grid = TileGrid::generate(image_size, viewport, tile_size);
        let base = grid.base;

        let required = grid.visible_tiles_bytes(tile_size);
        if self.shared.tiles.max_size() < required {
            tracing::debug!(
                configured = self.shared.tiles.max_size(),
                required,
                "growing tile cache to fit the viewport"
            );
            self.shared.tiles.resize(required);
        }
        tracing::debug!(
            image = %image_size,
            %viewport,
            base_sample_size = base.sample_size,
            levels = grid.foreground.len(),
            "generated tile grid"
        );

        {
            let mut state = self.lock();
            state.cancel_all();
            state.grid = Some(Arc::new(grid));
            state.viewport = viewport;
            state.base = None;
            state.sample_size = base.sample_size;
            state.visible.clear();
            state.failed.clear();
            state.settled.clear();
            state.phase = Phase::BaseLoading;
            self.publish(&state);
        }

        let start = Instant::now();
        let result = self
            .shared
            .decoder
            .decode_region(base.bounds, base.sample_size)
            .await;

        let mut state = self.lock();
        let current = state.grid.as_ref().map(|grid| grid.base);
        if current != Some(base) || state.viewport != viewport || state.base.is_some() {
            // initialized again in the meantime
            return Ok(());
        }

        match result {
            Ok(Some(image)) => {
                metric!(timer("tiles.base.duration") = start.elapsed());
                state.base = Some(Arc::new(image));
                state.update_phase();
                self.publish(&state);
                Ok(())
            }
            Ok(None) => {
                state.grid = None;
                state.phase = Phase::Uninitialized;
                self.publish(&state);
                Err(ImageError::Cancelled)
            }
            Err(error) => {
                state.grid = None;
                state.phase = Phase::Uninitialized;
                self.publish(&state);
                Err(error)
            }
        }
    }

    /// Selects the visible foreground tiles for `transform` and loads the missing ones.
    ///
    /// Below the configured minimum zoom only the base tile is shown. Loads of tiles that are no
    /// longer visible are cancelled.
    pub fn update_visible_tiles(&self, transform: Transform) {
        let mut state = self.lock();
        let Some(grid) = state.grid.clone() else {
            return;
        };

        let base_sample_size = grid.base_sample_size();
        let (sample_size, visible) = if transform.scale < self.shared.config.min_zoom_for_tiles {
            (base_sample_size, Vec::new())
        } else {
            let effective_scale = fit_scale(grid.image_size, state.viewport) * transform.scale;
            let sample_size = calculate_sample_size_for_zoom(effective_scale, base_sample_size);
            let rect = visible_rect(grid.image_size, state.viewport, transform);
            match sample_size < base_sample_size {
                true => (sample_size, grid.tiles_in(sample_size, &rect)),
                false => (sample_size, Vec::new()),
            }
        };

        let keep: HashSet<TileKey> = visible.iter().copied().collect();
        let stale: Vec<TileKey> = state
            .loading
            .keys()
            .filter(|key| !keep.contains(key))
            .copied()
            .collect();
        for key in stale {
            if let Some(load) = state.loading.remove(&key) {
                tracing::trace!(%key, "cancelling tile load");
                load.token.cancel();
                metric!(counter("tiles.cancelled") += 1);
            }
        }

        state.sample_size = sample_size;
        state.visible = visible;
        state.settled.clear();
        self.start_loads(&mut state);
        state.update_phase();
        self.publish(&state);
    }

    /// Cancels all loads and closes the decoder.
    pub fn close(&self) {
        let mut state = self.lock();
        state.cancel_all();
        state.update_phase();
        self.shared.decoder.close();
        self.publish(&state);
    }

    fn start_loads(&self, state: &mut State) {
        let max_loads = self.shared.config.max_concurrent_loads.max(1);
        let State {
            visible,
            loading,
            failed,
            settled,
            next_generation,
            ..
        } = state;

        for key in visible.iter() {
            if loading.len() >= max_loads {
                break;
            }
            if loading.contains_key(key)
                || failed.contains(key)
                || settled.contains(key)
                || self.shared.tiles.contains(key)
            {
                continue;
            }

            *next_generation += 1;
            let generation = *next_generation;
            let token = CancellationToken::new();
            loading.insert(
                *key,
                TileLoad {
                    generation,
                    token: token.clone(),
                },
            );
            self.spawn_load(*key, generation, token);
        }
    }

    fn spawn_load(&self, key: TileKey, generation: u64, token: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let decoder = Arc::clone(&this.shared.decoder);
            let result = tokio::select! {
                result = decoder.decode_region(key.bounds, key.sample_size) => result,
                _ = token.cancelled() => return,
            };
            this.complete(key, generation, result);
        });
    }

    fn complete(
        &self,
        key: TileKey,
        generation: u64,
        result: Result<Option<DecodedImage>, ImageError>,
    ) {
        let mut state = self.lock();
        match state.loading.get(&key) {
            Some(load) if load.generation == generation => {
                state.loading.remove(&key);
                state.settled.insert(key);
            }
            _ => {
                tracing::trace!(%key, "discarding result of cancelled tile load");
                return;
            }
        }

        match result {
            Ok(Some(image)) => {
                metric!(counter("tiles.load") += 1, "status" => "success");
                let cached = CachedImage::new(Arc::new(image), DataSource::Memory);
                self.shared.tiles.set(key, cached);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%key, %error, "failed to decode tile");
                metric!(counter("tiles.load") += 1, "status" => "failure");
                state.failed.insert(key);
            }
        }

        self.start_loads(&mut state);
        state.update_phase();
        self.publish(&state);
    }

    fn publish(&self, state: &State) {
        let base = state.grid.as_ref().map(|grid| Tile {
            key: grid.base,
            bitmap: state.base.clone(),
            is_base: true,
            is_visible: true,
            is_loading: state.base.is_none() && state.phase == Phase::BaseLoading,
        });

        let tiles = state
            .visible
            .iter()
            .map(|key| Tile {
                key: *key,
                bitmap: self.shared.tiles.get(key).map(|cached| cached.image),
                is_base: false,
                is_visible: true,
                is_loading: state.loading.contains_key(key),
            })
            .collect();

        self.shared.snapshots.send_replace(TileSnapshot {
            phase: state.phase,
            sample_size: state.sample_size,
            base,
            tiles,
        });
    }
}
