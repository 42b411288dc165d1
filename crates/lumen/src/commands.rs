use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use lumen_service::caching::{self, CleanupStats};
use lumen_service::config::Config;
use lumen_service::events::{EventListener, ImageLoadEvent, SharedListenerFactory};
use lumen_service::subsampling::{IntRect, Offset, Phase, Transform};
use lumen_service::{
    DataSource, ImageLoader, ImageLoaderBuilder, ImageRequest, ImageResult, Size,
};
use serde::Serialize;

use crate::cli::{LoadArgs, TilesArgs};

/// The outcome of `lumen load`.
#[derive(Debug, Serialize)]
struct LoadOutput {
    model: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_source: Option<DataSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration: String,
    events: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TileOutput {
    bounds: IntRect,
    sample_size: u32,
    loaded: bool,
}

/// The outcome of `lumen tiles`.
#[derive(Debug, Serialize)]
struct TilesOutput {
    image_size: Size,
    base_sample_size: u32,
    sample_size: u32,
    phase: Phase,
    tiles: Vec<TileOutput>,
}

#[derive(Debug, Serialize)]
struct CleanupOutput {
    dry_run: bool,
    removed_files: usize,
    removed_bytes: u64,
    retained_files: usize,
    retained_bytes: u64,
}

impl CleanupOutput {
    fn new(stats: CleanupStats, dry_run: bool) -> Self {
        Self {
            dry_run,
            removed_files: stats.removed_files,
            removed_bytes: stats.removed_bytes,
            retained_files: stats.retained_files,
            retained_bytes: stats.retained_bytes,
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    // sub-millisecond precision is noise
    let millis = Duration::from_millis(duration.as_millis() as u64);
    humantime::format_duration(millis).to_string()
}

/// Loads a single image and prints the result along with every event of the request.
pub async fn load(config: &Config, args: LoadArgs) -> Result<()> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let listener: Arc<dyn EventListener> = {
        let events = Arc::clone(&events);
        Arc::new(move |event: &ImageLoadEvent| {
            tracing::debug!(%event, "image load event");
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.to_string());
        })
    };

    let loader = ImageLoaderBuilder::from_config(config)
        .await?
        .event_listener_factory(Arc::new(SharedListenerFactory(listener)))
        .build()?;

    let mut request = ImageRequest::new(args.uri.as_str());
    if let Some(size) = args.size() {
        request = request.with_size(size);
    }
    let model = request.model.id();

    let result = loader.execute(request).await;
    let events = std::mem::take(&mut *events.lock().unwrap_or_else(PoisonError::into_inner));

    let output = match &result {
        ImageResult::Success(success) => LoadOutput {
            model,
            status: "success",
            size: Some(success.image.size()),
            data_source: Some(success.data_source),
            error: None,
            duration: format_duration(success.duration),
            events,
        },
        ImageResult::Failure(failure) => LoadOutput {
            model,
            status: "failure",
            size: None,
            data_source: None,
            error: Some(failure.message()),
            duration: format_duration(failure.duration),
            events,
        },
        ImageResult::Loading => bail!("the loader returned an unfinished result"),
    };
    print_json(&output)?;

    match result {
        ImageResult::Success(success) => {
            if let Some(path) = args.output {
                let png = success.image.encode_png()?;
                tokio::fs::write(&path, png)
                    .await
                    .with_context(|| format!("failed to write `{}`", path.display()))?;
            }
            Ok(())
        }
        ImageResult::Failure(failure) => Err(failure.error.into()),
        ImageResult::Loading => Ok(()),
    }
}

/// Prints the tiles that are visible for the given viewport, zoom and pan.
///
/// This waits for all visible tiles to finish decoding.
pub async fn tiles(config: &Config, args: TilesArgs) -> Result<()> {
    let loader = ImageLoader::from_config(config).await?;
    let state = loader
        .subsampling(&ImageRequest::new(args.path.as_str()))
        .await?;

    state.initialize(args.viewport).await?;
    let transform = Transform::new(args.zoom, Offset::new(args.offset_x, args.offset_y));
    state.update_visible_tiles(transform);

    let mut snapshots = state.subscribe();
    let snapshot = snapshots
        .wait_for(|snapshot| snapshot.phase == Phase::BaseReady)
        .await
        .context("tile state was closed")?
        .clone();
    state.close();

    let grid = state.grid().context("tile grid was not generated")?;
    let output = TilesOutput {
        image_size: grid.image_size,
        base_sample_size: grid.base_sample_size(),
        sample_size: snapshot.sample_size,
        phase: snapshot.phase,
        tiles: snapshot
            .tiles
            .iter()
            .map(|tile| TileOutput {
                bounds: tile.bounds(),
                sample_size: tile.sample_size(),
                loaded: tile.bitmap.is_some(),
            })
            .collect(),
    };
    print_json(&output)
}

/// Cleans up the disk cache, see [`caching::cleanup`].
pub async fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let stats = caching::cleanup(config, dry_run).await?;
    print_json(&CleanupOutput::new(stats, dry_run))
}
