//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lumen_service::config::Config;
use lumen_service::{Size, logging, metrics};

use crate::commands;

/// Lumen commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load an image through the memory and disk caches, and print the outcome.
    Load(LoadArgs),

    /// Show which tiles of a large image are visible at a zoom level.
    Tiles(TilesArgs),

    /// Clean the disk cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// The image to load: an URL, a path, or a `data:` URI.
    pub uri: String,

    /// The width to fit the image into.
    #[arg(long)]
    pub width: Option<u32>,

    /// The height to fit the image into.
    #[arg(long)]
    pub height: Option<u32>,

    /// Writes the loaded image as PNG to this file.
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl LoadArgs {
    /// The size to fit the image into. A missing dimension is unbounded.
    pub fn size(&self) -> Option<Size> {
        match (self.width, self.height) {
            (None, None) => None,
            (width, height) => Some(Size::new(
                width.unwrap_or(u32::MAX),
                height.unwrap_or(u32::MAX),
            )),
        }
    }
}

#[derive(Debug, Args)]
pub struct TilesArgs {
    /// The image to inspect.
    pub path: String,

    /// The size of the viewport, like `1920x1080`.
    #[arg(long, value_parser = parse_size)]
    pub viewport: Size,

    /// The zoom factor relative to the image fit into the viewport.
    #[arg(long, default_value_t = 1.0)]
    pub zoom: f32,

    /// Horizontal pan in viewport pixels.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub offset_x: f32,

    /// Vertical pan in viewport pixels.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub offset_y: f32,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "lumen", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Parses a size formatted like `640x480`.
fn parse_size(input: &str) -> Result<Size, String> {
    let (width, height) = input
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected `WIDTHxHEIGHT`, got `{input}`"))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid dimension `{value}`: {e}"))
    };
    let size = Size::new(parse(width)?, parse(height)?);
    match size.is_empty() {
        true => Err(format!("`{input}` is empty")),
        false => Ok(size),
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("lumen")
        .enable_all()
        .build()
        .context("failed to create the tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Load(args) => commands::load(&config, args)
                .await
                .context("failed to load the image"),
            Command::Tiles(args) => commands::tiles(&config, args)
                .await
                .context("failed to compute tiles"),
            Command::Cleanup { dry_run } => commands::cleanup(&config, dry_run)
                .await
                .context("failed to clean up caches"),
        }
    })
}
