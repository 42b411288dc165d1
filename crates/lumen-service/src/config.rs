use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the loader.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "lumen".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-memory image cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Capacity (in bytes) of the strong, bounded tier.
    ///
    /// Defaults to `256 MiB`.
    pub max_size: u64,

    /// Whether images evicted from the bounded tier are kept as weak references.
    ///
    /// A weakly referenced image can be served again for as long as somebody else still holds
    /// on to it, without counting towards `max_size`.
    pub weak_references: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256 * 1024 * 1024,
            weak_references: true,
        }
    }
}

/// Configuration of the on-disk image cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Capacity (in bytes) of the disk cache.
    ///
    /// Defaults to `250 MiB`.
    pub max_size: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 250 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configures the in-memory cache.
    pub memory: MemoryCacheConfig,
    /// Configures the disk cache. Only used when a `cache_dir` is set.
    pub disk: DiskCacheConfig,
}

/// Configuration of the tile sub-sampling engine used for very large images.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of a tile in decoded pixels.
    pub tile_size: u32,
    /// Maximum number of foreground tiles decoded at the same time per image.
    pub max_concurrent_loads: usize,
    /// Below this zoom factor only the base tile is shown.
    pub min_zoom_for_tiles: f32,
    /// Capacity (in bytes) of the per-image tile cache.
    pub tile_cache_size: u64,
    /// Maximum number of concurrent region decodes per decoder.
    pub decoder_concurrency: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            max_concurrent_loads: 2,
            min_zoom_for_tiles: 1.5,
            tile_cache_size: 64 * 1024 * 1024,
            decoder_concurrency: 2,
        }
    }
}

/// The loader configuration, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk cache. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Sizes of the memory and disk caches.
    pub caches: CacheConfigs,

    /// Tuning of the tile sub-sampling engine.
    pub tiling: TilingConfig,

    /// Headers sent with every network request, unless overridden by the request itself.
    pub default_headers: BTreeMap<String, String>,

    /// The timeout for establishing a connection in a fetch.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum duration of a single network fetch.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no disk caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            tiling: TilingConfig::default(),
            default_headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
