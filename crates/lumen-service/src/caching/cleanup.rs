use std::path::Path;

use anyhow::{Result, anyhow};
use tokio::fs;

use crate::config::Config;
use crate::metric;

use super::disk::{ScannedFile, catch_not_found, scan_directory};

/// The outcome of a [`cleanup`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Entry function for the cleanup command.
///
/// This cleans up the image cache in the configured `cache_dir`: leftover temporary files and
/// anything not named like a cache entry are removed, and the oldest entries are evicted until
/// the cache fits into its configured size.
/// If `dry_run` is `true`, no files will actually be deleted.
pub async fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let directory = config.cache_dir("images").ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    cleanup_directory(&directory, config.caches.disk.max_size, dry_run).await
}

pub(super) async fn cleanup_directory(
    directory: &Path,
    max_size: u64,
    dry_run: bool,
) -> Result<CleanupStats> {
    tracing::info!("Cleaning up `{}`", directory.display());
    let scan = scan_directory(directory).await?;

    let mut stats = CleanupStats::default();
    let mut total: u64 = scan.entries.iter().map(|(_, file)| file.size).sum();

    for file in scan.temp_files.iter().chain(&scan.foreign) {
        try_remove(file, &mut stats, dry_run).await;
    }

    // entries are sorted oldest first
    for (_, file) in &scan.entries {
        if total > max_size {
            total -= file.size;
            try_remove(file, &mut stats, dry_run).await;
        } else {
            stats.retained_files += 1;
            stats.retained_bytes += file.size;
        }
    }

    tracing::info!("Cleaning up `{}` complete", directory.display());
    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} files, totaling {} bytes",
        stats.removed_files,
        stats.removed_bytes
    );

    metric!(gauge("caches.size.files") = stats.retained_files as u64);
    metric!(gauge("caches.size.bytes") = stats.retained_bytes);
    metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
    metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

    Ok(stats)
}

async fn try_remove(file: &ScannedFile, stats: &mut CleanupStats, dry_run: bool) {
    tracing::debug!("Removing `{}`", file.path.display());
    if !dry_run {
        let result = match fs::metadata(&file.path).await {
            Ok(metadata) if metadata.is_dir() => catch_not_found(fs::remove_dir_all(&file.path)).await,
            _ => catch_not_found(fs::remove_file(&file.path)).await,
        };
        if let Err(e) = result {
            sentry::with_scope(
                |scope| scope.set_extra("path", file.path.display().to_string().into()),
                || tracing::error!("Failed to clean cache file: {:?}", e),
            );
            stats.retained_files += 1;
            stats.retained_bytes += file.size;
            return;
        }
    }
    stats.removed_files += 1;
    stats.removed_bytes += file.size;
}
