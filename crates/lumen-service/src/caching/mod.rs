//! # Caching infrastructure
//!
//! Decoding an image is expensive, and fetching it even more so. The loader thus caches images
//! in two layers:
//!
//! - An in-memory layer holding *decoded* images, keyed by a [`MemoryKey`]. It is bounded by the
//!   byte size of the decoded pixel data. By default it is a [`TwoTierMemoryCache`], which keeps
//!   weak references to images that were evicted, giving them a second chance for as long as
//!   they are still in use elsewhere.
//! - A file-system layer holding the *encoded* bytes, keyed by a [`DiskKey`], see [`DiskCache`].
//!   The disk key does not include the target size, so one cached file serves requests for every
//!   size, each hit being decoded to the requested size.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it will try to load the encoded bytes from the file-system, if enabled.
//! - On miss, it will finally fetch the bytes and decode them.
//! - The decoded image is written to the in-memory layer, and the encoded bytes to the
//!   file-system layer.
//!
//! Failures of a cache layer are never surfaced. A layer that cannot be read from is treated as a
//! miss, and a layer that cannot be written to is skipped.
//!
//! ## Metrics
//!
//! - `images.access`: All accesses.
//! - `images.memory.hit`: Accesses served by the in-memory layer.
//! - `images.disk.hit`: Accesses served by the file-system layer.
//! - `images.disk.write`: The number of images written to disk, with the time spent writing in
//!   `images.disk.write.duration`.
//! - `caches.size.files` / `caches.size.bytes`: The size of the disk cache after a cleanup.

use std::sync::Arc;

use crate::decode::DecodedImage;
use crate::types::DataSource;

mod cache_key;
mod cleanup;
mod disk;
mod memory;

#[cfg(test)]
mod tests;

pub use cache_key::{CacheKey, DiskKey, DiskKeyBuilder, MemoryKey};
pub use cleanup::{CleanupStats, cleanup};
pub use disk::{DiskCache, Editor, Snapshot};
pub use memory::{LruMemoryCache, MemoryCache, TwoTierMemoryCache};

/// A decoded image as it is held by the memory caches.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image: Arc<DecodedImage>,
    /// Where the image originally came from.
    pub data_source: DataSource,
    pub size_bytes: u64,
}

impl CachedImage {
    pub fn new(image: Arc<DecodedImage>, data_source: DataSource) -> Self {
        let size_bytes = image.size_bytes();
        Self {
            image,
            data_source,
            size_bytes,
        }
    }
}
