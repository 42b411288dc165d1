use std::sync::Arc;

use crate::decode::DecodedImage;
use crate::types::{DataSource, ImageRequest, Size};

use super::*;

fn cached(width: u32, height: u32) -> CachedImage {
    CachedImage::new(
        Arc::new(DecodedImage::blank(width, height)),
        DataSource::Network,
    )
}

#[test]
fn test_cached_image_size() {
    let image = cached(10, 20);
    assert_eq!(image.size_bytes, 10 * 20 * 4);
    assert_eq!(image.size_bytes, image.image.size_bytes());
}

#[tokio::test]
async fn test_sizes_share_one_disk_entry() {
    lumen_test::setup();
    let dir = lumen_test::tempdir();
    let disk = DiskCache::open(dir.path(), 1 << 20).await.unwrap();
    let memory = TwoTierMemoryCache::new(1 << 20);

    let small = CacheKey::from_request(&ImageRequest::new("img://A").with_size(Size::new(10, 10)));
    let large = CacheKey::from_request(&ImageRequest::new("img://A").with_size(Size::new(20, 20)));
    assert_ne!(small.memory, large.memory);
    assert_eq!(small.disk, large.disk);

    let mut editor = disk.edit(&small.disk).await.unwrap().unwrap();
    editor.write_all(&lumen_test::png_bytes(40, 40)).await.unwrap();
    editor.commit().await.unwrap();
    memory.set(small.memory.clone(), cached(10, 10));

    // the large size misses in memory, but hits the shared disk entry
    assert!(memory.get(&small.memory).is_some());
    assert!(memory.get(&large.memory).is_none());
    let mut snapshot = disk.get(&large.disk).await.unwrap().unwrap();
    let bytes = snapshot.read_to_end().await.unwrap();
    assert_eq!(bytes, lumen_test::png_bytes(40, 40));
}

#[tokio::test]
async fn test_clearing_memory_keeps_disk() {
    let dir = lumen_test::tempdir();
    let disk = DiskCache::open(dir.path(), 1 << 20).await.unwrap();
    let memory = LruMemoryCache::new(1 << 20);

    let key = CacheKey::from_request(&ImageRequest::new("img://B"));
    let mut editor = disk.edit(&key.disk).await.unwrap().unwrap();
    editor.write_all(b"encoded").await.unwrap();
    editor.commit().await.unwrap();
    memory.set(key.memory.clone(), cached(4, 4));

    memory.clear();
    assert!(memory.is_empty());
    assert!(disk.contains(&key.disk));
    assert_eq!(disk.size(), 7);
}
