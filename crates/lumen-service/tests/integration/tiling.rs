use std::sync::Arc;
use std::time::Duration;

use lumen_service::subsampling::{
    IntRect, Phase, SubSamplingState, TileGrid, TileSnapshot, Transform,
};
use lumen_service::{ImageLoader, ImageRequest, Size};

use crate::utils::ScriptedFetcher;

#[test]
fn test_grid_covers_image() {
    let image = Size::new(4096, 4096);
    let grid = TileGrid::generate(image, Size::new(512, 512), 256);
    assert_eq!(grid.base_sample_size(), 8);
    assert_eq!(grid.base.bounds, IntRect::from_size(image));

    let counts: Vec<_> = grid
        .foreground
        .iter()
        .map(|(sample_size, tiles)| (*sample_size, tiles.len()))
        .collect();
    assert_eq!(counts, [(1, 256), (2, 64), (4, 16)]);

    for tiles in grid.foreground.values() {
        let area: u64 = tiles.iter().map(|tile| tile.bounds.area()).sum();
        assert_eq!(area, 4096 * 4096);
        for (i, a) in tiles.iter().enumerate() {
            assert!(IntRect::from_size(image).contains(&a.bounds));
            for b in &tiles[i + 1..] {
                assert!(!a.bounds.intersects(&b.bounds), "{a} overlaps {b}");
            }
        }
    }
}

async fn wait_until_idle(state: &SubSamplingState) -> TileSnapshot {
    let mut receiver = state.subscribe();
    let idle = receiver.wait_for(|snapshot| snapshot.phase == Phase::BaseReady);
    let snapshot = tokio::time::timeout(Duration::from_secs(10), idle)
        .await
        .expect("tiles did not finish loading")
        .unwrap()
        .clone();
    snapshot
}

#[tokio::test]
async fn test_zooming_in_refines_tiles() {
    lumen_test::setup();
    let loader = ImageLoader::builder()
        .fetcher(Arc::new(ScriptedFetcher::png(1024, 1024)))
        .build()
        .unwrap();

    let state = loader
        .subsampling(&ImageRequest::new("img://large"))
        .await
        .unwrap();
    state.initialize(Size::new(128, 128)).await.unwrap();
    assert_eq!(state.snapshot().sample_size, 8);

    let mut sample_sizes = Vec::new();
    for scale in [1.0, 2.0, 4.0, 8.0] {
        state.update_visible_tiles(Transform::scale(scale));
        let snapshot = wait_until_idle(&state).await;
        assert!(snapshot.tiles.iter().all(|tile| tile.bitmap.is_some()));
        for tile in &snapshot.tiles {
            let bitmap = tile.bitmap.as_ref().unwrap();
            assert!(bitmap.width() <= 256 && bitmap.height() <= 256);
        }
        sample_sizes.push(snapshot.sample_size);
    }
    assert_eq!(sample_sizes, [8, 4, 2, 1]);

    // zooming out drops the foreground again
    state.update_visible_tiles(Transform::scale(1.0));
    let snapshot = state.snapshot();
    assert!(snapshot.tiles.is_empty());
    assert!(snapshot.base.unwrap().bitmap.is_some());

    state.close();
    assert_eq!(state.loading(), 0);
}
