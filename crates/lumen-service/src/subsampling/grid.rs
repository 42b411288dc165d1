use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::decode::DecodedImage;
use crate::types::Size;

use super::geometry::IntRect;

/// Identifies a tile: a region of the source image, decoded at a sample size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileKey {
    pub bounds: IntRect,
    pub sample_size: u32,
}

impl TileKey {
    pub const fn new(bounds: IntRect, sample_size: u32) -> Self {
        Self {
            bounds,
            sample_size,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.bounds, self.sample_size)
    }
}

/// A tile as it is published to the display.
#[derive(Debug, Clone)]
pub struct Tile {
    pub key: TileKey,
    pub bitmap: Option<Arc<DecodedImage>>,
    /// Whether this is the low resolution tile covering the whole image.
    pub is_base: bool,
    pub is_visible: bool,
    pub is_loading: bool,
}

impl Tile {
    pub fn bounds(&self) -> IntRect {
        self.key.bounds
    }

    pub fn sample_size(&self) -> u32 {
        self.key.sample_size
    }
}

/// All tiles of an image for one viewport size.
///
/// The base tile covers the whole image at the base sample size, the one at which the whole
/// image fits into the viewport. For every power of two below that, the foreground holds a grid
/// of tiles covering the image without gaps or overlaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub image_size: Size,
    pub viewport_size: Size,
    pub base: TileKey,
    pub foreground: BTreeMap<u32, Vec<TileKey>>,
}

impl TileGrid {
    /// Generates the tiles of an image of `image_size` shown in `viewport_size`.
    ///
    /// At sample size `n`, each tile covers `tile_size * n` source pixels per edge, so every
    /// decoded tile is at most `tile_size` pixels wide and high. Tiles at the right and bottom
    /// edges are clipped to the image.
    pub fn generate(image_size: Size, viewport_size: Size, tile_size: u32) -> Self {
        let viewport = Size::new(viewport_size.width.max(1), viewport_size.height.max(1));
        let ratio = f64::max(
            image_size.width as f64 / viewport.width as f64,
            image_size.height as f64 / viewport.height as f64,
        );
        let base_sample_size = power_of_two_at_least(ratio);
        let tile_size = tile_size.max(1);

        let mut foreground = BTreeMap::new();
        let mut sample_size = base_sample_size / 2;
        while sample_size >= 1 {
            let edge = tile_size.saturating_mul(sample_size);
            foreground.insert(sample_size, tiles(image_size, edge, sample_size));
            sample_size /= 2;
        }

        Self {
            image_size,
            viewport_size,
            base: TileKey::new(IntRect::from_size(image_size), base_sample_size),
            foreground,
        }
    }

    pub fn base_sample_size(&self) -> u32 {
        self.base.sample_size
    }

    /// An upper bound for the decoded bytes of the foreground tiles visible at once.
    ///
    /// At any sample size the visible part of the image is at most one viewport of decoded
    /// pixels, which intersects at most one more tile per row and column than fit into it.
    pub fn visible_tiles_bytes(&self, tile_size: u32) -> u64 {
        let tile_size = u64::from(tile_size.max(1));
        let across = u64::from(self.viewport_size.width.max(1)).div_ceil(tile_size) + 1;
        let down = u64::from(self.viewport_size.height.max(1)).div_ceil(tile_size) + 1;
        across * down * tile_size * tile_size * 4
    }

    /// The foreground tiles at `sample_size` that intersect `rect`, in row-major order.
    pub fn tiles_in(&self, sample_size: u32, rect: &IntRect) -> Vec<TileKey> {
        self.foreground
            .get(&sample_size)
            .map(|tiles| {
                tiles
                    .iter()
                    .filter(|tile| tile.bounds.intersects(rect))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn tiles(image_size: Size, edge: u32, sample_size: u32) -> Vec<TileKey> {
    let mut tiles = Vec::new();
    let mut top = 0;
    while top < image_size.height {
        let bottom = top.saturating_add(edge).min(image_size.height);
        let mut left = 0;
        while left < image_size.width {
            let right = left.saturating_add(edge).min(image_size.width);
            tiles.push(TileKey::new(IntRect::new(left, top, right, bottom), sample_size));
            left = right;
        }
        top = bottom;
    }
    tiles
}

/// The smallest power of two that is at least `value`, and at least `1`.
fn power_of_two_at_least(value: f64) -> u32 {
    let mut power = 1u32;
    while (power as f64) < value && power < 1 << 30 {
        power *= 2;
    }
    power
}

/// The sample size at which an image shown at `effective_scale` is decoded.
///
/// This is the smallest power of two of at least `1 / effective_scale`, clamped to
/// `[1, base_sample_size]`.
pub fn calculate_sample_size_for_zoom(effective_scale: f32, base_sample_size: u32) -> u32 {
    if !(effective_scale > 0.0) {
        return base_sample_size.max(1);
    }
    power_of_two_at_least(1.0 / effective_scale as f64).clamp(1, base_sample_size.max(1))
}
