//! Tiled display of images that are too large to be decoded at full resolution.
//!
//! The image is first shown as a single low resolution base tile. Once zoomed in, the visible
//! part of the image is covered by foreground tiles decoded at a sample size matching the zoom,
//! see [`SubSamplingState`].
//!
//! ## Metrics
//!
//! - `tiles.base.duration`: The time spent decoding the base tile.
//! - `tiles.load`: Finished foreground tile decodes, tagged with their `status`.
//! - `tiles.cancelled`: Foreground tile decodes cancelled as their tile went out of view.

mod geometry;
mod grid;
mod region;
mod state;

pub use geometry::{IntRect, Offset, Transform, fit_scale, visible_rect};
pub use grid::{Tile, TileGrid, TileKey, calculate_sample_size_for_zoom};
pub use region::{ImageRegionDecoder, RegionDecoder};
pub use state::{Phase, SubSamplingState, TileSnapshot};
