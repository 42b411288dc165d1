use std::fmt;

use serde::Serialize;

use crate::types::Size;

/// A rectangle in image pixels. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IntRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl IntRect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The rectangle covering an image of the given size.
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &IntRect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    pub fn contains(&self, other: &IntRect) -> bool {
        self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }
}

impl fmt::Display for IntRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{} {}x{}]",
            self.left,
            self.top,
            self.width(),
            self.height()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Offset {
    pub x: f32,
    pub y: f32,
}

impl Offset {
    pub const ZERO: Self = Self::new(0.0, 0.0);

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// The pan and zoom applied to an image that is fit-centered into a viewport.
///
/// The image is first fit into the viewport, preserving its aspect ratio, and centered. It is
/// then scaled by `scale` around the center of the viewport, and finally moved by `offset`
/// viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: f32,
    pub offset: Offset,
}

impl Transform {
    pub const IDENTITY: Self = Self::new(1.0, Offset::ZERO);

    pub const fn new(scale: f32, offset: Offset) -> Self {
        Self { scale, offset }
    }

    pub const fn scale(scale: f32) -> Self {
        Self::new(scale, Offset::ZERO)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// The scale at which an image of `image` size is shown when fit into `viewport`.
pub fn fit_scale(image: Size, viewport: Size) -> f32 {
    if image.is_empty() || viewport.is_empty() {
        return 1.0;
    }
    f32::min(
        viewport.width as f32 / image.width as f32,
        viewport.height as f32 / image.height as f32,
    )
}

/// Computes which part of the image is visible in the viewport under `transform`.
///
/// The result is clamped to the image bounds, and empty if the image was moved out of view.
pub fn visible_rect(image: Size, viewport: Size, transform: Transform) -> IntRect {
    if image.is_empty() || viewport.is_empty() || !(transform.scale > 0.0) {
        return IntRect::default();
    }

    let base = fit_scale(image, viewport);
    let origin_x = (viewport.width as f32 - image.width as f32 * base) / 2.0;
    let origin_y = (viewport.height as f32 - image.height as f32 * base) / 2.0;
    let center_x = viewport.width as f32 / 2.0;
    let center_y = viewport.height as f32 / 2.0;

    // maps a viewport point back into image pixels
    let to_image = |x: f32, y: f32| {
        let x = ((x - transform.offset.x - center_x) / transform.scale + center_x - origin_x) / base;
        let y = ((y - transform.offset.y - center_y) / transform.scale + center_y - origin_y) / base;
        (x, y)
    };

    let (left, top) = to_image(0.0, 0.0);
    let (right, bottom) = to_image(viewport.width as f32, viewport.height as f32);

    let clamp_x = |x: f32| x.clamp(0.0, image.width as f32);
    let clamp_y = |y: f32| y.clamp(0.0, image.height as f32);
    let rect = IntRect::new(
        clamp_x(left).floor() as u32,
        clamp_y(top).floor() as u32,
        clamp_x(right).ceil() as u32,
        clamp_y(bottom).ceil() as u32,
    );

    if rect.is_empty() {
        IntRect::default()
    } else {
        rect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects() {
        let a = IntRect::new(0, 0, 10, 10);
        assert!(a.intersects(&IntRect::new(5, 5, 15, 15)));
        // touching edges do not overlap
        assert!(!a.intersects(&IntRect::new(10, 0, 20, 10)));
        assert!(!a.intersects(&IntRect::default()));
        assert!(a.contains(&IntRect::new(2, 2, 8, 8)));
    }

    #[test]
    fn test_visible_rect_identity() {
        // a wide image, letterboxed in a square viewport
        let image = Size::new(2000, 1000);
        let viewport = Size::new(500, 500);
        let rect = visible_rect(image, viewport, Transform::IDENTITY);
        assert_eq!(rect, IntRect::from_size(image));
    }

    #[test]
    fn test_visible_rect_zoomed() {
        let image = Size::new(1000, 1000);
        let viewport = Size::new(500, 500);

        let rect = visible_rect(image, viewport, Transform::scale(2.0));
        assert_eq!(rect, IntRect::new(250, 250, 750, 750));

        // moving the image to the right reveals its left part
        let rect = visible_rect(image, viewport, Transform::new(2.0, Offset::new(250.0, 0.0)));
        assert_eq!(rect, IntRect::new(0, 250, 500, 750));
    }

    #[test]
    fn test_visible_rect_out_of_view() {
        let image = Size::new(1000, 1000);
        let viewport = Size::new(500, 500);
        let transform = Transform::new(1.0, Offset::new(1000.0, 0.0));
        assert!(visible_rect(image, viewport, transform).is_empty());
    }
}
