//! Post-decode transformations.

use std::fmt;

use image::imageops::FilterType;

use crate::decode::DecodedImage;
use crate::error::ImageError;
use crate::types::Size;

/// A transformation applied to a decoded image before it is cached.
///
/// The [`key`](Transformation::key) contributes to both the memory and the disk cache key, so it
/// has to be stable and must uniquely describe the transformation including its parameters.
pub trait Transformation: Send + Sync + fmt::Debug {
    fn key(&self) -> String;

    fn transform(&self, image: DecodedImage) -> Result<DecodedImage, ImageError>;
}

/// Converts an image to grayscale.
#[derive(Debug, Clone, Copy)]
pub struct Grayscale;

impl Transformation for Grayscale {
    fn key(&self) -> String {
        "grayscale".into()
    }

    fn transform(&self, image: DecodedImage) -> Result<DecodedImage, ImageError> {
        Ok(DecodedImage::new(image.image().grayscale()))
    }
}

/// Resizes an image to exactly the given size, ignoring its aspect ratio.
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    size: Size,
}

impl Resize {
    pub fn new(size: Size) -> Self {
        Self { size }
    }
}

impl Transformation for Resize {
    fn key(&self) -> String {
        format!("resize({})", self.size)
    }

    fn transform(&self, image: DecodedImage) -> Result<DecodedImage, ImageError> {
        if self.size.is_empty() {
            return Err(ImageError::Unsupported(format!(
                "cannot resize to {}",
                self.size
            )));
        }
        let resized = image
            .into_inner()
            .resize_exact(self.size.width, self.size.height, FilterType::Triangle);
        Ok(DecodedImage::new(resized))
    }
}
