//! Decoding of encoded image bytes into [`DecodedImage`]s.

use std::fmt;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::ImageError;
use crate::types::Size;

/// A decoded bitmap.
///
/// The loader treats this as an opaque buffer, it only ever looks at its dimensions and its
/// size in bytes, which is what the memory caches are bounded by.
#[derive(Clone)]
pub struct DecodedImage {
    image: DynamicImage,
}

impl DecodedImage {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    /// A fully transparent RGBA image of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(DynamicImage::new_rgba8(width, height))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    /// The number of bytes of pixel data held by this image.
    pub fn size_bytes(&self) -> u64 {
        self.image.as_bytes().len() as u64
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_inner(self) -> DynamicImage {
        self.image
    }

    /// Downsamples the image to fit into `target`, see [`fit_size`].
    pub fn fit_into(self, target: Option<Size>) -> Self {
        Self::new(downsample(self.image, target))
    }

    /// Encodes the image as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.image.color())
            .finish()
    }
}

/// Returns the largest size with the aspect ratio of `size` that fits into `bounds`.
///
/// Images are never scaled up, so if `size` already fits it is returned unchanged.
pub fn fit_size(size: Size, bounds: Size) -> Size {
    if size.is_empty() || bounds.is_empty() {
        return size;
    }
    if size.width <= bounds.width && size.height <= bounds.height {
        return size;
    }

    let ratio = f64::min(
        bounds.width as f64 / size.width as f64,
        bounds.height as f64 / size.height as f64,
    );
    Size::new(
        ((size.width as f64 * ratio).round() as u32).max(1),
        ((size.height as f64 * ratio).round() as u32).max(1),
    )
}

/// Decodes image bytes with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    /// Guesses the mime type of encoded image bytes from their magic bytes.
    pub fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
        image::guess_format(bytes).ok().map(|format| format.to_mime_type())
    }

    /// Decodes `bytes`, downsampling the result to fit into `target` if given.
    ///
    /// This is CPU bound and should be run on the blocking pool.
    pub fn decode(&self, bytes: &[u8], target: Option<Size>) -> Result<DecodedImage, ImageError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(ImageError::from_std_error)?;
        if reader.format().is_none() {
            return Err(ImageError::Malformed("unknown image format".into()));
        }

        // reading from memory cannot fail, an I/O error here means truncated data
        let image = reader.decode().map_err(|err| match err {
            image::ImageError::IoError(err) => ImageError::Malformed(err.to_string()),
            other => other.into(),
        })?;
        Ok(DecodedImage::new(downsample(image, target)))
    }
}

fn downsample(image: DynamicImage, target: Option<Size>) -> DynamicImage {
    let Some(target) = target else {
        return image;
    };
    let original = Size::new(image.width(), image.height());
    let fitted = fit_size(original, target);
    if fitted == original {
        return image;
    }
    image.resize_exact(fitted.width, fitted.height, FilterType::Triangle)
}
