use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use image::DynamicImage;
use image::imageops::FilterType;
use tokio::sync::Semaphore;

use crate::decode::{DecodedImage, ImageDecoder};
use crate::error::ImageError;
use crate::types::Size;

use super::geometry::IntRect;

/// Decodes regions of a large image.
pub trait RegionDecoder: Send + Sync {
    /// The size of the full image.
    fn image_size(&self) -> Size;

    /// Decodes `region` of the image, downsampled by `sample_size`.
    ///
    /// Returns `None` once the decoder is closed.
    fn decode_region(
        &self,
        region: IntRect,
        sample_size: u32,
    ) -> BoxFuture<'_, Result<Option<DecodedImage>, ImageError>>;

    /// Releases the decoder. Pending and future decodes return `None`.
    fn close(&self);
}

/// A [`RegionDecoder`] over a fully decoded image.
///
/// This does not decode regions from the encoded source. The whole image is decoded once at full
/// resolution and kept in memory, and every region is cropped from that bitmap and downsampled on
/// the blocking pool, with a bounded number of decodes running at the same time.
///
/// The full decode is subject to the default allocation limit of the `image` crate (512 MiB),
/// which caps the size of the source image at roughly 134 megapixels of RGBA. Larger images fail
/// in [`from_bytes`](Self::from_bytes) with [`ImageError::Unsupported`].
pub struct ImageRegionDecoder {
    image: Arc<DynamicImage>,
    permits: Semaphore,
    closed: AtomicBool,
}

impl ImageRegionDecoder {
    pub fn new(image: DecodedImage, concurrency: usize) -> Self {
        Self {
            image: Arc::new(image.into_inner()),
            permits: Semaphore::new(concurrency.max(1)),
            closed: AtomicBool::new(false),
        }
    }

    /// Decodes `bytes` at full resolution on the blocking pool.
    pub async fn from_bytes(bytes: Bytes, concurrency: usize) -> Result<Self, ImageError> {
        let image = tokio::task::spawn_blocking(move || ImageDecoder.decode(&bytes, None))
            .await
            .map_err(ImageError::from_std_error)??;
        Ok(Self::new(image, concurrency))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn decode(&self, region: IntRect, sample_size: u32) -> Result<Option<DecodedImage>, ImageError> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(None);
        };
        if self.is_closed() {
            return Ok(None);
        }

        let bounds = IntRect::from_size(self.image_size());
        if region.is_empty() || !bounds.contains(&region) {
            return Err(ImageError::Unsupported(format!(
                "region {region} is outside of the image"
            )));
        }

        let image = Arc::clone(&self.image);
        let sample_size = sample_size.max(1);
        let decoded = tokio::task::spawn_blocking(move || {
            let cropped = image.crop_imm(region.left, region.top, region.width(), region.height());
            let width = region.width().div_ceil(sample_size);
            let height = region.height().div_ceil(sample_size);
            let sampled = match sample_size {
                1 => cropped,
                _ => cropped.resize_exact(width, height, FilterType::Triangle),
            };
            DecodedImage::new(sampled)
        })
        .await
        .map_err(ImageError::from_std_error)?;

        // a decode that finished after `close` is discarded
        Ok((!self.is_closed()).then_some(decoded))
    }
}

impl RegionDecoder for ImageRegionDecoder {
    fn image_size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    fn decode_region(
        &self,
        region: IntRect,
        sample_size: u32,
    ) -> BoxFuture<'_, Result<Option<DecodedImage>, ImageError>> {
        self.decode(region, sample_size).boxed()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            tracing::trace!("closed region decoder");
        }
    }
}

impl fmt::Debug for ImageRegionDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRegionDecoder")
            .field("image_size", &self.image_size())
            .field("available_permits", &self.permits.available_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ImageRegionDecoder {
        let image = DynamicImage::ImageRgba8(lumen_test::gradient(512, 256));
        ImageRegionDecoder::new(DecodedImage::new(image), 2)
    }

    #[tokio::test]
    async fn test_decode_region() {
        let decoder = decoder();
        assert_eq!(decoder.image_size(), Size::new(512, 256));

        let tile = decoder
            .decode_region(IntRect::new(256, 0, 512, 256), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tile.size(), Size::new(256, 256));
        // the gradient encodes the source coordinates, the tile starts at x = 256
        let pixel = tile.image().to_rgba8().get_pixel(0, 10).0;
        assert_eq!(pixel, [0, 10, 1, 255]);

        let sampled = decoder
            .decode_region(IntRect::new(0, 0, 511, 256), 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sampled.size(), Size::new(128, 64));
    }

    #[tokio::test]
    async fn test_region_out_of_bounds() {
        let result = decoder()
            .decode_region(IntRect::new(0, 0, 1024, 1024), 1)
            .await;
        assert!(matches!(result, Err(ImageError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_close() {
        let decoder = decoder();
        decoder.close();
        decoder.close();
        assert!(decoder.is_closed());

        let result = decoder
            .decode_region(IntRect::new(0, 0, 16, 16), 1)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_from_bytes() {
        let bytes = Bytes::from(lumen_test::png_bytes(40, 30));
        let decoder = ImageRegionDecoder::from_bytes(bytes, 2).await.unwrap();
        assert_eq!(decoder.image_size(), Size::new(40, 30));

        let err = ImageRegionDecoder::from_bytes(Bytes::from_static(b"garbage"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Malformed(_)));
    }
}
