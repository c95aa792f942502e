//! Decoded image frames.
//!
//! `Frame` is the unit that flows through the pipeline: sources produce it,
//! detectors read it, the evidence store encodes it to JPEG.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Write;
use std::path::Path;

/// JPEG quality for persisted evidence.
pub const EVIDENCE_JPEG_QUALITY: u8 = 90;

/// Decoded RGB8 frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self { image })
    }

    /// Solid-color frame. Mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        }
    }

    /// Decode an image file (PNG or JPEG).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        Ok(Self {
            image: decoded.to_rgb8(),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Encode as baseline JPEG into `writer`.
    pub fn write_jpeg<W: Write>(&self, writer: W) -> image::ImageResult<()> {
        let mut encoder = JpegEncoder::new_with_quality(writer, EVIDENCE_JPEG_QUALITY);
        encoder.encode_image(&self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(2, 2, vec![0u8; 12]).is_ok());
        assert!(Frame::from_rgb(2, 2, vec![0u8; 11]).is_err());
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() -> Result<()> {
        let frame = Frame::filled(32, 16, [200, 10, 10]);
        let mut buf = Vec::new();
        frame.write_jpeg(&mut buf)?;
        let decoded = image::load_from_memory(&buf)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        Ok(())
    }
}
