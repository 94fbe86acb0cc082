//! JPEG decoding for MJPEG streams, backed by the `image` crate.

use image::ImageFormat;

use crate::error::{CameraError, Result};
use crate::traits::{DecodedImage, DecodedPixels, Decoder};

/// Decoder for MJPEG frames producing packed RGB.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl Decoder for ImageDecoder {
    fn decode(&self, data: &[u8], width: u32, height: u32) -> Result<DecodedImage> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|err| CameraError::DecodeError(err.to_string()))?;

        if image.width() != width || image.height() != height {
            return Err(CameraError::DecodeError(format!(
                "JPEG is {}x{}, stream mode is {width}x{height}",
                image.width(),
                image.height()
            )));
        }

        Ok(DecodedImage {
            width,
            height,
            pixels: DecodedPixels::Rgb24(image.to_rgb8().into_raw()),
        })
    }
}
