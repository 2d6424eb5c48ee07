//! Image decoding collaborator
//!
//! The engine only moves bytes. When a manager is given a decoder, the final
//! payload of every operation is run through it and the result travels with
//! the completion.

use crate::error::DownloadError;
use image::{DynamicImage, ImageFormat};

/// A decoded bitmap plus the container format it came from
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub format: Option<ImageFormat>,
    pub image: DynamicImage,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Turns downloaded bytes into an image
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, DownloadError>;
}

/// Decoder backed by the `image` crate (jpeg, png, gif, webp)
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, DownloadError> {
        if data.is_empty() {
            return Err(DownloadError::Decode("empty payload".to_string()));
        }
        let format = image::guess_format(data).ok();
        let image =
            image::load_from_memory(data).map_err(|e| DownloadError::Decode(e.to_string()))?;
        Ok(DecodedImage { format, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let buffer: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(buffer)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let decoded = ImageCrateDecoder.decode(&png_bytes(3, 2)).unwrap();
        assert_eq!(decoded.format, Some(ImageFormat::Png));
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = ImageCrateDecoder.decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DownloadError::Decode(_)));
        assert!(ImageCrateDecoder.decode(&[]).is_err());
    }

    #[test]
    fn test_truncated_png_fails() {
        let bytes = png_bytes(16, 16);
        assert!(ImageCrateDecoder.decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
