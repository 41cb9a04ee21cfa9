use image::DynamicImage;
use std::sync::Arc;

use crate::error::FeedError;

/// A decoded thumbnail, shared between every caller that asked for it.
#[derive(Debug, Clone)]
pub struct DecodedImage(Arc<DynamicImage>);

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.0
    }

    /// Whether both handles point at the same cached image.
    pub fn ptr_eq(&self, other: &DecodedImage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Decodes PNG, JPEG, GIF or WebP bytes, guessing the format from the content.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, FeedError> {
    let image = image::load_from_memory(bytes)?;
    Ok(DecodedImage(Arc::new(image)))
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(pixels)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
    bytes
}
