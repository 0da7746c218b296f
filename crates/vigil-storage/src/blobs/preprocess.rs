//! Image thumbnails for stored bodies

use std::io::Cursor;

use image::{GenericImageView, ImageFormat};
use tracing::debug;

/// Image bodies larger than this are candidates for thumbnailing (15 KB)
pub const IMAGE_THUMBNAIL_THRESHOLD: usize = 15 * 1024;

/// Scale an encoded image down to fit `max_pixel_size` and re-encode as PNG
///
/// Returns `None` when the data does not decode as an image or is already
/// small enough.
pub fn make_thumbnail(data: &[u8], max_pixel_size: u32) -> Option<Vec<u8>> {
    let image = image::load_from_memory(data).ok()?;
    let (width, height) = image.dimensions();
    if width <= max_pixel_size && height <= max_pixel_size {
        return None;
    }
    let thumbnail = image.thumbnail(max_pixel_size, max_pixel_size);
    let mut out = Vec::new();
    if let Err(e) = thumbnail.write_to(&mut Cursor::new(&mut out), ImageFormat::Png) {
        debug!(error = %e, "Failed to encode thumbnail");
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    #[test]
    fn test_large_image_is_scaled() {
        let thumb = make_thumbnail(&png(1024, 512), 256).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (256, 128));
    }

    #[test]
    fn test_small_image_is_kept() {
        assert!(make_thumbnail(&png(100, 80), 256).is_none());
    }

    #[test]
    fn test_not_an_image() {
        assert!(make_thumbnail(b"definitely not a png", 256).is_none());
    }
}
