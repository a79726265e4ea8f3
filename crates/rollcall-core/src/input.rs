//! Caller input decoding and pixel helpers — base64/data-URL payloads,
//! grayscale conversion, face-region cropping.

use crate::types::BoundingBox;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, GrayImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("undecodable image: {0}")]
    Undecodable(#[from] image::ImageError),
    #[error("empty image payload")]
    Empty,
    #[error("box {x},{y} {width}x{height} lies outside the {image_width}x{image_height} image")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// An image as it arrives from a caller.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded file bytes (PNG, JPEG, ...).
    Encoded(Vec<u8>),
    /// Base64 text, optionally carrying a `data:<mime>;base64,` prefix.
    Base64(String),
    /// Already decoded pixels.
    Decoded(DynamicImage),
}

impl ImageInput {
    pub fn decode(self) -> Result<DynamicImage, ImageError> {
        match self {
            ImageInput::Encoded(bytes) => decode_bytes(&bytes),
            ImageInput::Base64(payload) => decode_base64(&payload),
            ImageInput::Decoded(image) => {
                if image.width() == 0 || image.height() == 0 {
                    return Err(ImageError::Empty);
                }
                Ok(image)
            }
        }
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Decoded(image)
    }
}

/// Decode encoded image bytes, sniffing the container format.
pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::Empty);
    }
    Ok(image)
}

/// Decode a base64 image payload. Browser captures arrive as data URLs
/// (`data:image/jpeg;base64,...`); everything up to the first comma is dropped.
pub fn decode_base64(payload: &str) -> Result<DynamicImage, ImageError> {
    let body = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(ImageError::Empty);
    }
    let bytes = STANDARD.decode(compact.as_bytes())?;
    decode_bytes(&bytes)
}

/// Convert any decoded image to 8-bit luma.
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => other.to_luma8(),
    }
}

/// Copy the pixels under `bbox` out of `gray`, clipped to the image bounds.
pub fn crop(gray: &GrayImage, bbox: &BoundingBox) -> Result<GrayImage, ImageError> {
    let (w, h) = gray.dimensions();
    let out_of_bounds = ImageError::OutOfBounds {
        x: bbox.x,
        y: bbox.y,
        width: bbox.width,
        height: bbox.height,
        image_width: w,
        image_height: h,
    };
    if bbox.x >= w || bbox.y >= h {
        return Err(out_of_bounds);
    }
    let width = bbox.width.min(w - bbox.x);
    let height = bbox.height.min(h - bbox.y);
    if width == 0 || height == 0 {
        return Err(out_of_bounds);
    }
    Ok(image::imageops::crop_imm(gray, bbox.x, bbox.y, width, height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_base64_data_url() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])));
        let payload = format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(&img)));
        let decoded = decode_base64(&payload).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_decode_base64_plain_with_newlines() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([7])));
        let mut encoded = STANDARD.encode(png_bytes(&img));
        encoded.insert(8, '\n');
        let decoded = decode_base64(&encoded).unwrap();
        assert_eq!(decoded.to_luma8().get_pixel(1, 1).0, [7]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_base64("data:image/png;base64,!!!"), Err(ImageError::InvalidBase64(_))));
        assert!(matches!(decode_bytes(b"not an image"), Err(ImageError::Undecodable(_))));
        assert!(matches!(decode_bytes(&[]), Err(ImageError::Empty)));
        assert!(matches!(decode_base64("data:image/png;base64,"), Err(ImageError::Empty)));
    }

    #[test]
    fn test_grayscale_of_neutral_rgb_keeps_value() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([90, 90, 90])));
        let gray = to_grayscale(&img);
        assert!(gray.pixels().all(|p| p.0 == [90]));
    }

    #[test]
    fn test_crop_clips_to_bounds() {
        let gray = GrayImage::from_fn(10, 10, |x, y| Luma([(x + 10 * y) as u8]));
        let region = crop(&gray, &BoundingBox::new(6, 7, 10, 10)).unwrap();
        assert_eq!(region.dimensions(), (4, 3));
        assert_eq!(region.get_pixel(0, 0).0, [76]);
    }

    #[test]
    fn test_crop_outside_image() {
        let gray = GrayImage::new(10, 10);
        assert!(matches!(
            crop(&gray, &BoundingBox::new(10, 0, 5, 5)),
            Err(ImageError::OutOfBounds { .. })
        ));
    }
}
