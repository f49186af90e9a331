//! Decoding of browser captures: data-URI base64 payloads into RGB images.

use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported image data: {0}")]
    Image(#[from] image::ImageError),
}

/// Strip a `data:image/...;base64,` prefix if present.
pub fn strip_data_uri(payload: &str) -> &str {
    let payload = payload.trim();
    if payload.starts_with("data:") {
        payload.split_once(',').map(|(_, data)| data).unwrap_or("")
    } else {
        payload
    }
}

/// Base64 payload (optionally data-URI wrapped) to raw encoded image bytes.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let data = strip_data_uri(payload);
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(general_purpose::STANDARD.decode(data)?)
}

/// Encoded image bytes (JPEG, PNG, ...) to an 8-bit RGB bitmap.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Full boundary decode of one capture field.
pub fn decode_capture(payload: &str) -> Result<RgbImage, DecodeError> {
    decode_image(&decode_payload(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_data_uri(width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 200, 30]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(buf.into_inner())
        )
    }

    #[test]
    fn decodes_data_uri() {
        let img = decode_capture(&png_data_uri(4, 3)).unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(0, 0), &Rgb([10, 200, 30]));
    }

    #[test]
    fn decodes_bare_base64() {
        let uri = png_data_uri(2, 2);
        let bare = strip_data_uri(&uri).to_string();
        assert_eq!(decode_capture(&bare).unwrap().dimensions(), (2, 2));
    }

    #[test]
    fn rejects_prefix_without_data() {
        assert!(matches!(
            decode_capture("data:image/png;base64"),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(matches!(
            decode_capture("data:image/png;base64,@@@"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn rejects_non_image_bytes() {
        let payload = general_purpose::STANDARD.encode(b"definitely not an image");
        assert!(matches!(decode_capture(&payload), Err(DecodeError::Image(_))));
    }
}
