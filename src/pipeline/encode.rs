//! Image encoding for the vision request, and decoding of uploaded images.
//!
//! Pages are sent as lossless PNG: JPEG artefacts around 6 pt title-block
//! text are enough to turn `S-201` into `5-201`. `detail: "high"` asks
//! GPT-4-class models for the full tile budget so small print survives.

use crate::error::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as a base64 PNG ready for the vision API.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {}x{} page → {} bytes base64", img.width(), img.height(), b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Decode an uploaded photo or scan (PNG/JPEG) for the single-page path.
pub fn decode_upload(bytes: &[u8]) -> Result<DynamicImage, IngestError> {
    image::load_from_memory(bytes).map_err(|e| IngestError::ImageDecode {
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        // Round-trips through the uploaded-image decoder.
        let back = decode_upload(&decoded).unwrap();
        assert_eq!((back.width(), back.height()), (10, 10));
    }

    #[test]
    fn garbage_upload_is_decode_error() {
        let err = decode_upload(b"definitely not an image").unwrap_err();
        assert!(matches!(err, IngestError::ImageDecode { .. }));
    }
}
