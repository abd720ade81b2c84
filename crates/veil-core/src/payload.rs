//! Self-contained image payloads (`data:` URLs) and pixel decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not a data URL")]
    NotDataUrl,
    #[error("data URL is not base64-encoded")]
    NotBase64,
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Parsed `data:` URL header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl<'a> {
    /// Media type including parameters, e.g. `image/svg+xml;veil=placeholder`.
    pub media_type: &'a str,
    pub base64: bool,
    pub data: &'a str,
}

impl<'a> DataUrl<'a> {
    pub fn parse(url: &'a str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        let (media_type, base64) = match header.strip_suffix(";base64") {
            Some(media_type) => (media_type, true),
            None => (header, false),
        };
        Some(Self {
            media_type,
            base64,
            data,
        })
    }

    /// True when `key=value` appears among the media type parameters.
    pub fn has_param(&self, key: &str, value: &str) -> bool {
        self.media_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .any(|(k, v)| k.trim() == key && v.trim() == value)
    }
}

pub fn is_data_url(locator: &str) -> bool {
    locator.starts_with("data:")
}

/// Build a base64 `data:` URL.
pub fn encode_data_url(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", STANDARD.encode(bytes))
}

/// Raw bytes carried by a base64 `data:` URL.
pub fn data_url_bytes(url: &str) -> Result<Vec<u8>, DecodeError> {
    let parsed = DataUrl::parse(url).ok_or(DecodeError::NotDataUrl)?;
    if !parsed.base64 {
        return Err(DecodeError::NotBase64);
    }
    Ok(STANDARD.decode(parsed.data.trim())?)
}

/// Decode encoded image bytes (PNG, JPEG, WebP, ...) into RGB pixels.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

pub fn decode_data_url(url: &str) -> Result<RgbImage, DecodeError> {
    decode_image(&data_url_bytes(url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_data_url_with_params() {
        let parsed = DataUrl::parse("data:image/svg+xml;veil=placeholder;base64,PHN2Zy8+").unwrap();
        assert_eq!(parsed.media_type, "image/svg+xml;veil=placeholder");
        assert!(parsed.base64);
        assert_eq!(parsed.data, "PHN2Zy8+");
        assert!(parsed.has_param("veil", "placeholder"));
        assert!(!parsed.has_param("veil", "other"));
    }

    #[test]
    fn test_parse_rejects_non_data() {
        assert!(DataUrl::parse("https://example.com/a.png").is_none());
        assert!(DataUrl::parse("data:image/png;base64").is_none());
    }

    #[test]
    fn test_decode_png_data_url() {
        let img = RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let url = encode_data_url("image/png", &bytes);
        let decoded = decode_data_url(&url).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1).0, [10, 20, 30]);
    }

    #[test]
    fn test_decode_percent_encoded_is_rejected() {
        assert!(matches!(
            data_url_bytes("data:image/svg+xml,%3Csvg%2F%3E"),
            Err(DecodeError::NotBase64)
        ));
    }
}
