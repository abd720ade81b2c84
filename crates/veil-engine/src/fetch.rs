//! Turning an [`ImageInput`] into pixels on the engine thread.

use crate::protocol::{EngineError, ImageInput};
use image::RgbImage;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;
use veil_core::payload;

const FETCH_TIMEOUT: Duration = Duration::from_secs(8);
/// Refuse bodies larger than this.
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Loads remote image bytes for locators the document could not rasterize.
pub trait ImageFetcher: Send {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Blocking HTTP(S) fetcher. The client is built on first use so that it is
/// created on the engine thread, outside any async runtime.
#[derive(Default)]
pub struct HttpFetcher {
    client: OnceLock<Result<reqwest::blocking::Client, String>>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, String> {
        self.client
            .get_or_init(|| {
                reqwest::blocking::Client::builder()
                    .timeout(FETCH_TIMEOUT)
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client()?
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?;

        if response.content_length().is_some_and(|len| len > MAX_IMAGE_BYTES) {
            return Err("image too large".into());
        }
        // Chunked bodies carry no length; the cap applies to what is actually read.
        read_capped(response, MAX_IMAGE_BYTES)
    }
}

fn read_capped(body: impl Read, limit: u64) -> Result<Vec<u8>, String> {
    let mut bytes = Vec::new();
    body.take(limit + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| e.to_string())?;
    if bytes.len() as u64 > limit {
        return Err("image too large".into());
    }
    Ok(bytes)
}

/// Decode the request image. Every failure is an unsupported-source error.
pub fn load_image(input: &ImageInput, fetcher: &dyn ImageFetcher) -> Result<RgbImage, EngineError> {
    let unsupported = |what: String| EngineError::UnsupportedSource(what);

    match input {
        ImageInput::Payload(url) => {
            payload::decode_data_url(url).map_err(|e| unsupported(format!("payload: {e}")))
        }
        ImageInput::Locator(url) if payload::is_data_url(url) => {
            payload::decode_data_url(url).map_err(|e| unsupported(format!("inline locator: {e}")))
        }
        ImageInput::Locator(url) if url.starts_with("http://") || url.starts_with("https://") => {
            let bytes = fetcher
                .fetch(url)
                .map_err(|e| unsupported(format!("load failed: {e}")))?;
            payload::decode_image(&bytes).map_err(|e| unsupported(format!("decode: {e}")))
        }
        ImageInput::Locator(url) => {
            let scheme = url.split(':').next().unwrap_or_default();
            Err(unsupported(format!("unsupported scheme: {scheme}")))
        }
    }
}
