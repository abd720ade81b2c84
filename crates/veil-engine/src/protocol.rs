//! Messages exchanged with the recognition engine and the boundary trait the
//! document side talks to.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use veil_core::{DetectorError, DetectorMode, Embedding, EmbeddingQuality, GalleryEntry, Label, RecognizerError};

#[derive(Error, Debug)]
pub enum EngineError {
    /// Pixels could not be obtained: cross-origin, tainted surface, failed load,
    /// undecodable data. Expected and frequent.
    #[error("unsupported image source: {0}")]
    UnsupportedSource(String),
    #[error("models not ready after {0:?}")]
    NotReady(Duration),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// The source could not be read; the picture should simply be shown.
    pub fn is_unsupported_source(&self) -> bool {
        matches!(self, EngineError::UnsupportedSource(_))
    }

    /// The engine could not serve the request right now; try again on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::NotReady(_) | EngineError::ChannelClosed)
    }
}

/// Picture pixels, or where to load them from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Self-contained `data:` URL exported from the rendered picture.
    Payload(String),
    /// Original locator, for the engine to load itself.
    Locator(String),
}

impl ImageInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageInput::Payload(_) => "payload",
            ImageInput::Locator(_) => "locator",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub request_id: Uuid,
    pub element: u64,
    pub image: ImageInput,
    /// Overrides the engine's configured detector mode for this request.
    pub mode: Option<DetectorMode>,
}

impl DetectionRequest {
    pub fn new(element: u64, image: ImageInput, mode: Option<DetectorMode>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            element,
            image,
            mode,
        }
    }
}

/// Identity verdict for one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub label: Label,
    pub distance: f32,
}

/// Which detector produced the faces in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorTier {
    Fast,
    Thorough,
}

#[derive(Debug, Clone)]
pub struct DetectionResponse {
    pub request_id: Uuid,
    pub element: u64,
    pub face_count: usize,
    pub matches: Vec<FaceMatch>,
    pub tier: DetectorTier,
}

impl DetectionResponse {
    /// Closest named match, ties broken by name.
    pub fn best_match(&self) -> Option<(&str, f32)> {
        self.matches
            .iter()
            .filter_map(|m| m.label.person().map(|person| (person, m.distance)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)))
    }

    /// Smallest distance over all faces, named or not.
    pub fn best_distance(&self) -> Option<f32> {
        self.matches
            .iter()
            .map(|m| m.distance)
            .filter(|d| d.is_finite())
            .min_by(f32::total_cmp)
    }
}

/// Matching settings replicated into the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub match_threshold: f32,
    pub detector_mode: DetectorMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            detector_mode: DetectorMode::Hybrid,
        }
    }
}

/// Best face of an enrollment photo.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    pub embedding: Embedding,
    pub quality: EmbeddingQuality,
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub models_ready: bool,
    pub thorough_loaded: bool,
    pub gallery_people: usize,
    pub settings: EngineSettings,
}

/// The isolation boundary: gallery/config replication and detection requests.
#[async_trait]
pub trait Recognition: Send + Sync {
    async fn update_gallery(&self, entries: Vec<GalleryEntry>) -> Result<(), EngineError>;
    async fn update_config(&self, settings: EngineSettings) -> Result<(), EngineError>;
    async fn detect(&self, request: DetectionRequest) -> Result<DetectionResponse, EngineError>;
}
