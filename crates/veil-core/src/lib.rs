//! veil-core — Face embeddings, gallery matching, and recognition backends.
//!
//! Uses SCRFD for face detection (two input resolutions for the fast and
//! thorough tiers) and a 128-dimensional embedding network for recognition,
//! both running via ONNX Runtime on the CPU.

pub mod detector;
pub mod payload;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use recognizer::{FaceEmbedder, FaceRecognizer, RecognizerError};
pub use types::{
    BoundingBox, DetectorMode, Embedding, EmbeddingQuality, EuclideanMatcher, GalleryEntry, Label,
    MatchResult, Matcher, EMBEDDING_DIM,
};

/// Per-user data directory (`$XDG_DATA_HOME/veil`, falling back to `~/.local/share/veil`).
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("veil")
}

/// Default directory holding the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
