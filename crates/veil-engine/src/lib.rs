//! veil-engine — The recognition engine behind the isolation boundary.
//!
//! Owns the detection and embedding models on a dedicated thread and answers
//! gallery/config replication and detection requests sent through an
//! [`EngineHandle`].

pub mod engine;
pub mod fetch;
pub mod models;
pub mod protocol;

pub use engine::{spawn_engine, spawn_engine_with_fetcher, EngineHandle, EngineOptions};
pub use fetch::{HttpFetcher, ImageFetcher};
pub use models::{ModelProvider, OnnxModels};
pub use protocol::{
    DetectionRequest, DetectionResponse, DetectorTier, EngineError, EngineSettings, EngineStatus,
    EnrollResult, FaceMatch, ImageInput, Recognition,
};
