//! Model loading for the engine.

use std::path::PathBuf;
use veil_core::detector::{FAST_INPUT_SIZE, THOROUGH_INPUT_SIZE};
use veil_core::{FaceDetector, FaceEmbedder, FaceRecognizer, ScrfdDetector};

/// Source of the engine's detection and embedding models.
///
/// Called from the loader thread; each method may block for a long time.
pub trait ModelProvider: Send + Sync + 'static {
    fn load_fast(&self) -> Result<Box<dyn FaceDetector>, String>;
    fn load_thorough(&self) -> Result<Box<dyn FaceDetector>, String>;
    fn load_embedder(&self) -> Result<Box<dyn FaceEmbedder>, String>;
}

/// ONNX model files on disk.
#[derive(Debug, Clone)]
pub struct OnnxModels {
    pub fast_detector: PathBuf,
    pub thorough_detector: PathBuf,
    pub recognizer: PathBuf,
}

impl OnnxModels {
    /// Standard file names inside `model_dir`.
    pub fn in_dir(model_dir: impl Into<PathBuf>) -> Self {
        let dir = model_dir.into();
        Self {
            fast_detector: dir.join("scrfd_500m.onnx"),
            thorough_detector: dir.join("scrfd_10g.onnx"),
            recognizer: dir.join("face_recognition_128.onnx"),
        }
    }
}

impl ModelProvider for OnnxModels {
    fn load_fast(&self) -> Result<Box<dyn FaceDetector>, String> {
        ScrfdDetector::load(&self.fast_detector, FAST_INPUT_SIZE)
            .map(|d| Box::new(d) as Box<dyn FaceDetector>)
            .map_err(|e| e.to_string())
    }

    fn load_thorough(&self) -> Result<Box<dyn FaceDetector>, String> {
        ScrfdDetector::load(&self.thorough_detector, THOROUGH_INPUT_SIZE)
            .map(|d| Box::new(d) as Box<dyn FaceDetector>)
            .map_err(|e| e.to_string())
    }

    fn load_embedder(&self) -> Result<Box<dyn FaceEmbedder>, String> {
        FaceRecognizer::load(&self.recognizer)
            .map(|r| Box::new(r) as Box<dyn FaceEmbedder>)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_files_report_paths() {
        let models = OnnxModels::in_dir("/nonexistent/veil-models");
        let err = models.load_fast().err().unwrap();
        assert!(err.contains("scrfd_500m.onnx"), "{err}");
        assert!(models.load_embedder().is_err());
    }
}
