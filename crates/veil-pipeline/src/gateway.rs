//! Detection gateway: turns a picture into a verdict by way of the recognition boundary.

use crate::controller::PipelineState;
use crate::document::{Document, PictureElement};
use crate::records::EvaluationTarget;
use crate::render::is_placeholder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use veil_engine::{DetectionRequest, EngineError, ImageInput, Recognition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyGallery,
    TooSmall,
    OwnPlaceholder,
    UnsupportedSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Reveal without detection.
    Skip(SkipReason),
    NoFaceFound,
    NoMatch { best_distance: Option<f32> },
    Matched { person: String, distance: f32 },
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no detection response within {0:?}")]
    Timeout(Duration),
    #[error("recognition engine unavailable: {0}")]
    Unavailable(EngineError),
    #[error("detection failed: {0}")]
    Engine(EngineError),
}

pub struct DetectionGateway {
    engine: Arc<dyn Recognition>,
    document: Arc<dyn Document>,
    min_size: f32,
    timeout: Duration,
}

impl DetectionGateway {
    pub fn new(
        engine: Arc<dyn Recognition>,
        document: Arc<dyn Document>,
        min_size: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            document,
            min_size,
            timeout,
        }
    }

    /// Cheap checks that rule out detection entirely.
    pub fn precheck(&self, picture: &PictureElement, target: &EvaluationTarget, state: &PipelineState) -> Option<SkipReason> {
        if state.gallery.is_empty() {
            return Some(SkipReason::EmptyGallery);
        }
        // A 1x1 tracking pixel scaled up by CSS still has a tiny intrinsic size.
        if picture.rendered.below(self.min_size) || picture.natural.below(self.min_size) {
            return Some(SkipReason::TooSmall);
        }
        if is_placeholder(&target.locator) {
            return Some(SkipReason::OwnPlaceholder);
        }
        None
    }

    pub async fn evaluate(
        &self,
        picture: &PictureElement,
        target: &EvaluationTarget,
        state: &PipelineState,
    ) -> Result<Verdict, GatewayError> {
        if let Some(reason) = self.precheck(picture, target, state) {
            tracing::debug!(element = %picture.id, ?reason, "detection skipped");
            return Ok(Verdict::Skip(reason));
        }

        let image = self.image_input(picture, target);
        tracing::debug!(element = %picture.id, kind = image.kind(), "detection requested");
        let request = DetectionRequest::new(picture.id.0, image, Some(state.config.detector_mode));

        let response = match tokio::time::timeout(self.timeout, self.engine.detect(request)).await {
            Err(_) => return Err(GatewayError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_unsupported_source() => {
                tracing::debug!(element = %picture.id, error = %e, "source not readable");
                return Ok(Verdict::Skip(SkipReason::UnsupportedSource));
            }
            Ok(Err(EngineError::NoFaceDetected)) => return Ok(Verdict::NoFaceFound),
            Ok(Err(e)) if e.is_retryable() => return Err(GatewayError::Unavailable(e)),
            Ok(Err(e)) => return Err(GatewayError::Engine(e)),
            Ok(Ok(response)) => response,
        };

        if response.face_count == 0 {
            return Ok(Verdict::NoFaceFound);
        }
        Ok(match response.best_match() {
            Some((person, distance)) => Verdict::Matched {
                person: person.to_string(),
                distance,
            },
            None => Verdict::NoMatch {
                best_distance: response.best_distance(),
            },
        })
    }

    fn image_input(&self, picture: &PictureElement, target: &EvaluationTarget) -> ImageInput {
        if target.rasterize {
            match self.document.rasterize(picture.id) {
                Ok(payload) => return ImageInput::Payload(payload),
                Err(e) => {
                    tracing::debug!(element = %picture.id, error = %e, "rasterize failed, forwarding locator");
                }
            }
        }
        ImageInput::Locator(target.locator.clone())
    }
}
