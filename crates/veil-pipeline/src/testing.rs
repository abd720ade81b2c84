//! Scripted recognition boundary for pipeline tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use veil_core::{Embedding, GalleryEntry, Label, EMBEDDING_DIM};
use veil_engine::{
    DetectionRequest, DetectionResponse, DetectorTier, EngineError, EngineSettings, FaceMatch,
    ImageInput, Recognition,
};

/// What the fake engine reports for one image.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// One face at `distance` from `person`; named only if below the pushed threshold.
    Face { person: String, distance: f32 },
    NoFace,
    Unsupported,
    NotReady,
    /// Never answers.
    Hang,
}

impl Outcome {
    pub fn face(person: &str, distance: f32) -> Self {
        Outcome::Face {
            person: person.into(),
            distance,
        }
    }
}

#[derive(Default)]
pub struct FakeRecognition {
    outcomes: Mutex<HashMap<String, Outcome>>,
    requests: Mutex<Vec<DetectionRequest>>,
    settings: Mutex<EngineSettings>,
    gallery_pushes: AtomicUsize,
    config_pushes: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeRecognition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests whose payload or locator equals `image`.
    pub fn script(&self, image: &str, outcome: Outcome) {
        self.outcomes.lock().unwrap().insert(image.to_string(), outcome);
    }

    /// Delay every answer by `delay`.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn detect_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<DetectionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn gallery_pushes(&self) -> usize {
        self.gallery_pushes.load(Ordering::SeqCst)
    }

    pub fn config_pushes(&self) -> usize {
        self.config_pushes.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> EngineSettings {
        *self.settings.lock().unwrap()
    }
}

#[async_trait]
impl Recognition for FakeRecognition {
    async fn update_gallery(&self, _entries: Vec<GalleryEntry>) -> Result<(), EngineError> {
        self.gallery_pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_config(&self, settings: EngineSettings) -> Result<(), EngineError> {
        *self.settings.lock().unwrap() = settings;
        self.config_pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn detect(&self, request: DetectionRequest) -> Result<DetectionResponse, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        let key = match &request.image {
            ImageInput::Payload(s) | ImageInput::Locator(s) => s.clone(),
        };
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Outcome::NoFace);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let threshold = self.settings().match_threshold;
        let matches = match outcome {
            Outcome::Face { person, distance } => vec![FaceMatch {
                label: if distance < threshold {
                    Label::Person(person)
                } else {
                    Label::Unknown
                },
                distance,
            }],
            Outcome::NoFace => Vec::new(),
            Outcome::Unsupported => return Err(EngineError::UnsupportedSource("cross-origin".into())),
            Outcome::NotReady => return Err(EngineError::NotReady(Duration::from_secs(10))),
            Outcome::Hang => std::future::pending().await,
        };
        Ok(DetectionResponse {
            request_id: Uuid::new_v4(),
            element: request.element,
            face_count: matches.len(),
            matches,
            tier: DetectorTier::Fast,
        })
    }
}

/// A gallery with three reference embeddings for "Ada".
pub fn ada_gallery() -> Vec<GalleryEntry> {
    let embeddings = (0..3)
        .map(|i| {
            let mut values = vec![0.0; EMBEDDING_DIM];
            values[i] = 1.0;
            Embedding::new(values)
        })
        .collect();
    vec![GalleryEntry::new("Ada", embeddings)]
}
