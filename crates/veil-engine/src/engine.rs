use crate::fetch::{load_image, HttpFetcher, ImageFetcher};
use crate::models::ModelProvider;
use crate::protocol::{
    DetectionRequest, DetectionResponse, DetectorTier, EngineError, EngineSettings, EngineStatus,
    EnrollResult, FaceMatch, ImageInput, Recognition,
};
use async_trait::async_trait;
use image::RgbImage;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use veil_core::{
    BoundingBox, DetectorMode, EmbeddingQuality, EuclideanMatcher, FaceDetector, FaceEmbedder,
    GalleryEntry, Matcher,
};

/// Engine timing and queueing.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long a caller waits for the eager models before giving up.
    pub model_ready_timeout: Duration,
    /// How long a hybrid detection waits for the thorough detector to finish loading.
    pub thorough_wait: Duration,
    pub queue_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_ready_timeout: Duration::from_secs(10),
            thorough_wait: Duration::from_secs(5),
            queue_depth: 16,
        }
    }
}

/// Load state of the eager models (fast detector + embedder).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Loading,
    Ready,
    Failed(String),
}

/// Messages sent from the document side to the engine thread.
enum EngineRequest {
    UpdateGallery {
        entries: Vec<GalleryEntry>,
        reply: oneshot::Sender<()>,
    },
    UpdateConfig {
        settings: EngineSettings,
        reply: oneshot::Sender<()>,
    },
    Detect {
        request: DetectionRequest,
        reply: oneshot::Sender<Result<DetectionResponse, EngineError>>,
    },
    Enroll {
        image: ImageInput,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ready: watch::Receiver<Readiness>,
    ready_timeout: Duration,
}

impl EngineHandle {
    /// Wait (bounded) until the eager models are loaded.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let mut ready = self.ready.clone();
        let state = tokio::time::timeout(
            self.ready_timeout,
            ready.wait_for(|state| *state != Readiness::Loading),
        )
        .await
        .map_err(|_| EngineError::NotReady(self.ready_timeout))?
        .map_err(|_| EngineError::ChannelClosed)?
        .clone();

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(EngineError::ModelLoad(reason)),
            Readiness::Loading => Err(EngineError::NotReady(self.ready_timeout)),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Extract the best face's embedding from an enrollment photo.
    pub async fn enroll(&self, image: ImageInput) -> Result<EnrollResult, EngineError> {
        self.wait_ready().await?;
        self.call(|reply| EngineRequest::Enroll { image, reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

#[async_trait]
impl Recognition for EngineHandle {
    async fn update_gallery(&self, entries: Vec<GalleryEntry>) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::UpdateGallery { entries, reply })
            .await
    }

    async fn update_config(&self, settings: EngineSettings) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::UpdateConfig { settings, reply })
            .await
    }

    async fn detect(&self, request: DetectionRequest) -> Result<DetectionResponse, EngineError> {
        self.wait_ready().await?;
        self.call(|reply| EngineRequest::Detect { request, reply })
            .await?
    }
}

/// Spawn the engine with the default HTTP fetcher.
pub fn spawn_engine(
    models: Arc<dyn ModelProvider>,
    options: EngineOptions,
) -> Result<EngineHandle, EngineError> {
    spawn_engine_with_fetcher(models, Box::new(HttpFetcher::new()), options)
}

/// Spawn the engine on a dedicated OS thread.
///
/// Models load on a separate loader thread: the fast detector and embedder
/// first (readiness is published once they are in), then the thorough detector
/// in the background. Requests queue while loading is in progress.
pub fn spawn_engine_with_fetcher(
    models: Arc<dyn ModelProvider>,
    fetcher: Box<dyn ImageFetcher>,
    options: EngineOptions,
) -> Result<EngineHandle, EngineError> {
    let (ready_tx, ready_rx) = watch::channel(Readiness::Loading);
    let (eager_tx, eager_rx) = std_mpsc::channel();
    let (thorough_tx, thorough_rx) = std_mpsc::channel();

    std::thread::Builder::new()
        .name("veil-model-loader".into())
        .spawn(move || load_models(models.as_ref(), eager_tx, thorough_tx, ready_tx))
        .map_err(EngineError::Spawn)?;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(options.queue_depth);
    let ready_timeout = options.model_ready_timeout;
    let mut worker = Worker {
        eager: EagerSlot::Pending(eager_rx),
        thorough: ThoroughSlot::Pending(thorough_rx),
        gallery: Vec::new(),
        settings: EngineSettings::default(),
        fetcher,
        options,
    };

    std::thread::Builder::new()
        .name("veil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        ready: ready_rx,
        ready_timeout,
    })
}

struct EagerModels {
    fast: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

fn load_models(
    models: &dyn ModelProvider,
    eager_tx: std_mpsc::Sender<Result<EagerModels, String>>,
    thorough_tx: std_mpsc::Sender<Result<Box<dyn FaceDetector>, String>>,
    ready_tx: watch::Sender<Readiness>,
) {
    let eager = models
        .load_fast()
        .and_then(|fast| models.load_embedder().map(|embedder| EagerModels { fast, embedder }));

    match eager {
        Ok(loaded) => {
            // Hand the models over before announcing readiness.
            let _ = eager_tx.send(Ok(loaded));
            tracing::info!("fast detector and embedder loaded");
            let _ = ready_tx.send(Readiness::Ready);
        }
        Err(reason) => {
            tracing::error!(error = %reason, "eager model load failed");
            let _ = eager_tx.send(Err(reason.clone()));
            let _ = ready_tx.send(Readiness::Failed(reason));
            return;
        }
    }

    let thorough = models.load_thorough();
    match &thorough {
        Ok(_) => tracing::info!("thorough detector loaded"),
        Err(reason) => tracing::warn!(error = %reason, "thorough detector unavailable; hybrid mode degrades to fast only"),
    }
    let _ = thorough_tx.send(thorough);
}

enum EagerSlot {
    Pending(std_mpsc::Receiver<Result<EagerModels, String>>),
    Ready(EagerModels),
    Failed(String),
}

impl EagerSlot {
    fn get(&mut self, wait: Duration) -> Result<&mut EagerModels, EngineError> {
        if let EagerSlot::Pending(rx) = self {
            *self = match rx.recv_timeout(wait) {
                Ok(Ok(models)) => EagerSlot::Ready(models),
                Ok(Err(reason)) => EagerSlot::Failed(reason),
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Err(EngineError::NotReady(wait)),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    EagerSlot::Failed("model loader exited".into())
                }
            };
        }
        match self {
            EagerSlot::Ready(models) => Ok(models),
            EagerSlot::Failed(reason) => Err(EngineError::ModelLoad(reason.clone())),
            EagerSlot::Pending(_) => Err(EngineError::NotReady(wait)),
        }
    }

    fn is_ready(&mut self) -> bool {
        self.get(Duration::ZERO).is_ok()
    }
}

enum ThoroughSlot {
    Pending(std_mpsc::Receiver<Result<Box<dyn FaceDetector>, String>>),
    Ready(Box<dyn FaceDetector>),
    Unavailable,
}

impl ThoroughSlot {
    /// The thorough detector, waiting up to `wait` for the background load.
    fn get(&mut self, wait: Duration) -> Option<&mut Box<dyn FaceDetector>> {
        if let ThoroughSlot::Pending(rx) = self {
            match rx.recv_timeout(wait) {
                Ok(Ok(detector)) => *self = ThoroughSlot::Ready(detector),
                Ok(Err(_)) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    *self = ThoroughSlot::Unavailable
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    if !wait.is_zero() {
                        tracing::warn!(?wait, "thorough detector still loading");
                    }
                }
            }
        }
        match self {
            ThoroughSlot::Ready(detector) => Some(detector),
            _ => None,
        }
    }
}

/// Engine-thread state. Owns the models, the replicated gallery, and settings.
struct Worker {
    eager: EagerSlot,
    thorough: ThoroughSlot,
    gallery: Vec<GalleryEntry>,
    settings: EngineSettings,
    fetcher: Box<dyn ImageFetcher>,
    options: EngineOptions,
}

impl Worker {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::UpdateGallery { entries, reply } => {
                tracing::info!(people = entries.len(), "gallery replicated to engine");
                self.gallery = entries;
                let _ = reply.send(());
            }
            EngineRequest::UpdateConfig { settings, reply } => {
                tracing::info!(
                    threshold = settings.match_threshold,
                    mode = %settings.detector_mode,
                    "engine settings updated"
                );
                self.settings = settings;
                let _ = reply.send(());
            }
            EngineRequest::Detect { request, reply } => {
                let result = self.run_detect(&request);
                if let Err(e) = &result {
                    tracing::debug!(request = %request.request_id, element = request.element, error = %e, "detection failed");
                }
                let _ = reply.send(result);
            }
            EngineRequest::Enroll { image, reply } => {
                let _ = reply.send(self.run_enroll(&image));
            }
            EngineRequest::Status { reply } => {
                let status = EngineStatus {
                    models_ready: self.eager.is_ready(),
                    thorough_loaded: self.thorough.get(Duration::ZERO).is_some(),
                    gallery_people: self.gallery.len(),
                    settings: self.settings,
                };
                let _ = reply.send(status);
            }
        }
    }

    /// Run the configured detector tier(s).
    ///
    /// Hybrid runs the fast detector first and only falls back to the thorough
    /// detector when the fast pass finds nothing.
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        mode: DetectorMode,
    ) -> Result<(Vec<BoundingBox>, DetectorTier), EngineError> {
        let wait = self.options.thorough_wait;
        let ready_wait = self.options.model_ready_timeout;

        match mode {
            DetectorMode::Fast => {
                let faces = self.eager.get(ready_wait)?.fast.detect(image)?;
                Ok((faces, DetectorTier::Fast))
            }
            DetectorMode::Thorough => match self.thorough.get(wait) {
                Some(thorough) => Ok((thorough.detect(image)?, DetectorTier::Thorough)),
                None => {
                    tracing::warn!("thorough detector unavailable; using fast detector");
                    let faces = self.eager.get(ready_wait)?.fast.detect(image)?;
                    Ok((faces, DetectorTier::Fast))
                }
            },
            DetectorMode::Hybrid => {
                let faces = self.eager.get(ready_wait)?.fast.detect(image)?;
                if !faces.is_empty() {
                    return Ok((faces, DetectorTier::Fast));
                }
                match self.thorough.get(wait) {
                    Some(thorough) => {
                        let faces = thorough.detect(image)?;
                        tracing::debug!(faces = faces.len(), "hybrid fallback to thorough detector");
                        Ok((faces, DetectorTier::Thorough))
                    }
                    None => Ok((faces, DetectorTier::Fast)),
                }
            }
        }
    }

    fn run_detect(&mut self, request: &DetectionRequest) -> Result<DetectionResponse, EngineError> {
        let image = load_image(&request.image, self.fetcher.as_ref())?;
        let mode = request.mode.unwrap_or(self.settings.detector_mode);
        let (faces, tier) = self.detect_faces(&image, mode)?;

        let embedder = &mut self.eager.get(self.options.model_ready_timeout)?.embedder;
        let mut matches = Vec::with_capacity(faces.len());
        for face in &faces {
            let embedding = match embedder.embed(&image, face) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping face without embedding");
                    continue;
                }
            };
            let result = EuclideanMatcher.compare(&embedding, &self.gallery, self.settings.match_threshold);
            matches.push(FaceMatch {
                label: result.label,
                distance: result.distance,
            });
        }

        tracing::debug!(
            request = %request.request_id,
            element = request.element,
            input = request.image.kind(),
            faces = faces.len(),
            ?tier,
            "detection complete"
        );

        Ok(DetectionResponse {
            request_id: request.request_id,
            element: request.element,
            face_count: faces.len(),
            matches,
            tier,
        })
    }

    /// Pick the most confident face and extract its embedding.
    fn run_enroll(&mut self, input: &ImageInput) -> Result<EnrollResult, EngineError> {
        let image = load_image(input, self.fetcher.as_ref())?;
        let (faces, _) = self.detect_faces(&image, DetectorMode::Hybrid)?;
        let face = faces
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or(EngineError::NoFaceDetected)?;

        let embedding = self
            .eager
            .get(self.options.model_ready_timeout)?
            .embedder
            .embed(&image, &face)?;

        tracing::info!(confidence = face.confidence, "enroll: best face selected");
        Ok(EnrollResult {
            embedding,
            quality: EmbeddingQuality {
                detection_score: face.confidence,
                face_width: face.width.max(0.0).round() as u32,
                face_height: face.height.max(0.0).round() as u32,
            },
        })
    }
}
