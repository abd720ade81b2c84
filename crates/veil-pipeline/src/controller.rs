//! Pipeline controller: owns the pipeline state and drives every component.

use crate::config::{ConfigStore, Configuration, PipelineTuning};
use crate::document::{Document, NodeId};
use crate::gateway::DetectionGateway;
use crate::preloader::{self, PreloadOutcome};
use crate::records::{BlockInfo, Claim, Finish, PictureState, RecordTable};
use crate::render::Renderer;
use crate::scanner::Scanner;
use crate::scheduler::{run_in_batches, Debouncer};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use veil_core::GalleryEntry;
use veil_engine::{EngineError, Recognition};
use veil_gallery::{Gallery, GalleryError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("recognition engine: {0}")]
    Engine(#[from] EngineError),
}

/// Settings and gallery snapshot every evaluation reads. Replaced wholesale on change.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub config: Configuration,
    pub gallery: Arc<Vec<GalleryEntry>>,
}

impl PipelineState {
    pub fn new(config: Configuration, gallery: Vec<GalleryEntry>) -> Self {
        Self {
            config,
            gallery: Arc::new(gallery),
        }
    }
}

/// Read-only view of the pipeline's bookkeeping.
#[derive(Clone)]
pub struct Inspector {
    records: Arc<RecordTable>,
    batches: Arc<AtomicUsize>,
}

impl Inspector {
    pub fn state(&self, id: NodeId) -> Option<PictureState> {
        self.records.state(id)
    }

    pub fn blocked_info(&self, id: NodeId) -> Option<BlockInfo> {
        self.records.blocked_info(id)
    }

    /// Debounced batches flushed so far.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

struct PipelineCore {
    document: Arc<dyn Document>,
    engine: Arc<dyn Recognition>,
    gallery: Arc<Gallery>,
    config: Arc<ConfigStore>,
    tuning: PipelineTuning,
    records: Arc<RecordTable>,
    scanner: Scanner,
    gateway: DetectionGateway,
    renderer: Renderer,
    state: PipelineState,
    rule_active: bool,
    batches: Arc<AtomicUsize>,
}

pub struct Controller {
    core: PipelineCore,
    debouncer: Debouncer<NodeId>,
}

impl Controller {
    pub fn new(
        document: Arc<dyn Document>,
        engine: Arc<dyn Recognition>,
        gallery: Arc<Gallery>,
        config: Arc<ConfigStore>,
    ) -> Self {
        let tuning = config.tuning().clone();
        let records = Arc::new(RecordTable::new());
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        let scanner = Scanner::new(document.clone(), records.clone(), pending_tx, tuning.load_wait());
        let gateway = DetectionGateway::new(
            engine.clone(),
            document.clone(),
            tuning.min_picture_size,
            tuning.detect_timeout(),
        );
        let renderer = Renderer::new(document.clone(), records.clone());
        let debouncer = Debouncer::new(pending_rx, tuning.debounce(), tuning.max_debounce_latency());
        let state = PipelineState::new(config.get(), Vec::new());

        Self {
            core: PipelineCore {
                document,
                engine,
                gallery,
                config,
                tuning,
                records,
                scanner,
                gateway,
                renderer,
                state,
                rule_active: false,
                batches: Arc::new(AtomicUsize::new(0)),
            },
            debouncer,
        }
    }

    pub fn inspector(&self) -> Inspector {
        Inspector {
            records: self.core.records.clone(),
            batches: self.core.batches.clone(),
        }
    }

    /// Start the pipeline and serve document, settings and gallery changes until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), PipelineError> {
        let mut config_rx = self.core.config.subscribe();
        let mut gallery_rx = self.core.gallery.subscribe();
        config_rx.borrow_and_update();
        gallery_rx.borrow_and_update();

        self.core.start().await?;
        let watcher = self.core.scanner.observe();
        self.core.full_pass().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                batch = self.debouncer.next_batch() => {
                    let Some(ids) = batch else { break };
                    self.core.process_batch(ids).await;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = *config_rx.borrow_and_update();
                    self.core.apply_config(config).await;
                }
                changed = gallery_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    gallery_rx.borrow_and_update();
                    self.core.reload_gallery().await;
                }
            }
        }

        watcher.abort();
        tracing::info!("pipeline stopped");
        Ok(())
    }
}

impl PipelineCore {
    async fn start(&mut self) -> Result<(), PipelineError> {
        let entries = self.gallery.list()?;
        self.state = PipelineState::new(self.config.get(), entries.clone());
        self.engine.update_gallery(entries).await?;
        self.engine
            .update_config(self.state.config.engine_settings())
            .await?;
        tracing::info!(
            people = self.state.gallery.len(),
            threshold = self.state.config.match_threshold,
            mode = %self.state.config.detector_mode,
            enabled = self.state.config.enabled,
            "pipeline started"
        );

        if self.state.config.enabled {
            match preloader::install(self.document.as_ref()).await {
                PreloadOutcome::Installed => self.rule_active = true,
                PreloadOutcome::SkippedHydration => {
                    preloader::wait_for_hydration(self.document.as_ref(), self.tuning.hydration_idle_fallback())
                        .await
                }
                PreloadOutcome::Failed => {}
            }
        }
        Ok(())
    }

    /// Evaluate every picture that needs it, in document order.
    async fn full_pass(&self) {
        if !self.state.config.enabled {
            return;
        }
        let ids = self.scanner.scan_existing();
        if ids.is_empty() {
            return;
        }
        tracing::debug!(pictures = ids.len(), "full pass");
        run_in_batches(ids, self.tuning.batch_size, |id| self.process(id)).await;
    }

    async fn process_batch(&self, ids: Vec<NodeId>) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(pictures = ids.len(), "processing batch");
        run_in_batches(ids, self.tuning.batch_size, |id| self.process(id)).await;
    }

    /// Claim, hide, detect, render. Returns the state the element ended in, if any.
    async fn process(&self, id: NodeId) -> Option<PictureState> {
        if !self.state.config.enabled {
            return None;
        }
        let Some(picture) = self.document.picture(id) else {
            self.records.forget(id);
            return None;
        };
        let locator = picture.locator.clone()?;

        let target = match self.records.claim(id, &locator) {
            Claim::Skip => return None,
            Claim::Deferred => {
                tracing::debug!(element = %id, "locator changed mid-evaluation, rerun queued");
                return None;
            }
            Claim::Evaluate(target) => target,
            Claim::Replaced { target, dropped_block } => {
                tracing::debug!(element = %id, person = %dropped_block.person, "blocked picture replaced by the page");
                self.renderer.clear_block_markers(id, &dropped_block);
                target
            }
        };

        if !target.revealed {
            self.renderer.hide_for_detection(id, self.rule_active);
        }
        if !picture.complete && target.rasterize {
            if self.records.await_load(id) {
                self.scanner.defer_until_loaded(id);
                return Some(PictureState::AwaitingLoad);
            }
            tracing::debug!(element = %id, "picture never finished loading");
            self.renderer.abandon(id);
            return None;
        }

        self.records.set_state(id, PictureState::Detecting);
        let verdict = self.gateway.evaluate(&picture, &target, &self.state).await;

        let current = self.document.picture(id).and_then(|p| p.locator);
        match self.records.finish(id, &target.locator, current.as_deref()) {
            Finish::Render => {}
            Finish::Rerun { dropped_block } => {
                if let Some(info) = dropped_block {
                    self.renderer.clear_block_markers(id, &info);
                }
                self.scanner.resubmit(id);
                return None;
            }
            Finish::Gone => return None,
        }

        match verdict {
            Ok(verdict) => Some(self.renderer.render(id, &target.locator, &verdict)),
            Err(e) => {
                tracing::warn!(element = %id, error = %e, "evaluation abandoned");
                self.renderer.abandon(id);
                None
            }
        }
    }

    async fn apply_config(&mut self, config: Configuration) {
        let previous = self.state.config;
        if config == previous {
            return;
        }
        self.state = PipelineState {
            config,
            gallery: self.state.gallery.clone(),
        };
        if let Err(e) = self.engine.update_config(config.engine_settings()).await {
            tracing::warn!(error = %e, "failed to push settings to the engine");
        }

        if !config.enabled {
            if previous.enabled {
                let restored = self.renderer.restore_all_blocked();
                for id in self.document.pictures() {
                    self.renderer.reveal(id);
                }
                self.records.retain_unblocked();
                tracing::info!(restored, "pipeline disabled");
            }
            return;
        }
        if !previous.enabled {
            tracing::info!("pipeline enabled");
            self.full_pass().await;
            return;
        }
        if config.affects_matching(&previous) {
            let invalidated = self.records.invalidate_all();
            tracing::info!(invalidated, "matching settings changed, re-evaluating");
            self.full_pass().await;
        }
    }

    async fn reload_gallery(&mut self) {
        let entries = match self.gallery.list() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload gallery, keeping previous copy");
                return;
            }
        };
        self.state = PipelineState::new(self.state.config, entries.clone());
        if let Err(e) = self.engine.update_gallery(entries).await {
            tracing::warn!(error = %e, "failed to push gallery to the engine");
        }

        if self.state.config.enabled {
            let invalidated = self.records.invalidate_all();
            tracing::info!(people = self.state.gallery.len(), invalidated, "gallery changed, re-evaluating");
            self.full_pass().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentShell, LoadOutcome, MemoryDocument, PictureSpec, Pixels, Size};
    use crate::preloader::HIDE_RULE;
    use crate::render::{is_placeholder, BLOCKED_ATTR};
    use crate::testing::{ada_gallery, FakeRecognition, Outcome};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use veil_core::DetectorMode;
    use veil_gallery::MemoryGalleryStore;

    const ADA: &str = "https://site/ada.jpg";
    const STRANGER: &str = "https://site/stranger.jpg";
    const LANDSCAPE: &str = "https://site/landscape.jpg";

    struct Harness {
        doc: Arc<MemoryDocument>,
        engine: Arc<FakeRecognition>,
        gallery: Arc<Gallery>,
        config: Arc<ConfigStore>,
        inspector: Inspector,
        stop: Option<oneshot::Sender<()>>,
        task: JoinHandle<Result<(), PipelineError>>,
    }

    impl Harness {
        async fn start(doc: Arc<MemoryDocument>, with_ada: bool) -> Self {
            let engine = Arc::new(FakeRecognition::new());
            engine.script(ADA, Outcome::face("Ada", 0.55));
            engine.script(STRANGER, Outcome::face("Ada", 0.62));
            engine.script(LANDSCAPE, Outcome::NoFace);

            let gallery = Arc::new(Gallery::new(Arc::new(MemoryGalleryStore::new())));
            if with_ada {
                let entry = ada_gallery().remove(0);
                gallery.add(&entry.person, entry.embeddings, None).unwrap();
            }
            let config = Arc::new(ConfigStore::new(Configuration::default(), PipelineTuning::default()));

            let controller = Controller::new(doc.clone(), engine.clone(), gallery.clone(), config.clone());
            let inspector = controller.inspector();
            let (stop, stopped) = oneshot::channel::<()>();
            let task = tokio::spawn(controller.run(async {
                let _ = stopped.await;
            }));
            Self {
                doc,
                engine,
                gallery,
                config,
                inspector,
                stop: Some(stop),
                task,
            }
        }

        async fn until(&self, what: &str, condition: impl Fn(&Self) -> bool) {
            for _ in 0..3_000 {
                if condition(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {what}");
        }

        async fn until_state(&self, id: NodeId, state: PictureState) {
            self.until(&format!("{id} to reach {state:?}"), |h| h.inspector.state(id) == Some(state))
                .await;
        }

        /// Let pending timers and tasks run for a while.
        async fn idle(&self) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.task.await.unwrap().unwrap();
        }
    }

    fn update(config: &ConfigStore, f: impl FnOnce(&mut Configuration)) {
        let mut next = config.get();
        f(&mut next);
        config.update(next).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_blocks_and_near_miss_reveals() {
        let doc = Arc::new(MemoryDocument::new());
        let page = doc.add_container(None, Some(crate::document::Rgba::opaque(240, 240, 240)));
        let ada = doc.add_picture(Some(page), PictureSpec::loaded(ADA, 400.0, 300.0).with_alt("Ada at the beach"));
        let stranger = doc.add_picture(Some(page), PictureSpec::loaded(STRANGER, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;

        h.until_state(ada, PictureState::Blocked).await;
        h.until_state(stranger, PictureState::NoMatch).await;

        assert_eq!(h.engine.settings().match_threshold, 0.6);
        assert_eq!(doc.style_rules(), vec![HIDE_RULE.to_string()]);

        let info = h.inspector.blocked_info(ada).unwrap();
        assert_eq!(info.person, "Ada");
        assert_eq!(info.distance, 0.55);
        assert_eq!(info.original_locator, ADA);
        assert!(is_placeholder(&doc.locator(ada).unwrap()));
        assert_eq!(doc.attribute(ada, BLOCKED_ATTR).as_deref(), Some("true"));
        assert!(doc.is_visible(ada));

        assert_eq!(doc.locator(stranger).as_deref(), Some(STRANGER));
        assert!(doc.is_visible(stranger));
        assert!(h.inspector.blocked_info(stranger).is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_locator_is_never_reevaluated() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(STRANGER, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::NoMatch).await;

        doc.set_source(id, STRANGER);
        doc.set_attribute(id, "srcset", "");
        h.idle().await;

        assert_eq!(h.engine.detect_calls(), 1);
        assert_eq!(h.inspector.state(id), Some(PictureState::NoMatch));
        assert_eq!(doc.locator(id).as_deref(), Some(STRANGER));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_inserts_is_one_batch() {
        let doc = Arc::new(MemoryDocument::new());
        let h = Harness::start(doc.clone(), true).await;
        h.idle().await;
        assert_eq!(h.inspector.batches(), 0);

        let ids: Vec<NodeId> = (0..7)
            .map(|n| {
                let locator = format!("https://site/feed/{n}.jpg");
                doc.add_picture(None, PictureSpec::loaded(locator, 300.0, 300.0))
            })
            .collect();

        h.until("all inserted pictures to settle", |h| {
            ids.iter()
                .all(|&id| h.inspector.state(id) == Some(PictureState::NoFaceFound))
        })
        .await;
        assert_eq!(h.inspector.batches(), 1);
        assert_eq!(h.engine.detect_calls(), ids.len());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scaled_tracking_pixel_is_skipped_without_detection() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 1.0, 1.0).rendered_as(20.0, 20.0));
        let h = Harness::start(doc.clone(), true).await;

        h.until_state(id, PictureState::Skipped).await;
        assert_eq!(h.engine.detect_calls(), 0);
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        assert!(doc.is_visible(id));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_override_survives_rescans_and_setting_changes() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 400.0, 300.0).with_alt("Ada"));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::Blocked).await;

        assert!(doc.click(id));
        h.until_state(id, PictureState::ManuallyUnblocked).await;
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        assert_eq!(doc.alt(id).as_deref(), Some("Ada"));
        assert_eq!(doc.attribute(id, BLOCKED_ATTR), None);

        update(&h.config, |c| c.match_threshold = 0.9);
        h.idle().await;
        doc.set_source(id, ADA);
        h.idle().await;

        assert_eq!(h.inspector.state(id), Some(PictureState::ManuallyUnblocked));
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        assert!(doc.is_visible(id));
        assert_eq!(h.engine.detect_calls(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_change_reevaluates_both_ways() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(STRANGER, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::NoMatch).await;

        update(&h.config, |c| c.match_threshold = 0.7);
        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.engine.settings().match_threshold, 0.7);
        assert_eq!(h.engine.detect_calls(), 2);

        update(&h.config, |c| c.match_threshold = 0.5);
        h.until_state(id, PictureState::NoMatch).await;
        assert_eq!(doc.locator(id).as_deref(), Some(STRANGER));
        h.idle().await;
        assert_eq!(doc.click_listeners(id), 0);
        // The blocked element was re-checked against its original locator.
        let last = h.engine.requests().pop().unwrap();
        assert_eq!(last.image, veil_engine::ImageInput::Locator(STRANGER.into()));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_original_stays_blocked_after_threshold_change() {
        let doc = Arc::new(MemoryDocument::new());
        let blob = "blob:https://site/1234";
        let pixels = "data:image/png;base64,QUJD";
        doc.register(blob, Pixels::Readable(pixels.into()));
        let id = doc.add_picture(None, PictureSpec::loaded(blob, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.engine.script(pixels, Outcome::face("Ada", 0.55));
        h.engine.script(blob, Outcome::Unsupported);
        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.engine.config_pushes(), 1);

        update(&h.config, |c| c.match_threshold = 0.7);
        h.until("re-evaluation", |h| h.engine.detect_calls() == 2).await;
        h.idle().await;

        assert_eq!(h.engine.config_pushes(), 2);
        let last = h.engine.requests().pop().unwrap();
        assert_eq!(last.image, veil_engine::ImageInput::Locator(blob.into()));
        assert_eq!(h.inspector.state(id), Some(PictureState::Blocked));
        assert_eq!(h.inspector.blocked_info(id).unwrap().original_locator, blob);
        assert!(is_placeholder(&doc.locator(id).unwrap()));
        assert_eq!(doc.attribute(id, BLOCKED_ATTR).as_deref(), Some("true"));
        assert_eq!(doc.click_listeners(id), 1);
        assert_eq!(h.engine.detect_calls(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_replacing_blocked_picture_clears_block_markers() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 400.0, 300.0).with_alt("Ada at the beach"));
        let h = Harness::start(doc.clone(), true).await;
        let ada_again = "https://site/ada-2.jpg";
        h.engine.script(ada_again, Outcome::face("Ada", 0.4));
        h.until_state(id, PictureState::Blocked).await;

        doc.set_source(id, LANDSCAPE);
        h.until_state(id, PictureState::NoFaceFound).await;
        h.idle().await;
        assert_eq!(doc.locator(id).as_deref(), Some(LANDSCAPE));
        assert_eq!(doc.attribute(id, BLOCKED_ATTR), None);
        assert_eq!(doc.alt(id).as_deref(), Some("Ada at the beach"));
        assert!(h.inspector.blocked_info(id).is_none());
        assert_eq!(doc.click_listeners(id), 0);

        doc.set_source(id, ada_again);
        h.until_state(id, PictureState::Blocked).await;
        let info = h.inspector.blocked_info(id).unwrap();
        assert_eq!(info.original_locator, ada_again);
        assert_eq!(info.original_alt.as_deref(), Some("Ada at the beach"));

        // The page can also swap in a new picture straight over the placeholder.
        doc.set_source(id, ADA);
        h.until("fresh block on the new locator", |h| {
            h.inspector.blocked_info(id).is_some_and(|info| info.original_locator == ADA)
        })
        .await;
        assert_eq!(h.inspector.blocked_info(id).unwrap().original_alt.as_deref(), Some("Ada at the beach"));
        h.idle().await;
        assert_eq!(doc.click_listeners(id), 1);

        assert!(doc.click(id));
        h.until_state(id, PictureState::ManuallyUnblocked).await;
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        assert_eq!(doc.alt(id).as_deref(), Some("Ada at the beach"));
        assert_eq!(doc.attribute(id, BLOCKED_ATTR), None);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_restores_originals_and_enable_rescans() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::Blocked).await;

        update(&h.config, |c| c.enabled = false);
        h.until("block to be lifted", |h| h.inspector.state(id).is_none()).await;
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        assert!(doc.is_visible(id));

        update(&h.config, |c| c.enabled = true);
        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.engine.detect_calls(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_mode_hint_follows_settings() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(LANDSCAPE, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::NoFaceFound).await;
        assert_eq!(h.engine.requests()[0].mode, Some(DetectorMode::Hybrid));

        update(&h.config, |c| c.detector_mode = DetectorMode::Thorough);
        h.until("second detection", |h| h.engine.detect_calls() == 2).await;
        assert_eq!(h.engine.requests()[1].mode, Some(DetectorMode::Thorough));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gallery_change_reevaluates() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 400.0, 300.0));
        let h = Harness::start(doc.clone(), false).await;
        h.until_state(id, PictureState::Skipped).await;
        assert_eq!(h.engine.detect_calls(), 0);

        let entry = ada_gallery().remove(0);
        h.gallery.add("Ada", entry.embeddings, None).unwrap();
        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.engine.gallery_pushes(), 2);

        h.gallery.clear().unwrap();
        h.until_state(id, PictureState::Skipped).await;
        assert_eq!(doc.locator(id).as_deref(), Some(ADA));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_locator_change_during_detection_gets_fresh_evaluation() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(LANDSCAPE, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.engine.slow_down(Duration::from_millis(300));

        h.until("first request", |h| h.engine.detect_calls() == 1).await;
        doc.set_source(id, ADA);

        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.inspector.blocked_info(id).unwrap().original_locator, ADA);
        assert_eq!(h.engine.detect_calls(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_engine_reveals_and_retries_on_change() {
        let doc = Arc::new(MemoryDocument::new());
        let hang = "https://site/hang.jpg";
        let id = doc.add_picture(None, PictureSpec::loaded(hang, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.engine.script(hang, Outcome::Hang);

        h.until("first request", |h| h.engine.detect_calls() == 1).await;
        h.until("timeout to reveal the picture", |h| h.doc.is_visible(id) && h.inspector.state(id).is_none())
            .await;

        doc.set_source(id, LANDSCAPE);
        h.until_state(id, PictureState::NoFaceFound).await;
        assert_eq!(h.engine.detect_calls(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_picture_waits_for_completion() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loading(ADA, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::AwaitingLoad).await;
        assert_eq!(h.engine.detect_calls(), 0);
        assert!(!doc.is_visible(id));

        doc.finish_load(id, Size::new(400.0, 300.0), LoadOutcome::Loaded);
        h.until_state(id, PictureState::Blocked).await;
        assert_eq!(h.engine.detect_calls(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_picture_is_forgotten() {
        let doc = Arc::new(MemoryDocument::new());
        let id = doc.add_picture(None, PictureSpec::loaded(LANDSCAPE, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;
        h.until_state(id, PictureState::NoFaceFound).await;

        doc.remove(id);
        h.until("record to be dropped", |h| h.inspector.state(id).is_none()).await;
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrating_page_waits_and_hides_inline() {
        let doc = Arc::new(MemoryDocument::with_shell(DocumentShell {
            host: "www.reddit.com".into(),
            markup: String::new(),
        }));
        let id = doc.add_picture(None, PictureSpec::loaded(ADA, 400.0, 300.0));
        let h = Harness::start(doc.clone(), true).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.detect_calls(), 0);
        assert!(doc.style_rules().is_empty());

        doc.signal_idle();
        h.until_state(id, PictureState::Blocked).await;
        assert!(doc.style_rules().is_empty());
        assert!(doc
            .mutations()
            .iter()
            .any(|(node, m)| *node == id
                && *m
                    == crate::document::Mutation::SetStyle {
                        property: "visibility".into(),
                        value: Some("hidden".into())
                    }));
        h.stop().await;
    }
}
