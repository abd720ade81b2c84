//! Decision rendering: reveal, block with a placeholder, and the user override.

use crate::document::{Document, Mutation, NodeId, Rgba, Size};
use crate::gateway::{SkipReason, Verdict};
use crate::records::{BlockInfo, PictureState, RecordTable};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use veil_core::payload::{self, DataUrl};

/// Set on every picture the pipeline is done with.
pub const PROCESSED_ATTR: &str = "data-veil-processed";
/// Set on pictures currently replaced by a placeholder.
pub const BLOCKED_ATTR: &str = "data-veil-blocked";
pub const BLOCKED_ALT: &str = "Blocked picture";

const PLACEHOLDER_MEDIA_TYPE: &str = "image/svg+xml;veil=placeholder";
const MAX_ANCESTOR_DEPTH: usize = 64;

/// True for locators produced by [`placeholder_locator`].
pub fn is_placeholder(locator: &str) -> bool {
    DataUrl::parse(locator).is_some_and(|url| url.has_param("veil", "placeholder"))
}

/// First non-transparent background walking up from `id`, white if none.
pub fn effective_background(document: &dyn Document, id: NodeId) -> Rgba {
    let mut node = Some(id);
    for _ in 0..MAX_ANCESTOR_DEPTH {
        let Some(current) = node else { break };
        if let Some(color) = document.background_color(current) {
            if !color.is_transparent() {
                return color;
            }
        }
        node = document.parent(current);
    }
    Rgba::WHITE
}

/// SVG placeholder: background fill, contrasting border, circle-slash indicator.
pub fn placeholder_svg(size: Size, background: Rgba) -> String {
    let w = size.width.round().max(1.0) as u32;
    let h = size.height.round().max(1.0) as u32;
    let fg = if background.luminance() > 0.179 {
        Rgba::BLACK
    } else {
        Rgba::WHITE
    };
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    let r = (w.min(h) as f32 * 0.12).clamp(6.0, 24.0);
    let d = r * std::f32::consts::FRAC_1_SQRT_2;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#
    );
    let _ = write!(
        svg,
        r#"<rect x="1" y="1" width="{}" height="{}" fill="{}" stroke="{}" stroke-width="2"/>"#,
        w.saturating_sub(2).max(1),
        h.saturating_sub(2).max(1),
        background.to_hex(),
        fg.to_hex()
    );
    let _ = write!(
        svg,
        r#"<g fill="none" stroke="{fg}" stroke-width="{sw:.1}" opacity="0.6"><circle cx="{cx:.1}" cy="{cy:.1}" r="{r:.1}"/><line x1="{x1:.1}" y1="{y1:.1}" x2="{x2:.1}" y2="{y2:.1}"/></g></svg>"#,
        fg = fg.to_hex(),
        sw = (r / 4.0).max(1.5),
        x1 = cx - d,
        y1 = cy - d,
        x2 = cx + d,
        y2 = cy + d,
    );
    svg
}

pub fn placeholder_locator(size: Size, background: Rgba) -> String {
    payload::encode_data_url(PLACEHOLDER_MEDIA_TYPE, placeholder_svg(size, background).as_bytes())
}

/// Applies verdicts to the document and keeps the records in step.
#[derive(Clone)]
pub struct Renderer {
    document: Arc<dyn Document>,
    records: Arc<RecordTable>,
    /// Click-to-unblock listeners of the elements currently blocked.
    clicks: Arc<Mutex<HashMap<NodeId, AbortHandle>>>,
}

impl Renderer {
    pub fn new(document: Arc<dyn Document>, records: Arc<RecordTable>) -> Self {
        Self {
            document,
            records,
            clicks: Arc::default(),
        }
    }

    fn clicks(&self) -> MutexGuard<'_, HashMap<NodeId, AbortHandle>> {
        self.clicks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep the element hidden while it is evaluated. Dropping the processed
    /// marker puts it back under the preloader rule; without the rule it is
    /// hidden inline.
    pub fn hide_for_detection(&self, id: NodeId, rule_active: bool) {
        self.document.apply(id, Mutation::RemoveAttribute(PROCESSED_ATTR.into()));
        if !rule_active {
            self.document.apply(
                id,
                Mutation::SetStyle {
                    property: "visibility".into(),
                    value: Some("hidden".into()),
                },
            );
        }
        self.records.set_state(id, PictureState::Hidden);
    }

    pub fn reveal(&self, id: NodeId) {
        self.document.apply(
            id,
            Mutation::SetAttribute {
                name: PROCESSED_ATTR.into(),
                value: "true".into(),
            },
        );
        self.document.apply(
            id,
            Mutation::SetStyle {
                property: "visibility".into(),
                value: None,
            },
        );
    }

    /// Render a verdict for an evaluation of `source`. Returns the resulting state.
    pub fn render(&self, id: NodeId, source: &str, verdict: &Verdict) -> PictureState {
        match verdict {
            // The original behind a block can turn unreadable; that is no reason to show it.
            Verdict::Skip(SkipReason::UnsupportedSource) if self.records.keep_block(id) => {
                tracing::debug!(element = %id, "blocked source unreadable, block kept");
                PictureState::Blocked
            }
            Verdict::Skip(_) => self.settle(id, PictureState::Skipped),
            Verdict::NoFaceFound => self.settle(id, PictureState::NoFaceFound),
            Verdict::NoMatch { .. } => self.settle(id, PictureState::NoMatch),
            Verdict::Matched { person, distance } => self.block(id, source, person, *distance),
        }
    }

    fn settle(&self, id: NodeId, state: PictureState) -> PictureState {
        if let Some(lifted) = self.records.settle(id, state) {
            tracing::info!(element = %id, person = %lifted.person, "block lifted on re-evaluation");
            self.restore(id, &lifted);
        }
        self.reveal(id);
        state
    }

    fn block(&self, id: NodeId, source: &str, person: &str, distance: f32) -> PictureState {
        let Some(picture) = self.document.picture(id) else {
            return PictureState::Blocked;
        };
        let size = if picture.natural.width > 0.0 && picture.natural.height > 0.0 {
            picture.natural
        } else {
            picture.rendered
        };
        let placeholder = placeholder_locator(size, effective_background(self.document.as_ref(), id));
        let info = BlockInfo {
            original_locator: source.to_string(),
            original_alt: picture.alt.clone(),
            person: person.to_string(),
            distance,
        };

        // Record first: the locator change below is observed by the scanner.
        let newly_blocked = self.records.block(id, placeholder.clone(), info);
        if picture.locator.as_deref() != Some(placeholder.as_str()) {
            self.document.apply(id, Mutation::SetLocator(placeholder));
        }
        self.document.apply(id, Mutation::SetAlt(Some(BLOCKED_ALT.into())));
        self.document.apply(
            id,
            Mutation::SetAttribute {
                name: BLOCKED_ATTR.into(),
                value: "true".into(),
            },
        );
        self.reveal(id);

        if newly_blocked {
            tracing::info!(element = %id, person, distance, "picture blocked");
            self.arm_click(id);
        } else {
            tracing::debug!(element = %id, person, distance, "block confirmed");
        }
        PictureState::Blocked
    }

    fn arm_click(&self, id: NodeId) {
        let click = self.document.on_click(id);
        let renderer = self.clone();
        let task = tokio::spawn(async move {
            if click.await.is_ok() {
                renderer.unblock(id);
            }
        });
        if let Some(previous) = self.clicks().insert(id, task.abort_handle()) {
            previous.abort();
        }
    }

    fn disarm_click(&self, id: NodeId) {
        if let Some(listener) = self.clicks().remove(&id) {
            listener.abort();
        }
    }

    /// `Blocked -> ManuallyUnblocked`: put the original back.
    pub fn unblock(&self, id: NodeId) -> bool {
        let Some(info) = self.records.unblock(id) else {
            return false;
        };
        tracing::info!(element = %id, person = %info.person, "picture revealed by user");
        self.restore(id, &info);
        self.reveal(id);
        true
    }

    /// An evaluation failed or timed out. Blocked elements stay blocked;
    /// anything else is shown and left for a later pass.
    pub fn abandon(&self, id: NodeId) {
        if !self.records.abandon(id) {
            self.reveal(id);
        }
    }

    /// Clear block markers left on an element whose locator moved on.
    pub fn clear_block_markers(&self, id: NodeId, info: &BlockInfo) {
        self.disarm_click(id);
        self.document.apply(id, Mutation::SetAlt(info.original_alt.clone()));
        self.document.apply(id, Mutation::RemoveAttribute(BLOCKED_ATTR.into()));
    }

    fn restore(&self, id: NodeId, info: &BlockInfo) {
        self.document.apply(id, Mutation::SetLocator(info.original_locator.clone()));
        self.clear_block_markers(id, info);
    }

    /// Put every blocked original back and drop their records.
    pub fn restore_all_blocked(&self) -> usize {
        let blocked = self.records.take_blocked();
        for (id, info) in &blocked {
            self.restore(*id, info);
            self.reveal(*id);
        }
        blocked.len()
    }
}
