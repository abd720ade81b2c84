//! Processing Records: per-element bookkeeping of which locator was evaluated
//! and what came of it.
//!
//! The table, not the element, decides whether a picture needs another look.
//! Every method takes the lock briefly; nothing here is held across an await.

use crate::document::NodeId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureState {
    Unprocessed,
    Hidden,
    AwaitingLoad,
    Detecting,
    NoFaceFound,
    NoMatch,
    /// Revealed without detection (empty gallery, too small, own placeholder, unreadable source).
    Skipped,
    Blocked,
    /// Revealed by the user. Never re-blocked for the same locator.
    ManuallyUnblocked,
}

impl PictureState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PictureState::NoFaceFound
                | PictureState::NoMatch
                | PictureState::Skipped
                | PictureState::Blocked
                | PictureState::ManuallyUnblocked
        )
    }

    fn in_flight(self) -> bool {
        matches!(
            self,
            PictureState::Unprocessed | PictureState::Hidden | PictureState::Detecting
        )
    }
}

/// What a blocked element replaced, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub original_locator: String,
    pub original_alt: Option<String>,
    pub person: String,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    /// Locator the evaluation ran against. Never the placeholder.
    pub source: String,
    /// Locator the element displays as a result: the placeholder while blocked, else `source`.
    pub shown: String,
    pub state: PictureState,
    /// Verdict predates a settings or gallery change.
    pub stale: bool,
    /// A newer locator arrived while the evaluation was in flight.
    pub rerun: bool,
    pub block: Option<BlockInfo>,
    load_waits: u32,
}

impl ProcessingRecord {
    fn fresh(locator: &str) -> Self {
        Self {
            source: locator.to_string(),
            shown: locator.to_string(),
            state: PictureState::Unprocessed,
            stale: false,
            rerun: false,
            block: None,
            load_waits: 0,
        }
    }
}

/// How to evaluate a claimed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationTarget {
    pub locator: String,
    /// Pixels on screen belong to `locator` and may be exported.
    pub rasterize: bool,
    /// Element is already showing a processed result and must not be hidden again.
    pub revealed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Nothing changed since the last verdict.
    Skip,
    /// An evaluation is in flight; it will be rerun when it completes.
    Deferred,
    Evaluate(EvaluationTarget),
    /// The page swapped the placeholder of a blocked element for a new locator.
    /// The block is void and its markers must be cleared before evaluating.
    Replaced {
        target: EvaluationTarget,
        dropped_block: BlockInfo,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    /// Verdict applies; render it.
    Render,
    /// The element moved on; discard the verdict and submit again.
    Rerun { dropped_block: Option<BlockInfo> },
    /// Record was forgotten or replaced meanwhile.
    Gone,
}

#[derive(Default)]
pub struct RecordTable {
    records: Mutex<HashMap<NodeId, ProcessingRecord>>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, ProcessingRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether an element currently showing `locator` should be submitted.
    pub fn needs_evaluation(&self, id: NodeId, locator: &str) -> bool {
        let records = self.lock();
        let Some(rec) = records.get(&id) else {
            return true;
        };
        match rec.state {
            s if s.in_flight() => locator != rec.source && locator != rec.shown,
            PictureState::AwaitingLoad => locator != rec.source,
            PictureState::ManuallyUnblocked => locator != rec.shown,
            _ => rec.stale || locator != rec.shown,
        }
    }

    /// Decide whether `locator` needs an evaluation and, if so, reserve it.
    pub fn claim(&self, id: NodeId, locator: &str) -> Claim {
        let mut records = self.lock();
        let Some(rec) = records.get_mut(&id) else {
            records.insert(id, ProcessingRecord::fresh(locator));
            return Claim::Evaluate(EvaluationTarget {
                locator: locator.to_string(),
                rasterize: true,
                revealed: false,
            });
        };

        match rec.state {
            s if s.in_flight() => {
                if locator == rec.source || locator == rec.shown {
                    Claim::Skip
                } else {
                    rec.rerun = true;
                    Claim::Deferred
                }
            }
            PictureState::AwaitingLoad if locator == rec.source => {
                rec.state = PictureState::Unprocessed;
                Claim::Evaluate(EvaluationTarget {
                    locator: locator.to_string(),
                    rasterize: true,
                    revealed: false,
                })
            }
            PictureState::ManuallyUnblocked if locator == rec.shown => Claim::Skip,
            s if s.is_terminal() && locator == rec.shown => {
                if !rec.stale {
                    return Claim::Skip;
                }
                rec.stale = false;
                let blocked = s == PictureState::Blocked;
                rec.state = PictureState::Detecting;
                Claim::Evaluate(EvaluationTarget {
                    locator: rec.source.clone(),
                    // A blocked element displays the placeholder, not the source.
                    rasterize: !blocked,
                    revealed: true,
                })
            }
            _ => {
                let dropped = rec.block.take();
                *rec = ProcessingRecord::fresh(locator);
                let target = EvaluationTarget {
                    locator: locator.to_string(),
                    rasterize: true,
                    revealed: false,
                };
                match dropped {
                    Some(dropped_block) => Claim::Replaced { target, dropped_block },
                    None => Claim::Evaluate(target),
                }
            }
        }
    }

    pub fn set_state(&self, id: NodeId, state: PictureState) {
        if let Some(rec) = self.lock().get_mut(&id) {
            rec.state = state;
        }
    }

    pub fn state(&self, id: NodeId) -> Option<PictureState> {
        self.lock().get(&id).map(|rec| rec.state)
    }

    /// Park the element until it loads. Returns true only for its first wait.
    pub fn await_load(&self, id: NodeId) -> bool {
        let mut records = self.lock();
        let Some(rec) = records.get_mut(&id) else {
            return false;
        };
        rec.state = PictureState::AwaitingLoad;
        rec.load_waits += 1;
        rec.load_waits == 1
    }

    /// Called when a detection for `claimed` returns; `current` is the element's locator now.
    pub fn finish(&self, id: NodeId, claimed: &str, current: Option<&str>) -> Finish {
        let mut records = self.lock();
        let Some(rec) = records.get_mut(&id) else {
            return Finish::Gone;
        };
        if rec.source != claimed {
            return Finish::Gone;
        }

        let moved = current != Some(claimed) && current != Some(rec.shown.as_str());
        if moved {
            let dropped_block = rec.block.take();
            records.remove(&id);
            return Finish::Rerun { dropped_block };
        }
        if rec.rerun {
            rec.rerun = false;
            if rec.block.is_some() {
                rec.state = PictureState::Blocked;
                rec.stale = true;
            } else {
                records.remove(&id);
            }
            return Finish::Rerun { dropped_block: None };
        }
        Finish::Render
    }

    /// Record a reveal-type verdict. Returns the block it lifts, if any.
    pub fn settle(&self, id: NodeId, state: PictureState) -> Option<BlockInfo> {
        let mut records = self.lock();
        let rec = records.get_mut(&id)?;
        rec.state = state;
        rec.shown = rec.source.clone();
        rec.stale = false;
        rec.block.take()
    }

    /// Record a block. Returns true when the element was not blocked before.
    ///
    /// Re-blocking an already blocked element keeps the original locator and alt text.
    pub fn block(&self, id: NodeId, placeholder: String, info: BlockInfo) -> bool {
        let mut records = self.lock();
        let Some(rec) = records.get_mut(&id) else {
            return false;
        };
        rec.state = PictureState::Blocked;
        rec.shown = placeholder;
        rec.stale = false;
        match rec.block.take() {
            Some(previous) => {
                rec.block = Some(BlockInfo {
                    original_locator: previous.original_locator,
                    original_alt: previous.original_alt,
                    ..info
                });
                false
            }
            None => {
                rec.block = Some(info);
                true
            }
        }
    }

    /// Leave an existing block in place and retry it on the next pass.
    /// Returns false when the element holds no block.
    pub fn keep_block(&self, id: NodeId) -> bool {
        match self.lock().get_mut(&id) {
            Some(rec) if rec.block.is_some() => {
                rec.state = PictureState::Blocked;
                rec.stale = true;
                true
            }
            _ => false,
        }
    }

    /// An evaluation failed. A blocked element keeps its block and is retried
    /// on the next pass; anything else is forgotten. Returns true if the block was kept.
    pub fn abandon(&self, id: NodeId) -> bool {
        let mut records = self.lock();
        match records.get_mut(&id) {
            Some(rec) if rec.block.is_some() => {
                rec.state = PictureState::Blocked;
                rec.stale = true;
                true
            }
            Some(_) => {
                records.remove(&id);
                false
            }
            None => false,
        }
    }

    /// `Blocked -> ManuallyUnblocked`. Returns what to restore.
    pub fn unblock(&self, id: NodeId) -> Option<BlockInfo> {
        let mut records = self.lock();
        let rec = records.get_mut(&id)?;
        if rec.state != PictureState::Blocked {
            return None;
        }
        let info = rec.block.take()?;
        rec.state = PictureState::ManuallyUnblocked;
        rec.source = info.original_locator.clone();
        rec.shown = info.original_locator.clone();
        rec.stale = false;
        Some(info)
    }

    pub fn blocked_info(&self, id: NodeId) -> Option<BlockInfo> {
        let records = self.lock();
        let rec = records.get(&id)?;
        (rec.state == PictureState::Blocked).then(|| rec.block.clone()).flatten()
    }

    /// Mark every record except manual overrides for re-evaluation. Returns how many.
    pub fn invalidate_all(&self) -> usize {
        let mut records = self.lock();
        let mut count = 0;
        for rec in records.values_mut() {
            match rec.state {
                PictureState::ManuallyUnblocked | PictureState::AwaitingLoad => continue,
                s if s.in_flight() => rec.rerun = true,
                _ => rec.stale = true,
            }
            count += 1;
        }
        count
    }

    pub fn forget(&self, id: NodeId) {
        self.lock().remove(&id);
    }

    /// Remove and return every active block.
    pub fn take_blocked(&self) -> Vec<(NodeId, BlockInfo)> {
        let mut records = self.lock();
        let mut blocked: Vec<(NodeId, BlockInfo)> = records
            .iter_mut()
            .filter(|(_, rec)| rec.state == PictureState::Blocked)
            .filter_map(|(id, rec)| rec.block.take().map(|info| (*id, info)))
            .collect();
        for (id, _) in &blocked {
            records.remove(id);
        }
        blocked.sort_by_key(|(id, _)| *id);
        blocked
    }

    /// Drop every record except manual overrides.
    pub fn retain_unblocked(&self) {
        self.lock()
            .retain(|_, rec| rec.state == PictureState::ManuallyUnblocked);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
