//! Enumerates pictures and watches the document for new or changed ones.

use crate::document::{Document, DocumentChange, LoadOutcome, NodeId, LOCATOR_ATTRIBUTES};
use crate::records::RecordTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Feeds element ids into the controller's debounced queue.
#[derive(Clone)]
pub struct Scanner {
    document: Arc<dyn Document>,
    records: Arc<RecordTable>,
    pending: mpsc::UnboundedSender<NodeId>,
    load_wait: Duration,
}

impl Scanner {
    pub fn new(
        document: Arc<dyn Document>,
        records: Arc<RecordTable>,
        pending: mpsc::UnboundedSender<NodeId>,
        load_wait: Duration,
    ) -> Self {
        Self {
            document,
            records,
            pending,
            load_wait,
        }
    }

    /// Every picture that needs a look, in document order.
    pub fn scan_existing(&self) -> Vec<NodeId> {
        self.document
            .pictures()
            .into_iter()
            .filter(|&id| self.wants(id))
            .collect()
    }

    fn wants(&self, id: NodeId) -> bool {
        match self.document.picture(id) {
            Some(picture) => match picture.locator.as_deref() {
                Some(locator) => self.records.needs_evaluation(id, locator),
                None => false,
            },
            None => false,
        }
    }

    /// Watch insertions, removals and locator changes until the document stops reporting.
    pub fn observe(&self) -> JoinHandle<()> {
        let mut changes = self.document.subscribe();
        let scanner = self.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                match change {
                    DocumentChange::Inserted(id) => {
                        if scanner.wants(id) {
                            scanner.resubmit(id);
                        }
                    }
                    DocumentChange::AttributeChanged { node, attribute } => {
                        if LOCATOR_ATTRIBUTES.contains(&attribute.as_str()) && scanner.wants(node) {
                            scanner.resubmit(node);
                        }
                    }
                    DocumentChange::Removed(id) => {
                        tracing::trace!(element = %id, "picture removed");
                        scanner.records.forget(id);
                    }
                }
            }
            tracing::debug!("document change stream closed");
        })
    }

    pub fn resubmit(&self, id: NodeId) {
        // The receiver only goes away at shutdown.
        let _ = self.pending.send(id);
    }

    /// Resubmit once the picture finishes or fails loading, giving up after the load wait.
    pub fn defer_until_loaded(&self, id: NodeId) {
        let loaded = self.document.on_load(id);
        let scanner = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(scanner.load_wait, loaded).await {
                Ok(Ok(outcome)) => {
                    if outcome == LoadOutcome::Failed {
                        tracing::debug!(element = %id, "picture failed to load");
                    }
                    scanner.resubmit(id);
                }
                // Listener dropped: the element is gone.
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::debug!(element = %id, wait = ?scanner.load_wait, "load wait expired");
                    scanner.resubmit(id);
                }
            }
        });
    }
}
