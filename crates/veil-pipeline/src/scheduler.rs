//! Debounced work queue and bounded-concurrency batch runner.

use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Coalesces bursts of submissions into batches.
///
/// A batch is flushed once no new item arrived for `window`, or `max_latency`
/// after its first item, whichever comes first. Duplicates within a batch are
/// dropped; first-submission order is kept.
pub struct Debouncer<T> {
    rx: mpsc::UnboundedReceiver<T>,
    window: Duration,
    max_latency: Duration,
}

impl<T: Eq + Hash + Clone> Debouncer<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, window: Duration, max_latency: Duration) -> Self {
        Self {
            rx,
            window,
            max_latency,
        }
    }

    /// Next batch, or `None` once every sender is gone and the queue is drained.
    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        let first = self.rx.recv().await?;
        let deadline = Instant::now() + self.max_latency;

        let mut seen = HashSet::from([first.clone()]);
        let mut batch = vec![first];

        loop {
            let quiet_until = (Instant::now() + self.window).min(deadline);
            match timeout_at(quiet_until, self.rx.recv()).await {
                Ok(Some(item)) => {
                    if seen.insert(item.clone()) {
                        batch.push(item);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }
}

/// Run `f` over `items` in chunks of `batch_size`, concurrently within a
/// chunk, yielding to the runtime between chunks. Results keep input order.
pub async fn run_in_batches<T, F, Fut>(items: Vec<T>, batch_size: usize, mut f: F) -> Vec<Fut::Output>
where
    F: FnMut(T) -> Fut,
    Fut: Future,
{
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let chunk: Vec<Fut> = items.by_ref().take(batch_size).map(&mut f).collect();
        results.extend(join_all(chunk).await);
        if items.peek().is_some() {
            tokio::task::yield_now().await;
        }
    }
    results
}
