use super::engine::CacheEngine;
use super::entry::ExpiringKey;

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Min-heap of pending expiries shared by every segment.
///
/// Many writers push, a single reaper drains whatever is due.
#[derive(Default)]
pub struct ExpiryQueue {
    heap: Mutex<BinaryHeap<Reverse<ExpiringKey>>>,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: ExpiringKey) {
        self.heap.lock().push(Reverse(item));
    }

    /// Pops every entry whose deadline is at or before `now`, earliest first.
    pub fn drain_due(&self, now: i64) -> Vec<ExpiringKey> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap
            .peek()
            .is_some_and(|Reverse(next)| next.expire_at_millis <= now)
        {
            if let Some(Reverse(item)) = heap.pop() {
                due.push(item);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }

    /// Drops duplicates and every entry `keep` rejects, returning how many were
    /// dropped. `keep` runs without the queue lock held, so it may take segment
    /// locks; pushes that race with compaction are kept.
    pub fn compact<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&ExpiringKey) -> bool,
    {
        let mut items = std::mem::take(&mut *self.heap.lock()).into_vec();
        let before = items.len();
        items.sort_unstable();
        items.dedup();
        items.retain(|Reverse(item)| keep(item));

        let dropped = before - items.len();
        self.heap.lock().extend(items);
        dropped
    }
}

/// Background task that sweeps expired entries out of an engine on a fixed interval.
pub struct Reaper {
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(engine: Arc<CacheEngine>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!("Expiry reaper started (interval {:?})", interval);
            loop {
                ticker.tick().await;
                let reaped = engine.reap_expired();
                if reaped > 0 {
                    tracing::debug!("Reaper removed {} expired entries", reaped);
                }
            }
        });

        Self { handle }
    }

    /// Stops scheduling further sweeps. A sweep already running completes first,
    /// since the task can only be cancelled at its next tick.
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
