//! Hinted Handoff
//!
//! Writes that a replica missed while unreachable are parked here, one FIFO queue
//! per node id, and replayed in submission order once the node is back. Replay
//! stops at the first failure and leaves the failed hint at the head, so a node
//! never observes its writes out of order.

use super::node::Node;

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A deferred write for one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    Set {
        key: String,
        value: Bytes,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
    Cas {
        key: String,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    },
}

impl Hint {
    pub fn key(&self) -> &str {
        match self {
            Hint::Set { key, .. } | Hint::Delete { key } | Hint::Cas { key, .. } => key,
        }
    }

    /// Re-issues the write. Only transport failures count as failures; a replica
    /// answering "no" has still received the hint.
    pub async fn apply_to(&self, node: &dyn Node) -> Result<()> {
        match self {
            Hint::Set { key, value, ttl } => {
                node.set(key, value.clone(), *ttl).await?;
            }
            Hint::Delete { key } => {
                node.delete(key).await?;
            }
            Hint::Cas {
                key,
                value,
                expected,
                ttl,
            } => {
                node.compare_and_swap(key, value.clone(), *expected, *ttl)
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct HintQueue {
    hints: Mutex<VecDeque<Hint>>,
    /// Serializes replays for this node.
    replaying: tokio::sync::Mutex<()>,
}

#[derive(Default)]
pub struct HintedHandoff {
    queues: DashMap<String, Arc<HintQueue>>,
}

impl HintedHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hint` to the tail of `node_id`'s queue.
    pub fn record(&self, node_id: &str, hint: Hint) {
        tracing::warn!(
            "Recording hint for {} on unreachable node {}",
            hint.key(),
            node_id
        );
        // Pushed while holding the map entry so an emptied queue cannot be
        // removed between lookup and append.
        self.queues
            .entry(node_id.to_string())
            .or_default()
            .hints
            .lock()
            .push_back(hint);
    }

    pub fn record_set(&self, node_id: &str, key: &str, value: Bytes, ttl: Duration) {
        self.record(
            node_id,
            Hint::Set {
                key: key.to_string(),
                value,
                ttl,
            },
        );
    }

    pub fn record_delete(&self, node_id: &str, key: &str) {
        self.record(
            node_id,
            Hint::Delete {
                key: key.to_string(),
            },
        );
    }

    pub fn record_cas(&self, node_id: &str, key: &str, value: Bytes, expected: u64, ttl: Duration) {
        self.record(
            node_id,
            Hint::Cas {
                key: key.to_string(),
                value,
                expected,
                ttl,
            },
        );
    }

    /// Drains `node_id`'s queue into `node` and returns how many hints were applied.
    pub async fn replay(&self, node_id: &str, node: &dyn Node) -> usize {
        let queue = self.queues.get(node_id).map(|entry| entry.value().clone());
        let Some(queue) = queue else {
            return 0;
        };

        let _replaying = queue.replaying.lock().await;
        let mut applied = 0;

        loop {
            let next = queue.hints.lock().pop_front();
            let Some(hint) = next else {
                break;
            };

            if let Err(e) = hint.apply_to(node).await {
                tracing::warn!(
                    "Hint replay to {} stopped after {} hints: {}",
                    node_id,
                    applied,
                    e
                );
                queue.hints.lock().push_front(hint);
                return applied;
            }
            applied += 1;
        }

        self.queues
            .remove_if(node_id, |_, queue| queue.hints.lock().is_empty());
        if applied > 0 {
            tracing::info!("Replayed {} hints to {}", applied, node_id);
        }
        applied
    }

    /// Hints currently queued for `node_id`, head first.
    pub fn pending(&self, node_id: &str) -> Vec<Hint> {
        self.queues
            .get(node_id)
            .map(|entry| entry.value().hints.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, node_id: &str) -> usize {
        self.queues
            .get(node_id)
            .map(|entry| entry.value().hints.lock().len())
            .unwrap_or(0)
    }

    pub fn pending_nodes(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|entry| !entry.value().hints.lock().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn total_pending(&self) -> usize {
        self.queues
            .iter()
            .map(|entry| entry.value().hints.lock().len())
            .sum()
    }
}
