//! Cluster Client
//!
//! Routes every operation through the hash ring to the key's replica set.
//!
//! - **Writes** (`set`, `delete`, `compare_and_swap`) go to every replica in ring
//!   order and succeed once a majority acknowledges. Unreachable replicas get a
//!   hint queued for later replay. If the quorum is missed and the leader itself
//!   failed, the leader's error is returned so the caller can tell "degraded" from
//!   "down".
//! - **Reads** return the first value found scanning replicas in ring order. There
//!   is no read quorum or read repair, so a read may observe a stale replica.

use super::handoff::{Hint, HintedHandoff};
use super::node::Node;
use super::ring::HashRing;

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Smallest number of acknowledgements that makes a write durable.
pub fn majority(replicas: usize) -> usize {
    replicas / 2 + 1
}

struct WriteTally {
    replicas: usize,
    successes: usize,
    leader_error: Option<anyhow::Error>,
}

impl WriteTally {
    fn quorum_met(&self) -> bool {
        self.successes >= majority(self.replicas)
    }

    /// `Ok(true)` on quorum, the leader's error if it failed, `Ok(false)` otherwise.
    fn into_result(self, op: &str, key: &str) -> Result<bool> {
        if self.quorum_met() {
            return Ok(true);
        }
        match self.leader_error {
            Some(e) => Err(e.context(format!(
                "{} {} missed quorum ({}/{} replicas)",
                op,
                key,
                self.successes,
                majority(self.replicas)
            ))),
            None => Ok(false),
        }
    }
}

pub struct ClusterClient {
    ring: Arc<HashRing>,
    nodes: DashMap<String, Arc<dyn Node>>,
    replication_factor: usize,
    handoff: Arc<HintedHandoff>,
}

impl ClusterClient {
    pub fn new(
        ring: Arc<HashRing>,
        replication_factor: usize,
        handoff: Arc<HintedHandoff>,
    ) -> Result<Self> {
        if replication_factor == 0 {
            return Err(anyhow::anyhow!("Replication factor must be at least 1"));
        }
        Ok(Self {
            ring,
            nodes: DashMap::new(),
            replication_factor,
            handoff,
        })
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn handoff(&self) -> &Arc<HintedHandoff> {
        &self.handoff
    }

    /// Registers a node and places it on the ring.
    pub fn add_node(&self, node: Arc<dyn Node>) {
        let id = node.id().to_string();
        tracing::info!("Adding node {} to the ring", id);
        self.ring.add_node(&id);
        self.nodes.insert(id, node);
    }

    /// Takes a node off the ring. Hints already queued for it are kept.
    pub fn remove_node(&self, node_id: &str) {
        tracing::info!("Removing node {} from the ring", node_id);
        self.ring.remove_node(node_id);
        self.nodes.remove(node_id);
    }

    fn node(&self, node_id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn replicas(&self, key: &str) -> Vec<String> {
        self.ring.replicas(key, self.replication_factor)
    }

    /// Replays the hints queued for a node that has become reachable again.
    pub async fn node_rejoined(&self, node_id: &str) -> usize {
        match self.node(node_id) {
            Some(node) => self.handoff.replay(node_id, node.as_ref()).await,
            None => {
                tracing::debug!("Rejoined node {} is not registered, keeping its hints", node_id);
                0
            }
        }
    }

    /// One replay pass over every node that has hints waiting.
    pub async fn replay_pending_hints(&self) -> usize {
        let mut applied = 0;
        for node_id in self.handoff.pending_nodes() {
            applied += self.node_rejoined(&node_id).await;
        }
        applied
    }

    async fn replicate<F, Fut, H>(
        &self,
        op: &str,
        key: &str,
        call: F,
        make_hint: H,
        hint_rejections: bool,
    ) -> WriteTally
    where
        F: Fn(Arc<dyn Node>) -> Fut,
        Fut: Future<Output = Result<bool>>,
        H: Fn() -> Hint,
    {
        let replicas = self.replicas(key);
        let mut tally = WriteTally {
            replicas: replicas.len(),
            successes: 0,
            leader_error: None,
        };
        if replicas.is_empty() {
            tracing::warn!("{} {}: no nodes on the ring", op, key);
            return tally;
        }

        for (idx, node_id) in replicas.iter().enumerate() {
            let is_leader = idx == 0;
            let result = match self.node(node_id) {
                Some(node) => call(node).await,
                None => Err(anyhow::anyhow!("Node {} is not registered", node_id)),
            };

            match result {
                Ok(true) => tally.successes += 1,
                Ok(false) => {
                    tracing::debug!("{} {}: {} declined", op, key, node_id);
                    if hint_rejections && !is_leader {
                        self.handoff.record(node_id, make_hint());
                    }
                }
                Err(e) => {
                    tracing::debug!("{} {}: {} failed: {:#}", op, key, node_id, e);
                    self.handoff.record(node_id, make_hint());
                    if is_leader {
                        tally.leader_error = Some(e);
                    }
                }
            }
        }

        if !tally.quorum_met() {
            tracing::warn!(
                "{} {}: {}/{} acknowledgements, quorum is {}",
                op,
                key,
                tally.successes,
                tally.replicas,
                majority(tally.replicas)
            );
        }
        tally
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let tally = self
            .replicate(
                "SET",
                key,
                |node| {
                    let value = value.clone();
                    async move { node.set(key, value, ttl).await }
                },
                || Hint::Set {
                    key: key.to_string(),
                    value: value.clone(),
                    ttl,
                },
                true,
            )
            .await;
        tally.into_result("SET", key)
    }

    pub async fn delete(&self, key: &str) -> bool {
        let tally = self
            .replicate(
                "DELETE",
                key,
                |node| async move { node.delete(key).await },
                || Hint::Delete {
                    key: key.to_string(),
                },
                true,
            )
            .await;
        tally.quorum_met()
    }

    /// A replica holding a different token answers `Ok(false)`; that is a conflict,
    /// not a failure, so it is neither counted nor hinted.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    ) -> Result<bool> {
        let tally = self
            .replicate(
                "CAS",
                key,
                |node| {
                    let value = value.clone();
                    async move { node.compare_and_swap(key, value, expected, ttl).await }
                },
                || Hint::Cas {
                    key: key.to_string(),
                    value: value.clone(),
                    expected,
                    ttl,
                },
                false,
            )
            .await;
        tally.into_result("CAS", key)
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        for node_id in self.replicas(key) {
            let Some(node) = self.node(&node_id) else {
                continue;
            };
            match node.get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => tracing::debug!("GET {}: {} failed: {:#}", key, node_id, e),
            }
        }
        None
    }

    /// Read-one lookup that also returns the answering replica's CAS token.
    pub async fn get_with_token(&self, key: &str) -> Option<(Bytes, u64)> {
        for node_id in self.replicas(key) {
            let Some(node) = self.node(&node_id) else {
                continue;
            };
            match node.get_with_token(key).await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(e) => tracing::debug!("GETS {}: {} failed: {:#}", key, node_id, e),
            }
        }
        None
    }

    /// Best-effort flush of every node on the ring. Failures are logged only.
    pub async fn clear(&self) {
        for node_id in self.ring.nodes() {
            let Some(node) = self.node(&node_id) else {
                continue;
            };
            if let Err(e) = node.clear().await {
                tracing::warn!("CLEAR: {} failed: {:#}", node_id, e);
            }
        }
    }
}
