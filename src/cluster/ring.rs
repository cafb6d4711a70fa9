use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh3::xxh3_64;

pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Consistent hash ring mapping keys to an ordered list of physical node ids.
///
/// Each physical node occupies `virtual_nodes` positions at `hash(id#i)`. Replica
/// selection walks clockwise from the key's hash and collects distinct nodes.
pub struct HashRing {
    virtual_nodes: usize,
    positions: RwLock<BTreeMap<u64, String>>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: RwLock::new(BTreeMap::new()),
        }
    }

    fn position(label: &str) -> u64 {
        xxh3_64(label.as_bytes())
    }

    pub fn add_node(&self, node_id: &str) {
        let mut positions = self.positions.write();
        for i in 0..self.virtual_nodes {
            positions.insert(Self::position(&format!("{}#{}", node_id, i)), node_id.to_string());
        }
        tracing::debug!("Ring: added {} ({} positions total)", node_id, positions.len());
    }

    pub fn remove_node(&self, node_id: &str) {
        let mut positions = self.positions.write();
        for i in 0..self.virtual_nodes {
            let position = Self::position(&format!("{}#{}", node_id, i));
            // Only drop positions this node actually owns.
            if positions.get(&position).is_some_and(|owner| owner == node_id) {
                positions.remove(&position);
            }
        }
        tracing::debug!("Ring: removed {} ({} positions total)", node_id, positions.len());
    }

    /// Up to `replication_factor` distinct nodes for `key`, leader first.
    pub fn replicas(&self, key: &str, replication_factor: usize) -> Vec<String> {
        let positions = self.positions.read();
        if positions.is_empty() || replication_factor == 0 {
            return Vec::new();
        }

        let start = Self::position(key);
        let mut replicas: Vec<String> = Vec::with_capacity(replication_factor);
        for (_, node_id) in positions.range(start..).chain(positions.range(..start)) {
            if !replicas.iter().any(|existing| existing == node_id) {
                replicas.push(node_id.clone());
                if replicas.len() == replication_factor {
                    break;
                }
            }
        }
        replicas
    }

    pub fn nodes(&self) -> Vec<String> {
        let positions = self.positions.read();
        let unique: BTreeSet<&String> = positions.values().collect();
        unique.into_iter().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.positions.read().values().any(|owner| owner == node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
