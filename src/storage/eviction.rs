//! Eviction Policies
//!
//! Each segment owns one policy instance and consults it before inserting a key.
//! The segment itself keeps keys in access order (eldest first), so policies only
//! need to decide *whether* a candidate gets in and *who* leaves to make room.
//!
//! - **LRU**: always admits, evicting the least recently touched key at capacity.
//! - **Approximate LFU**: admits a newcomer at capacity only when its estimated
//!   access frequency beats the eldest resident's. Frequencies come from a
//!   count-min style sketch with a sliding decay window.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    AdmitEvicting(String),
    Reject,
}

/// What a policy may observe about the segment it guards.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView<'a> {
    pub len: usize,
    pub contains_candidate: bool,
    /// Least recently accessed resident key.
    pub eldest: Option<&'a str>,
}

pub trait EvictionPolicy: Send {
    fn admit(&mut self, candidate: &str, view: SegmentView<'_>, capacity: usize) -> Admission;

    fn record_access(&mut self, key: &str);

    fn on_remove(&mut self, _key: &str) {}

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    #[default]
    Lru,
    Lfu,
}

impl EvictionKind {
    pub fn build(self, capacity: usize) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionKind::Lru => Box::new(LruPolicy),
            EvictionKind::Lfu => Box::new(LfuPolicy::new(capacity)),
        }
    }
}

impl std::str::FromStr for EvictionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionKind::Lru),
            "lfu" => Ok(EvictionKind::Lfu),
            other => Err(anyhow::anyhow!("Unknown eviction policy: {}", other)),
        }
    }
}

/// Recency is tracked by the segment's access list, so there is no per-key state here.
#[derive(Debug, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn admit(&mut self, _candidate: &str, view: SegmentView<'_>, capacity: usize) -> Admission {
        if view.contains_candidate || view.len < capacity {
            return Admission::Admit;
        }
        match view.eldest {
            Some(victim) => Admission::AdmitEvicting(victim.to_string()),
            None => Admission::Admit,
        }
    }

    fn record_access(&mut self, _key: &str) {}

    fn name(&self) -> &'static str {
        "lru"
    }
}

pub struct LfuPolicy {
    sketch: FrequencySketch,
}

impl LfuPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            sketch: FrequencySketch::new(capacity),
        }
    }

    pub fn estimate(&self, key: &str) -> u8 {
        self.sketch.estimate(key)
    }
}

impl EvictionPolicy for LfuPolicy {
    fn admit(&mut self, candidate: &str, view: SegmentView<'_>, capacity: usize) -> Admission {
        if view.contains_candidate || view.len < capacity {
            return Admission::Admit;
        }
        let Some(victim) = view.eldest else {
            return Admission::Admit;
        };

        // Rejected attempts still count towards the candidate's frequency.
        self.sketch.increment(candidate);

        let candidate_freq = self.sketch.estimate(candidate);
        let victim_freq = self.sketch.estimate(victim);
        if candidate_freq > victim_freq {
            Admission::AdmitEvicting(victim.to_string())
        } else {
            tracing::trace!(
                "LFU rejected {} (freq {}) against {} (freq {})",
                candidate,
                candidate_freq,
                victim,
                victim_freq
            );
            Admission::Reject
        }
    }

    fn record_access(&mut self, key: &str) {
        self.sketch.increment(key);
    }

    fn name(&self) -> &'static str {
        "lfu"
    }
}

const SKETCH_DEPTH: usize = 4;
const SKETCH_SEEDS: [u64; SKETCH_DEPTH] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
    0xD6E8_FEB8_6659_FD93,
];
const MIN_WINDOW: usize = 256;
const MAX_WINDOW: usize = 65_536;

/// Saturating 8-bit counters addressed by four independently seeded hashes.
///
/// Estimates never undercount a key; collisions can only inflate them. Once the
/// sample window is full, every new increment retires the oldest one so that
/// stale popularity fades.
pub struct FrequencySketch {
    counters: Vec<u8>,
    mask: usize,
    window: VecDeque<[usize; SKETCH_DEPTH]>,
    window_size: usize,
}

impl FrequencySketch {
    pub fn new(capacity: usize) -> Self {
        let window_size = capacity.saturating_mul(16).clamp(MIN_WINDOW, MAX_WINDOW);
        // Four slots per sample over four times as many counters keeps the
        // average counter load near one even with a full window.
        let width = (window_size * SKETCH_DEPTH).next_power_of_two();

        Self {
            counters: vec![0; width],
            mask: width - 1,
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn slots(&self, key: &str) -> [usize; SKETCH_DEPTH] {
        let mut slots = [0usize; SKETCH_DEPTH];
        for (slot, seed) in slots.iter_mut().zip(SKETCH_SEEDS) {
            *slot = (xxh3_64_with_seed(key.as_bytes(), seed) as usize) & self.mask;
        }
        slots
    }

    pub fn increment(&mut self, key: &str) {
        let slots = self.slots(key);
        for slot in slots {
            self.counters[slot] = self.counters[slot].saturating_add(1);
        }

        if self.window.len() == self.window_size
            && let Some(retired) = self.window.pop_front()
        {
            for slot in retired {
                self.counters[slot] = self.counters[slot].saturating_sub(1);
            }
        }
        self.window.push_back(slots);
    }

    pub fn estimate(&self, key: &str) -> u8 {
        self.slots(key)
            .into_iter()
            .map(|slot| self.counters[slot])
            .min()
            .unwrap_or(0)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}
