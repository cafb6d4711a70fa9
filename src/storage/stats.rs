use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonically increasing counter
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct EngineStats {
    pub hits: Counter,
    pub misses: Counter,
    pub sets: Counter,
    pub rejected_sets: Counter,
    pub deletes: Counter,
    pub evictions: Counter,
    pub expirations: Counter,
    set_micros: Counter,
}

impl EngineStats {
    pub fn record_set_latency(&self, elapsed: Duration) {
        self.set_micros
            .add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.value(),
            misses: self.misses.value(),
            sets: self.sets.value(),
            rejected_sets: self.rejected_sets.value(),
            deletes: self.deletes.value(),
            evictions: self.evictions.value(),
            expirations: self.expirations.value(),
            set_micros_total: self.set_micros.value(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub rejected_sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub set_micros_total: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
