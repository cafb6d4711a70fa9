//! Cache Engine
//!
//! Owns the segments, the shared expiry queue and the CAS token counter. Keys are
//! routed to a segment by a stable hash that never changes for the lifetime of the
//! engine, so every key lives in exactly one segment.
//!
//! Mutations publish [`KeyEvent`]s; keys leaving through delete, eviction or
//! expiry reach removal listeners. The restore path (`replay` / `restore`) is
//! silent on both channels.

use super::entry::{ExpiringKey, StoredEntry, expire_at, now_ms};
use super::expiry::{ExpiryQueue, Reaper};
use super::notify::{KeyEvent, Notifier, RemovalCause, Subscription};
use super::segment::{CasDecision, Segment};
use super::stats::{EngineStats, StatsSnapshot};
use crate::config::EngineConfig;

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use xxhash_rust::xxh3::xxh3_64;

const FINGERPRINT_SEED: u64 = 0x2545_F491_4F6C_DD1D;
/// The expiry queue is compacted once it holds more than this many entries, or
/// twice the engine capacity if that is larger.
const MIN_EXPIRY_COMPACTION: usize = 64;

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Stored under the new token.
    Stored(u64),
    /// The key exists but carries a different token.
    Conflict,
    /// Absent or expired.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOp {
    Set,
    Delete,
}

/// One persisted record handed to [`CacheEngine::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    pub op: ReplayOp,
    pub key: String,
    pub value: Bytes,
    pub expire_at_millis: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub applied: usize,
    pub skipped: usize,
}

pub struct CacheEngine {
    segments: Vec<Segment>,
    expiry: ExpiryQueue,
    expiry_compact_at: usize,
    cas_counter: AtomicU64,
    notifier: Notifier,
    stats: EngineStats,
}

impl CacheEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let segment_count = config.segments.max(1);
        let per_segment = config.capacity.div_ceil(segment_count).max(1);
        let segments = (0..segment_count)
            .map(|_| Segment::new(per_segment, config.eviction.build(per_segment)))
            .collect();

        tracing::info!(
            "Cache engine: {} segments x {} entries ({:?} eviction)",
            segment_count,
            per_segment,
            config.eviction
        );

        let capacity = per_segment * segment_count;

        Self {
            segments,
            expiry: ExpiryQueue::new(),
            expiry_compact_at: capacity.saturating_mul(2).max(MIN_EXPIRY_COMPACTION),
            cas_counter: AtomicU64::new(1),
            notifier: Notifier::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn capacity(&self) -> usize {
        self.segments.iter().map(Segment::capacity).sum()
    }

    /// Number of stored entries, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    pub fn segment_index(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.segments.len() as u64) as usize
    }

    fn segment_for(&self, key: &str) -> (usize, &Segment) {
        let idx = self.segment_index(key);
        (idx, &self.segments[idx])
    }

    /// Next CAS token. Never returns 0, which callers use to mean "no token".
    fn next_token(&self) -> u64 {
        let token = self.cas_counter.fetch_add(1, Ordering::Relaxed);
        if token == 0 {
            return self.cas_counter.fetch_add(1, Ordering::Relaxed);
        }
        token
    }

    fn track_expiry(&self, key: &str, segment: usize, expire_at_millis: i64) {
        if expire_at_millis <= 0 {
            return;
        }
        self.expiry.push(ExpiringKey {
            key: key.to_string(),
            segment,
            expire_at_millis,
        });
        if self.expiry.len() > self.expiry_compact_at {
            self.compact_expiries();
        }
    }

    /// Drops queued expiries whose entry was overwritten, deleted or evicted, so
    /// the queue stays proportional to the live TTL entries.
    fn compact_expiries(&self) {
        let dropped = self.expiry.compact(|item| {
            self.segments
                .get(item.segment)
                .and_then(|segment| segment.expiry_of(&item.key))
                == Some(item.expire_at_millis)
        });
        tracing::debug!(
            "Compacted expiry queue: dropped {}, {} remain",
            dropped,
            self.expiry.len()
        );
    }

    fn evicted(&self, keys: Vec<String>) {
        for key in keys {
            tracing::debug!("Evicted {}", key);
            self.stats.evictions.increment();
            self.notifier.removed(&key, RemovalCause::Evicted);
        }
    }

    fn expired(&self, key: &str) {
        self.stats.expirations.increment();
        self.notifier.removed(key, RemovalCause::Expired);
    }

    pub fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let started = Instant::now();
        let expire_at_millis = expire_at(now_ms(), ttl);
        let (idx, segment) = self.segment_for(key);

        let outcome = segment.put(key, StoredEntry::new(value, expire_at_millis, self.next_token()));
        self.evicted(outcome.evicted);

        if !outcome.stored {
            tracing::debug!("SET {}: rejected by {} admission", key, segment.policy_name());
            self.stats.rejected_sets.increment();
            return false;
        }

        self.track_expiry(key, idx, expire_at_millis);
        self.notifier.publish(KeyEvent::Set(key.to_string()));
        self.stats.sets.increment();
        self.stats.record_set_latency(started.elapsed());
        true
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_token(key).map(|(value, _)| value)
    }

    /// Reads a live value together with the CAS token that produced it.
    pub fn get_with_token(&self, key: &str) -> Option<(Bytes, u64)> {
        let (_, segment) = self.segment_for(key);

        match segment.get(key) {
            Some(entry) if entry.is_expired(now_ms()) => {
                if segment.remove_if_matches(key, entry.expire_at_millis) {
                    tracing::debug!("GET {}: expired on read", key);
                    self.expired(key);
                }
                self.stats.misses.increment();
                None
            }
            Some(entry) => {
                self.stats.hits.increment();
                Some((entry.value, entry.cas))
            }
            None => {
                self.stats.misses.increment();
                None
            }
        }
    }

    /// Presence check for a live entry. Touches neither recency nor statistics.
    pub fn contains(&self, key: &str) -> bool {
        let (_, segment) = self.segment_for(key);
        segment
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now_ms()))
    }

    pub fn delete(&self, key: &str) -> bool {
        let (_, segment) = self.segment_for(key);

        match segment.remove(key) {
            Some(entry) if entry.is_expired(now_ms()) => {
                self.expired(key);
                false
            }
            Some(_) => {
                self.stats.deletes.increment();
                self.notifier.publish(KeyEvent::Delete(key.to_string()));
                self.notifier.removed(key, RemovalCause::Deleted);
                true
            }
            None => false,
        }
    }

    /// Replaces the value only if `expected` is still the key's current token.
    ///
    /// A zero `ttl` keeps the existing expiry.
    pub fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        expected: u64,
        ttl: Duration,
    ) -> CasOutcome {
        let now = now_ms();
        let (idx, segment) = self.segment_for(key);
        let mut conflict = false;

        let result = segment.compare_and_swap(key, |existing| match existing {
            None => CasDecision::Fail,
            Some(entry) if entry.is_expired(now) => CasDecision::Expired,
            Some(entry) if entry.cas != expected => {
                conflict = true;
                CasDecision::Fail
            }
            Some(entry) => {
                let expire_at_millis = if ttl.is_zero() {
                    entry.expire_at_millis
                } else {
                    expire_at(now, ttl)
                };
                CasDecision::Store(StoredEntry::new(value, expire_at_millis, self.next_token()))
            }
        });

        if result.expired {
            self.expired(key);
            return CasOutcome::NotFound;
        }

        match result.entry {
            Some(entry) if result.success => {
                self.track_expiry(key, idx, entry.expire_at_millis);
                self.notifier.publish(KeyEvent::Set(key.to_string()));
                self.stats.sets.increment();
                CasOutcome::Stored(entry.cas)
            }
            _ if conflict => {
                tracing::debug!("CAS {}: token {} is stale", key, expected);
                CasOutcome::Conflict
            }
            _ => CasOutcome::NotFound,
        }
    }

    /// Drops every entry. Removal listeners are not notified.
    pub fn clear(&self) {
        self.expiry.clear();
        let removed: usize = self.segments.iter().map(Segment::clear).sum();
        tracing::info!("Cleared {} entries", removed);
    }

    /// Sweeps every expiry that is due now and returns how many entries it removed.
    ///
    /// Queue entries superseded by a later write no longer match the stored expiry
    /// and are dropped without touching the segment.
    pub fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        for item in self.expiry.drain_due(now_ms()) {
            let Some(segment) = self.segments.get(item.segment) else {
                continue;
            };
            if segment.remove_if_matches(&item.key, item.expire_at_millis) {
                reaped += 1;
                self.expired(&item.key);
            }
        }
        reaped
    }

    pub fn pending_expiries(&self) -> usize {
        self.expiry.len()
    }

    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> Reaper {
        Reaper::spawn(self.clone(), interval)
    }

    /// Applies one persisted record without publishing events or notifying listeners.
    pub fn replay(&self, op: ReplayOp, key: &str, value: Bytes, expire_at_millis: i64) {
        let (idx, segment) = self.segment_for(key);

        match op {
            ReplayOp::Set if expire_at_millis > 0 && expire_at_millis <= now_ms() => {
                segment.remove(key);
            }
            ReplayOp::Set => {
                let entry = StoredEntry::new(value, expire_at_millis, self.next_token());
                let outcome = segment.put_force(key, entry);
                self.stats.evictions.add(outcome.evicted.len() as u64);
                self.track_expiry(key, idx, expire_at_millis);
            }
            ReplayOp::Delete => {
                segment.remove(key);
            }
        }
    }

    /// Replays a stream of records, skipping any that failed to decode.
    pub fn restore<I>(&self, records: I) -> RestoreSummary
    where
        I: IntoIterator<Item = Result<ReplayRecord>>,
    {
        let mut summary = RestoreSummary::default();
        for record in records {
            match record {
                Ok(record) => {
                    self.replay(record.op, &record.key, record.value, record.expire_at_millis);
                    summary.applied += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed persisted record: {:#}", e);
                    summary.skipped += 1;
                }
            }
        }
        tracing::info!(
            "Restore finished: {} applied, {} skipped",
            summary.applied,
            summary.skipped
        );
        summary
    }

    /// Visits every entry that is live at call time, segment by segment, over
    /// snapshots. The visitor may call back into the engine.
    pub fn for_each_entry<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &Bytes, i64),
    {
        let now = now_ms();
        for segment in &self.segments {
            segment.for_each(|key, entry| {
                if !entry.is_expired(now) {
                    visitor(key, &entry.value, entry.expire_at_millis);
                }
            });
        }
    }

    /// Order-independent digest of all live entries.
    pub fn fingerprint(&self) -> u64 {
        let mut acc = FINGERPRINT_SEED;
        self.for_each_entry(|key, value, expire_at_millis| {
            let mut h: u64 = 17;
            h = h.wrapping_mul(31).wrapping_add(xxh3_64(key.as_bytes()));
            h = h.wrapping_mul(31).wrapping_add(xxh3_64(value));
            h = h.wrapping_mul(31).wrapping_add(expire_at_millis as u64);
            acc = acc.wrapping_add(h);
        });
        acc
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, RemovalCause) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    pub fn events(&self) -> broadcast::Receiver<KeyEvent> {
        self.notifier.events()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
