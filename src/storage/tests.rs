//! Storage Module Tests
//!
//! Exercises the cache engine end to end over its segments.
//!
//! ## Test Scopes
//! - **Eviction**: LRU ordering and LFU hot-key protection through the public API.
//! - **Expiry**: Lazy expiry on read, the reaper, and stale queue entries.
//! - **CAS**: Token round trips, conflicts and missing keys.
//! - **Restore**: Replay silence, malformed records, snapshots and fingerprints.

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::storage::engine::{CacheEngine, CasOutcome, ReplayOp, ReplayRecord};
    use crate::storage::eviction::EvictionKind;
    use crate::storage::notify::{KeyEvent, RemovalCause};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn engine(capacity: usize, segments: usize, eviction: EvictionKind) -> CacheEngine {
        CacheEngine::new(&EngineConfig {
            capacity,
            segments,
            eviction,
            reaper_interval_ms: 10,
        })
    }

    fn value(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    const NO_TTL: Duration = Duration::ZERO;

    // ============================================================
    // BASIC OPERATIONS
    // ============================================================

    #[test]
    fn test_set_get_delete() {
        let engine = engine(100, 4, EvictionKind::Lru);

        assert!(engine.set("k", value("v"), NO_TTL));
        assert_eq!(engine.get("k"), Some(value("v")));
        assert!(engine.contains("k"));

        assert!(engine.delete("k"));
        assert!(engine.get("k").is_none());
        assert!(!engine.delete("k"), "second delete finds nothing");
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("v"), NO_TTL);

        engine.get("k");
        engine.get("k");
        engine.get("missing");

        let stats = engine.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_segment_index_is_stable() {
        let engine = engine(100, 8, EvictionKind::Lru);
        let idx = engine.segment_index("book_100");
        for _ in 0..10 {
            assert_eq!(engine.segment_index("book_100"), idx);
        }
        assert!(idx < engine.segment_count());
    }

    // ============================================================
    // EVICTION
    // ============================================================

    #[test]
    fn test_lru_evicts_first_inserted_key() {
        let engine = engine(3, 1, EvictionKind::Lru);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let _subscription = engine.subscribe(move |key, cause| {
            sink.lock().push((key.to_string(), cause));
        });

        for key in ["a", "b", "c", "d"] {
            assert!(engine.set(key, value(key), NO_TTL));
        }

        assert!(engine.get("a").is_none());
        for key in ["b", "c", "d"] {
            assert!(engine.get(key).is_some(), "{} should survive", key);
        }
        assert_eq!(
            *evicted.lock(),
            vec![("a".to_string(), RemovalCause::Evicted)]
        );
        assert_eq!(engine.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_protects_hot_key() {
        let capacity = 8;
        let engine = engine(capacity, 1, EvictionKind::Lfu);

        engine.set("hot", value("h"), NO_TTL);
        for _ in 0..150 {
            assert!(engine.get("hot").is_some());
        }

        let mut rejected = 0;
        for i in 0..capacity {
            if !engine.set(&format!("cold-{}", i), value("c"), NO_TTL) {
                rejected += 1;
            }
        }

        assert_eq!(engine.get("hot"), Some(value("h")));
        assert!(rejected >= 1, "at least one cold key must be rejected");
        assert_eq!(engine.stats().rejected_sets, rejected as u64);
        assert!(engine.len() <= capacity);
    }

    #[test]
    fn test_capacity_is_respected_across_threads() {
        let engine = Arc::new(engine(64, 4, EvictionKind::Lru));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        let key = format!("t{}-{}", t, i % 300);
                        engine.set(&key, value("v"), NO_TTL);
                        engine.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(engine.len() <= engine.capacity());
    }

    // ============================================================
    // EXPIRY
    // ============================================================

    #[test]
    fn test_ttl_entry_disappears_after_deadline() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("v"), Duration::from_millis(50));

        assert_eq!(engine.get("k"), Some(value("v")));

        std::thread::sleep(Duration::from_millis(200));

        assert!(!engine.contains("k"));
        assert!(engine.get("k").is_none());
        assert_eq!(engine.len(), 0, "expired entry is removed on read");
        assert_eq!(engine.stats().expirations, 1);
    }

    #[test]
    fn test_refreshed_ttl_survives_stale_queue_entry() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("short"), Duration::from_millis(40));
        engine.set("k", value("long"), Duration::from_millis(2_000));

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(engine.reap_expired(), 0);
        assert_eq!(engine.get("k"), Some(value("long")));
    }

    #[test]
    fn test_reap_expired_removes_due_entries() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("short", value("v"), Duration::from_millis(20));
        engine.set("forever", value("v"), NO_TTL);
        assert_eq!(engine.pending_expiries(), 1);

        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(engine.reap_expired(), 1);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.pending_expiries(), 0);
    }

    #[test]
    fn test_overwritten_ttl_key_keeps_expiry_queue_bounded() {
        let engine = engine(4, 1, EvictionKind::Lru);
        for i in 0..100_000 {
            engine.set("k", value(&i.to_string()), Duration::from_secs(3_600));
        }

        assert_eq!(engine.len(), 1);
        assert!(
            engine.pending_expiries() <= 64,
            "{} queued expiries for one live key",
            engine.pending_expiries()
        );

        engine.delete("k");
        engine.clear();
        assert_eq!(engine.pending_expiries(), 0);
    }

    #[test]
    fn test_compaction_keeps_live_expiries() {
        let engine = engine(4, 1, EvictionKind::Lru);
        engine.set("short", value("v"), Duration::from_millis(50));
        for i in 0..1_000 {
            engine.set("k", value(&i.to_string()), Duration::from_secs(3_600));
        }

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(engine.reap_expired(), 1);
        assert!(engine.get("short").is_none());
        assert!(engine.get("k").is_some());
    }

    #[test]
    fn test_clear_drops_queued_expiries() {
        let engine = engine(100, 4, EvictionKind::Lru);
        for i in 0..10 {
            engine.set(&format!("k{}", i), value("v"), Duration::from_secs(60));
        }
        assert_eq!(engine.pending_expiries(), 10);

        engine.clear();

        assert_eq!(engine.pending_expiries(), 0);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_background_reaper_notifies_listeners() {
        let engine = Arc::new(engine(100, 4, EvictionKind::Lru));
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = expired.clone();
        let _subscription = engine.subscribe(move |key, cause| {
            sink.lock().push((key.to_string(), cause));
        });
        let reaper = engine.spawn_reaper(Duration::from_millis(10));

        engine.set("k", value("v"), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.len(), 0, "reaper removed the entry without a read");
        assert_eq!(
            *expired.lock(),
            vec![("k".to_string(), RemovalCause::Expired)]
        );

        reaper.stop();
    }

    // ============================================================
    // COMPARE-AND-SWAP
    // ============================================================

    #[test]
    fn test_cas_round_trip() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("v1"), NO_TTL);
        let (_, token) = engine.get_with_token("k").unwrap();

        let outcome = engine.compare_and_swap("k", value("v2"), token, NO_TTL);
        assert!(matches!(outcome, CasOutcome::Stored(new_token) if new_token != token));
        assert_eq!(engine.get("k"), Some(value("v2")));

        let outcome = engine.compare_and_swap("k", value("v3"), token, NO_TTL);
        assert_eq!(outcome, CasOutcome::Conflict);
        assert_eq!(engine.get("k"), Some(value("v2")));
    }

    #[test]
    fn test_cas_on_missing_key() {
        let engine = engine(100, 4, EvictionKind::Lru);
        assert_eq!(
            engine.compare_and_swap("ghost", value("v"), 1, NO_TTL),
            CasOutcome::NotFound
        );
        assert!(engine.get("ghost").is_none());
    }

    #[test]
    fn test_cas_on_expired_key_is_not_found() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("v"), Duration::from_millis(20));
        let (_, token) = engine.get_with_token("k").unwrap();

        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(
            engine.compare_and_swap("k", value("v2"), token, NO_TTL),
            CasOutcome::NotFound
        );
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_cas_preserves_existing_expiry_without_ttl() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("v1"), Duration::from_millis(60));
        let (_, token) = engine.get_with_token("k").unwrap();

        assert!(matches!(
            engine.compare_and_swap("k", value("v2"), token, NO_TTL),
            CasOutcome::Stored(_)
        ));

        std::thread::sleep(Duration::from_millis(150));
        assert!(engine.get("k").is_none(), "original TTL still applies");
    }

    #[test]
    fn test_every_mutation_mints_a_fresh_token() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("a"), NO_TTL);
        let (_, first) = engine.get_with_token("k").unwrap();
        engine.set("k", value("b"), NO_TTL);
        let (_, second) = engine.get_with_token("k").unwrap();

        assert!(second > first);
    }

    // ============================================================
    // NOTIFICATIONS
    // ============================================================

    #[tokio::test]
    async fn test_mutations_publish_key_events() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let mut events = engine.events();

        engine.set("k", value("v"), NO_TTL);
        engine.delete("k");

        assert_eq!(events.recv().await.unwrap(), KeyEvent::Set("k".to_string()));
        assert_eq!(events.recv().await.unwrap(), KeyEvent::Delete("k".to_string()));
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let subscription = engine.subscribe(move |_, _| *sink.lock() += 1);

        engine.set("a", value("v"), NO_TTL);
        engine.delete("a");
        drop(subscription);
        engine.set("b", value("v"), NO_TTL);
        engine.delete("b");

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_clear_does_not_notify_listeners() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let _subscription = engine.subscribe(move |_, _| *sink.lock() += 1);

        for i in 0..10 {
            engine.set(&format!("k{}", i), value("v"), NO_TTL);
        }
        engine.clear();

        assert!(engine.is_empty());
        assert_eq!(*count.lock(), 0);
    }

    // ============================================================
    // REPLAY / RESTORE
    // ============================================================

    #[test]
    fn test_replay_is_silent() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let _subscription = engine.subscribe(move |_, _| *sink.lock() += 1);
        let mut events = engine.events();

        engine.replay(ReplayOp::Set, "k", value("v"), 0);
        assert_eq!(engine.get("k"), Some(value("v")));
        engine.replay(ReplayOp::Delete, "k", Bytes::new(), 0);
        assert!(engine.get("k").is_none());

        assert_eq!(*count.lock(), 0);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_replay_with_past_expiry_removes_key() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("k", value("live"), NO_TTL);

        engine.replay(ReplayOp::Set, "k", value("stale"), 1);

        assert!(engine.get("k").is_none());
    }

    #[test]
    fn test_replay_with_future_expiry_is_reaped_later() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let deadline = crate::storage::entry::now_ms() + 30;

        engine.replay(ReplayOp::Set, "k", value("v"), deadline);
        assert!(engine.contains("k"));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(engine.reap_expired(), 1);
    }

    #[test]
    fn test_restore_skips_malformed_records() {
        let engine = engine(100, 4, EvictionKind::Lru);
        let records = vec![
            Ok(ReplayRecord {
                op: ReplayOp::Set,
                key: "a".to_string(),
                value: value("1"),
                expire_at_millis: 0,
            }),
            Err(anyhow::anyhow!("truncated record")),
            Ok(ReplayRecord {
                op: ReplayOp::Set,
                key: "b".to_string(),
                value: value("2"),
                expire_at_millis: 0,
            }),
        ];

        let summary = engine.restore(records);

        assert_eq!(summary.applied, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(engine.get("a"), Some(value("1")));
        assert_eq!(engine.get("b"), Some(value("2")));
    }

    #[test]
    fn test_for_each_entry_skips_expired() {
        let engine = engine(100, 4, EvictionKind::Lru);
        engine.set("live", value("v"), NO_TTL);
        engine.set("dying", value("v"), Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(60));

        let mut keys = Vec::new();
        engine.for_each_entry(|key, _, _| keys.push(key.to_string()));
        assert_eq!(keys, vec!["live".to_string()]);
    }

    #[test]
    fn test_snapshot_restores_into_fresh_engine() {
        let source = engine(100, 4, EvictionKind::Lru);
        for i in 0..20 {
            source.set(&format!("k{}", i), value(&format!("v{}", i)), NO_TTL);
        }

        let mut records = Vec::new();
        source.for_each_entry(|key, value, expire_at_millis| {
            records.push(Ok(ReplayRecord {
                op: ReplayOp::Set,
                key: key.to_string(),
                value: value.clone(),
                expire_at_millis,
            }));
        });

        let target = engine(100, 4, EvictionKind::Lru);
        target.restore(records);

        assert_eq!(source.fingerprint(), target.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let forward = engine(100, 4, EvictionKind::Lru);
        let backward = engine(100, 4, EvictionKind::Lru);

        for key in ["A", "B", "C"] {
            forward.set(key, value(key), NO_TTL);
        }
        for key in ["C", "B", "A"] {
            backward.set(key, value(key), NO_TTL);
        }

        assert_eq!(forward.fingerprint(), backward.fingerprint());

        backward.set("B", value("changed"), NO_TTL);
        assert_ne!(forward.fingerprint(), backward.fingerprint());
    }
}
