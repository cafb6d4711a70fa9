use bytes::Bytes;
use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A value held by a segment together with its absolute expiry and CAS token.
///
/// `expire_at_millis <= 0` means the entry never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Bytes,
    pub expire_at_millis: i64,
    pub cas: u64,
}

impl StoredEntry {
    pub fn new(value: Bytes, expire_at_millis: i64, cas: u64) -> Self {
        Self {
            value,
            expire_at_millis,
            cas,
        }
    }

    pub fn has_ttl(&self) -> bool {
        self.expire_at_millis > 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at_millis > 0 && now >= self.expire_at_millis
    }
}

/// A queued expiry for the reaper.
///
/// The referenced key may have been overwritten since it was queued, so the
/// reaper only removes it when the live entry still carries this expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringKey {
    pub key: String,
    pub segment: usize,
    pub expire_at_millis: i64,
}

impl Ord for ExpiringKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expire_at_millis
            .cmp(&other.expire_at_millis)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.segment.cmp(&other.segment))
    }
}

impl PartialOrd for ExpiringKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Absolute expiry for a relative ttl. A zero ttl yields `0` (no expiry) and
/// an overflowing sum clamps to `i64::MAX` instead of wrapping negative.
pub fn expire_at(now: i64, ttl: Duration) -> i64 {
    if ttl.is_zero() {
        return 0;
    }
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    now.saturating_add(ttl_ms)
}
