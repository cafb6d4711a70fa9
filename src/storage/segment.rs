//! Cache Segment
//!
//! One independently locked shard of the key space. A segment keeps its entries in
//! a hash index plus an intrusive, arena-backed access list (eldest at the head,
//! most recently touched at the tail) and asks its eviction policy before admitting
//! new keys. Every public method holds the segment mutex for its whole duration and
//! never across I/O. Keys that leave through eviction are handed back to the caller
//! so that notifications can be delivered after the lock is released.

use super::entry::StoredEntry;
use super::eviction::{Admission, EvictionPolicy, SegmentView};

use parking_lot::Mutex;
use std::collections::HashMap;

const NIL: usize = usize::MAX;

struct Link {
    key: String,
    prev: usize,
    next: usize,
}

/// Doubly linked list of keys stored in a `Vec`, with freed slots recycled.
struct AccessList {
    links: Vec<Link>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl AccessList {
    fn new() -> Self {
        Self {
            links: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn push_back(&mut self, key: String) -> usize {
        let link = Link {
            key,
            prev: self.tail,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.links[idx] = link;
                idx
            }
            None => {
                self.links.push(link);
                self.links.len() - 1
            }
        };

        if self.tail == NIL {
            self.head = idx;
        } else {
            self.links[self.tail].next = idx;
        }
        self.tail = idx;
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.links[idx].prev, self.links[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.links[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.links[next].prev = prev;
        }
        self.links[idx].prev = NIL;
        self.links[idx].next = NIL;
    }

    fn remove(&mut self, idx: usize) -> String {
        self.unlink(idx);
        self.free.push(idx);
        std::mem::take(&mut self.links[idx].key)
    }

    fn move_to_back(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        let tail = self.tail;
        self.links[idx].prev = tail;
        if tail == NIL {
            self.head = idx;
        } else {
            self.links[tail].next = idx;
        }
        self.tail = idx;
    }

    fn front(&self) -> Option<&str> {
        (self.head != NIL).then(|| self.links[self.head].key.as_str())
    }

    fn clear(&mut self) {
        self.links.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

struct Slot {
    entry: StoredEntry,
    link: usize,
}

struct SegmentState {
    entries: HashMap<String, Slot>,
    order: AccessList,
    policy: Box<dyn EvictionPolicy>,
}

impl SegmentState {
    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        let slot = self.entries.remove(key)?;
        self.order.remove(slot.link);
        self.policy.on_remove(key);
        Some(slot.entry)
    }

    fn evict_eldest(&mut self) -> Option<String> {
        let key = self.order.front()?.to_string();
        self.remove(&key);
        Some(key)
    }

    fn insert(&mut self, key: &str, entry: StoredEntry) {
        self.store(key, entry);
        self.policy.record_access(key);
    }

    /// Places the entry at the most recent end without telling the policy.
    fn store(&mut self, key: &str, entry: StoredEntry) {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.entry = entry;
                let link = slot.link;
                self.order.move_to_back(link);
            }
            None => {
                let link = self.order.push_back(key.to_string());
                self.entries.insert(key.to_string(), Slot { entry, link });
            }
        }
    }

    fn touch(&mut self, key: &str) -> Option<StoredEntry> {
        let slot = self.entries.get(key)?;
        let (entry, link) = (slot.entry.clone(), slot.link);
        self.order.move_to_back(link);
        self.policy.record_access(key);
        Some(entry)
    }
}

/// Result of a `put` / `put_force`.
#[derive(Debug, Default)]
pub struct PutOutcome {
    pub stored: bool,
    pub evicted: Vec<String>,
}

/// Verdict returned by the closure passed to [`Segment::compare_and_swap`].
#[derive(Debug)]
pub enum CasDecision {
    Store(StoredEntry),
    Expired,
    Fail,
}

#[derive(Debug, Default)]
pub struct CasResult {
    pub success: bool,
    pub entry: Option<StoredEntry>,
    /// The existing entry was found expired and removed.
    pub expired: bool,
}

pub struct Segment {
    capacity: usize,
    state: Mutex<SegmentState>,
}

impl Segment {
    pub fn new(capacity: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(SegmentState {
                entries: HashMap::with_capacity(capacity.min(4_096)),
                order: AccessList::new(),
                policy,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy_name(&self) -> &'static str {
        self.state.lock().policy.name()
    }

    pub fn put(&self, key: &str, entry: StoredEntry) -> PutOutcome {
        let mut state = self.state.lock();
        let mut outcome = PutOutcome::default();

        let admission = {
            let SegmentState {
                entries,
                order,
                policy,
            } = &mut *state;
            let view = SegmentView {
                len: entries.len(),
                contains_candidate: entries.contains_key(key),
                eldest: order.front(),
            };
            policy.admit(key, view, self.capacity)
        };

        // A contested admission already counted this attempt in the policy.
        let counted = match admission {
            Admission::Reject => return outcome,
            Admission::AdmitEvicting(victim) => {
                if state.remove(&victim).is_some() {
                    outcome.evicted.push(victim);
                }
                true
            }
            Admission::Admit => false,
        };

        if counted {
            state.store(key, entry);
        } else {
            state.insert(key, entry);
        }
        while state.entries.len() > self.capacity {
            match state.evict_eldest() {
                Some(victim) => outcome.evicted.push(victim),
                None => break,
            }
        }

        outcome.stored = true;
        outcome
    }

    /// Stores without consulting the policy. Only the restore path uses this.
    pub fn put_force(&self, key: &str, entry: StoredEntry) -> PutOutcome {
        let mut state = self.state.lock();
        let mut outcome = PutOutcome {
            stored: true,
            evicted: Vec::new(),
        };

        if !state.entries.contains_key(key) && state.entries.len() >= self.capacity {
            if let Some(victim) = state.evict_eldest() {
                outcome.evicted.push(victim);
            }
        }
        state.insert(key, entry);
        while state.entries.len() > self.capacity {
            match state.evict_eldest() {
                Some(victim) => outcome.evicted.push(victim),
                None => break,
            }
        }
        outcome
    }

    pub fn get(&self, key: &str) -> Option<StoredEntry> {
        self.state.lock().touch(key)
    }

    /// Reads an entry without updating recency or frequency.
    pub fn peek(&self, key: &str) -> Option<StoredEntry> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|slot| slot.entry.clone())
    }

    pub fn remove(&self, key: &str) -> Option<StoredEntry> {
        self.state.lock().remove(key)
    }

    /// Expiry currently stored for `key`, without touching recency.
    pub fn expiry_of(&self, key: &str) -> Option<i64> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|slot| slot.entry.expire_at_millis)
    }

    pub fn remove_if_matches(&self, key: &str, expected_expire_at: i64) -> bool {
        let mut state = self.state.lock();
        let matches = state
            .entries
            .get(key)
            .is_some_and(|slot| slot.entry.expire_at_millis == expected_expire_at);
        if matches {
            state.remove(key);
        }
        matches
    }

    pub fn compare_and_swap<F>(&self, key: &str, decide: F) -> CasResult
    where
        F: FnOnce(Option<&StoredEntry>) -> CasDecision,
    {
        let mut state = self.state.lock();
        let decision = decide(state.entries.get(key).map(|slot| &slot.entry));

        match decision {
            CasDecision::Store(entry) => {
                state.insert(key, entry.clone());
                CasResult {
                    success: true,
                    entry: Some(entry),
                    expired: false,
                }
            }
            CasDecision::Expired => {
                let expired = state.remove(key).is_some();
                CasResult {
                    success: false,
                    entry: None,
                    expired,
                }
            }
            CasDecision::Fail => CasResult::default(),
        }
    }

    /// Point-in-time copy of every entry, eldest first.
    pub fn snapshot(&self) -> Vec<(String, StoredEntry)> {
        let state = self.state.lock();
        let mut items = Vec::with_capacity(state.entries.len());
        let mut idx = state.order.head;
        while idx != NIL {
            let link = &state.order.links[idx];
            if let Some(slot) = state.entries.get(&link.key) {
                items.push((link.key.clone(), slot.entry.clone()));
            }
            idx = link.next;
        }
        items
    }

    /// Visits a snapshot, so the visitor may freely call back into this segment.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &StoredEntry),
    {
        for (key, entry) in self.snapshot() {
            visitor(&key, &entry);
        }
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let SegmentState {
            entries,
            order,
            policy,
        } = &mut *state;
        let removed = entries.len();
        for key in entries.keys() {
            policy.on_remove(key);
        }
        entries.clear();
        order.clear();
        removed
    }
}
