//! Local Storage Module
//!
//! Implements a sharded, TTL-aware in-memory key-value store.
//!
//! ## Core Concepts
//! - **Segments**: The key space is split into independently locked shards, so local
//!   operations on different segments never contend.
//! - **Eviction**: Each segment consults a pluggable policy (LRU or approximate LFU)
//!   before admitting a new key once it is full.
//! - **Expiry**: Entries with a TTL are dropped lazily on read and eagerly by a
//!   background reaper fed from a shared min-heap of deadlines.
//! - **Restore**: Persisted records are replayed without side effects, and every
//!   live entry can be enumerated for snapshots and checksums.

pub mod engine;
pub mod entry;
pub mod eviction;
pub mod expiry;
pub mod notify;
pub mod segment;
pub mod stats;

pub use engine::{CacheEngine, CasOutcome, ReplayOp, ReplayRecord, RestoreSummary};
pub use notify::{KeyEvent, RemovalCause, Subscription};

#[cfg(test)]
mod tests;
