//! Distributed In-Memory Cache Library
//!
//! This library crate defines the modules that make up a cache node. The node
//! binary (`main.rs`) wires them together.
//!
//! ## Architecture Modules
//! - **`storage`**: The local cache engine. A segmented, TTL-aware key-value store
//!   with pluggable eviction, CAS tokens, removal listeners and snapshot support.
//! - **`cluster`**: Replication across nodes. Consistent hashing picks replica sets,
//!   writes need a majority, and missed writes are handed off once a node returns.
//! - **`transport`**: The binary TCP protocol that lets a node reach replicas in
//!   other processes.
//! - **`config`**: Node settings from a JSON file and command-line flags.

pub mod cluster;
pub mod config;
pub mod storage;
pub mod transport;
