//! Cluster Module
//!
//! Spreads keys over a set of cache nodes and keeps replicas converging.
//!
//! ## Core Concepts
//! - **Ring**: Consistent hashing with virtual nodes picks each key's replica set.
//! - **Nodes**: A single async trait covers the in-process replica and remote ones.
//! - **Quorum Writes**: A write succeeds once a majority of its replicas accept it.
//! - **Hinted Handoff**: Writes missed by an unreachable replica are queued and
//!   replayed in order when it comes back.

pub mod client;
pub mod handoff;
pub mod node;
pub mod ring;

pub use client::ClusterClient;
pub use handoff::{Hint, HintedHandoff};
pub use node::{LocalNode, Node};
pub use ring::HashRing;
