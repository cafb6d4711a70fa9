//! Transport Module
//!
//! Binary request/response plumbing between cache nodes.
//!
//! ## Components
//! - **Protocol**: Length-prefixed bincode frames carrying engine operations.
//! - **Remote Node**: The `Node` implementation for replicas in other processes,
//!   with connect and request timeouts on a single pooled connection.
//! - **Server**: A TCP listener that applies incoming requests to the local engine.

pub mod protocol;
pub mod remote;
pub mod server;

pub use remote::RemoteNode;
pub use server::NodeServer;
