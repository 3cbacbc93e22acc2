//! Distributed Coherent Memory Library
//!
//! This library crate defines the modules of a cluster that keeps 64-byte
//! cache lines coherent across nodes and dispatches compute kernels to their
//! devices. It serves as the foundation for the `kos-node` binary (`main.rs`).
//!
//! ## Architecture Modules
//! Leaves first:
//!
//! - **`config`**: `KosConfig`, loaded from TOML with per-section defaults.
//! - **`error`**: typed errors of the coherency, migration and dispatch layers.
//! - **`transport`**: the message envelope and two transports, an in-process
//!   network with fault injection and a UDP transport with checksums,
//!   delivery receipts and retries.
//! - **`transaction`**: multi-party request/response waits with a deadline.
//! - **`membership`**: announce/heartbeat/leave discovery and failure detection.
//! - **`coherency`**: the MOESI protocol, its directory and per-node line stores.
//! - **`migration`**: whole-page ownership transfer and access accounting.
//! - **`dispatcher`**: kernel registration, compilation and fan-out execution.
//! - **`api`**: the axum HTTP surface of a node.

pub mod api;
pub mod coherency;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod membership;
pub mod migration;
pub mod transaction;
pub mod transport;
