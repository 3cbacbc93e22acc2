//! Distributed Memory Coherency Module
//!
//! MOESI cache coherency replicated across cluster nodes at 64-byte line
//! granularity.
//!
//! ## Core Mechanisms
//! - **Directory**: one `address -> node -> state` map is the routing table
//!   for "who do I ask". It is kept consistent with every node's line store.
//! - **Invalidate before write**: a writer proceeds only after every other
//!   copy has acknowledged its invalidation. This alone orders concurrent
//!   writers of a line; there is no global clock.
//! - **Writeback**: dirty lines (MODIFIED/OWNED) reach the backing store
//!   before they are dropped, either locally or via the configured home node.
//!
//! ## Submodules
//! - **`types`**: addresses, `MoesiState`, `CacheLine`.
//! - **`directory`**: the coherency directory and its verification pass.
//! - **`cache`**: per-node cache line store.
//! - **`backing`**: the backing store interface and an in-memory store.
//! - **`engine`**: `ClusterCoherencyEngine`, the protocol itself.
//! - **`stats`**: counters exposed for introspection.

pub mod backing;
pub mod cache;
pub mod directory;
pub mod engine;
pub mod stats;
pub mod types;

#[cfg(test)]
mod tests;

pub use backing::{BackingStore, MemoryBackingStore};
pub use directory::{CoherencyDirectory, CoherencyViolation, ViolationKind};
pub use engine::ClusterCoherencyEngine;
pub use stats::CoherencyStats;
pub use types::{Address, CACHE_LINE_SIZE, CacheLine, MoesiState, PAGE_SIZE};
