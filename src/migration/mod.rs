//! Page Migration Module
//!
//! Whole-page (4096 bytes, 64 lines) ownership transfer between nodes, plus
//! the per-page access accounting used to pick migration candidates.
//!
//! A page has one owner. Only the owner may migrate it. The target stages a
//! shipped page and installs it only on MIGRATE_COMMIT, so a lost
//! acknowledgment never leaves two nodes holding the page EXCLUSIVE.
//! Accesses that other nodes make through the owner's copy are counted at
//! the owner.

pub mod manager;
pub mod types;


pub use manager::PageMigrationManager;
pub use types::{MemoryPage, MigrationCandidate};
