use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::coherency::types::Address;
use crate::membership::types::{NodeId, now_ms};

/// A 4096-byte aggregate of 64 cache lines, tracked for placement decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPage {
    /// Page-aligned address.
    pub address: Address,
    pub owner: NodeId,
    pub sharers: HashSet<NodeId>,
    /// Bumped on every migration.
    pub version: u64,
    pub dirty: bool,
    pub owner_accesses: u64,
    /// Accesses by nodes other than the owner since the last migration.
    pub remote_accesses: HashMap<NodeId, u64>,
    pub migration_count: u64,
    pub last_migrated: Option<u64>,
    pub created_at: u64,
}

impl MemoryPage {
    pub fn new(address: Address, owner: NodeId) -> Self {
        Self {
            address,
            owner,
            sharers: HashSet::new(),
            version: 0,
            dirty: false,
            owner_accesses: 0,
            remote_accesses: HashMap::new(),
            migration_count: 0,
            last_migrated: None,
            created_at: now_ms(),
        }
    }

    pub fn access_count(&self) -> u64 {
        self.owner_accesses + self.remote_accesses.values().sum::<u64>()
    }

    /// The remote node with the most accesses, if any.
    pub fn busiest_remote(&self) -> Option<(&NodeId, u64)> {
        self.remote_accesses
            .iter()
            .map(|(node, count)| (node, *count))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
    }

    /// Ownership moved to `owner`; access history starts over.
    pub fn migrated_to(&mut self, owner: NodeId) {
        self.owner = owner;
        self.sharers.clear();
        self.version += 1;
        self.dirty = false;
        self.owner_accesses = 0;
        self.remote_accesses.clear();
        self.migration_count += 1;
        self.last_migrated = Some(now_ms());
    }
}

/// A page whose accesses are dominated by a node that does not own it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCandidate {
    pub page: Address,
    pub owner: NodeId,
    pub suggested_owner: NodeId,
    pub remote_accesses: u64,
    pub owner_accesses: u64,
}
