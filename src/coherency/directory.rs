//! Coherency Directory
//!
//! Authoritative `address -> node -> state` routing table. A single lock guards
//! the whole map: per-address locking would itself need a coherency story.
//! Entries only exist for valid states, so the map stays sparse.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::types::{Address, MoesiState, line_base};
use crate::membership::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    /// More than one node in MODIFIED/OWNED/EXCLUSIVE.
    MultipleOwners,
    /// A MODIFIED or EXCLUSIVE holder coexists with other valid copies.
    ExclusiveNotAlone,
    /// A hosted node's store disagrees with the directory.
    DirectoryMismatch {
        node: NodeId,
        cached: MoesiState,
        recorded: MoesiState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoherencyViolation {
    pub address: Address,
    pub kind: ViolationKind,
    pub holders: Vec<(NodeId, MoesiState)>,
}

#[derive(Default)]
pub struct CoherencyDirectory {
    entries: Mutex<HashMap<Address, HashMap<NodeId, MoesiState>>>,
}

impl CoherencyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_state(&self, address: Address, node: &NodeId) -> MoesiState {
        let entries = self.entries.lock();
        entries
            .get(&line_base(address))
            .and_then(|holders| holders.get(node).copied())
            .unwrap_or(MoesiState::Invalid)
    }

    pub fn set_state(&self, address: Address, node: &NodeId, state: MoesiState) {
        let mut entries = self.entries.lock();
        Self::set_locked(&mut entries, line_base(address), node, state);
    }

    fn set_locked(
        entries: &mut HashMap<Address, HashMap<NodeId, MoesiState>>,
        address: Address,
        node: &NodeId,
        state: MoesiState,
    ) {
        if state == MoesiState::Invalid {
            if let Some(holders) = entries.get_mut(&address) {
                holders.remove(node);
                if holders.is_empty() {
                    entries.remove(&address);
                }
            }
        } else {
            entries
                .entry(address)
                .or_default()
                .insert(node.clone(), state);
        }
    }

    /// Nodes in SHARED or OWNED.
    pub fn get_sharers(&self, address: Address) -> HashSet<NodeId> {
        let entries = self.entries.lock();
        entries
            .get(&line_base(address))
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(_, state)| state.is_sharer())
                    .map(|(node, _)| node.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The node in MODIFIED/OWNED/EXCLUSIVE, if any.
    pub fn get_owner(&self, address: Address) -> Option<NodeId> {
        let entries = self.entries.lock();
        entries.get(&line_base(address)).and_then(|holders| {
            holders
                .iter()
                .find(|(_, state)| state.is_write_capable())
                .map(|(node, _)| node.clone())
        })
    }

    /// Every node holding a valid copy, with its state.
    pub fn holders(&self, address: Address) -> HashMap<NodeId, MoesiState> {
        let entries = self.entries.lock();
        entries
            .get(&line_base(address))
            .cloned()
            .unwrap_or_default()
    }

    /// Flips every node other than `node` to INVALID and returns who was
    /// invalidated.
    pub fn invalidate_all_except(&self, address: Address, node: &NodeId) -> HashSet<NodeId> {
        let mut entries = self.entries.lock();
        let address = line_base(address);
        let Some(holders) = entries.get_mut(&address) else {
            return HashSet::new();
        };

        let invalidated: HashSet<NodeId> = holders
            .keys()
            .filter(|holder| *holder != node)
            .cloned()
            .collect();
        holders.retain(|holder, _| holder == node);
        if holders.is_empty() {
            entries.remove(&address);
        }

        invalidated
    }

    /// Applies several state changes for one address under a single lock
    /// acquisition.
    pub fn apply(&self, address: Address, changes: &[(NodeId, MoesiState)]) {
        let mut entries = self.entries.lock();
        let address = line_base(address);
        for (node, state) in changes {
            Self::set_locked(&mut entries, address, node, *state);
        }
    }

    /// Removes every entry held by `node` and returns the addresses it held
    /// dirty.
    pub fn remove_node(&self, node: &NodeId) -> Vec<Address> {
        let mut entries = self.entries.lock();
        let mut dirty = Vec::new();
        entries.retain(|address, holders| {
            if let Some(state) = holders.remove(node)
                && state.is_dirty()
            {
                dirty.push(*address);
            }
            !holders.is_empty()
        });
        dirty
    }

    pub fn tracked_addresses(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn snapshot(&self) -> HashMap<Address, HashMap<NodeId, MoesiState>> {
        self.entries.lock().clone()
    }

    /// Scans every address for states that cannot coexist. Diagnostic only:
    /// nothing is repaired.
    pub fn verify(&self) -> Vec<CoherencyViolation> {
        let entries = self.entries.lock();
        let mut violations = Vec::new();

        for (address, holders) in entries.iter() {
            let owners = holders
                .values()
                .filter(|state| state.is_write_capable())
                .count();
            let exclusive = holders.values().any(|state| state.is_exclusive());

            let kind = if owners > 1 {
                Some(ViolationKind::MultipleOwners)
            } else if exclusive && holders.len() > 1 {
                Some(ViolationKind::ExclusiveNotAlone)
            } else {
                None
            };

            if let Some(kind) = kind {
                let mut listed: Vec<(NodeId, MoesiState)> = holders
                    .iter()
                    .map(|(node, state)| (node.clone(), *state))
                    .collect();
                listed.sort_by(|a, b| a.0.cmp(&b.0));
                violations.push(CoherencyViolation {
                    address: *address,
                    kind,
                    holders: listed,
                });
            }
        }

        violations.sort_by_key(|violation| violation.address);
        violations
    }
}
