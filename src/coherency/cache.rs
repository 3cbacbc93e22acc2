//! Cache Line Store
//!
//! `node -> address -> CacheLine` for every node hosted by the engine. Like the
//! directory it sits behind one lock. When both are needed the store lock is
//! taken first.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

use super::directory::CoherencyDirectory;
use super::types::{Address, CacheLine, MoesiState, line_base, now_ms};
use crate::membership::types::NodeId;

pub type NodeLines = HashMap<NodeId, HashMap<Address, CacheLine>>;

#[derive(Default)]
pub struct CacheLineStore {
    lines: Mutex<NodeLines>,
}

impl CacheLineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the store lock for a compound update.
    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeLines> {
        self.lines.lock()
    }

    pub fn has_valid_line(&self, node: &NodeId, address: Address) -> bool {
        let lines = self.lines.lock();
        lines
            .get(node)
            .and_then(|node_lines| node_lines.get(&line_base(address)))
            .map(CacheLine::is_valid)
            .unwrap_or(false)
    }

    pub fn get(&self, node: &NodeId, address: Address) -> Option<CacheLine> {
        let lines = self.lines.lock();
        lines
            .get(node)
            .and_then(|node_lines| node_lines.get(&line_base(address)))
            .cloned()
    }

    pub fn state(&self, node: &NodeId, address: Address) -> MoesiState {
        self.get(node, address)
            .map(|line| line.state)
            .unwrap_or(MoesiState::Invalid)
    }

    pub fn insert(&self, node: &NodeId, line: CacheLine) {
        let mut lines = self.lines.lock();
        lines
            .entry(node.clone())
            .or_default()
            .insert(line.address, line);
    }

    /// Removes the line and marks it INVALID for `node` in the directory under
    /// one store-lock hold. The caller is responsible for writing back the
    /// returned line first if it is dirty.
    pub fn evict(
        &self,
        node: &NodeId,
        address: Address,
        directory: &CoherencyDirectory,
    ) -> Option<CacheLine> {
        let mut lines = self.lines.lock();
        let removed = lines
            .get_mut(node)
            .and_then(|node_lines| node_lines.remove(&line_base(address)));
        directory.set_state(address, node, MoesiState::Invalid);
        removed
    }

    /// Records a read hit and returns a copy of the line if it is valid.
    pub fn touch(&self, node: &NodeId, address: Address) -> Option<CacheLine> {
        let mut lines = self.lines.lock();
        let line = lines.get_mut(node)?.get_mut(&line_base(address))?;
        if !line.is_valid() {
            return None;
        }
        line.last_access = now_ms();
        Some(line.clone())
    }

    pub fn line_count(&self, node: &NodeId) -> usize {
        self.lines
            .lock()
            .get(node)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total_lines(&self) -> usize {
        self.lines.lock().values().map(HashMap::len).sum()
    }

    pub fn node_addresses(&self, node: &NodeId) -> Vec<Address> {
        let lines = self.lines.lock();
        let mut addresses: Vec<Address> = lines
            .get(node)
            .map(|node_lines| node_lines.keys().copied().collect())
            .unwrap_or_default();
        addresses.sort_unstable();
        addresses
    }

    pub fn dirty_lines(&self, node: &NodeId) -> Vec<CacheLine> {
        let lines = self.lines.lock();
        lines
            .get(node)
            .map(|node_lines| {
                node_lines
                    .values()
                    .filter(|line| line.is_dirty())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Addresses of `node`'s lines ordered from least to most recently used.
    pub fn lru_order(&self, node: &NodeId) -> Vec<Address> {
        let lines = self.lines.lock();
        let mut ordered: Vec<(u64, Address)> = lines
            .get(node)
            .map(|node_lines| {
                node_lines
                    .values()
                    .map(|line| (line.last_access, line.address))
                    .collect()
            })
            .unwrap_or_default();
        ordered.sort_unstable();
        ordered.into_iter().map(|(_, address)| address).collect()
    }

    pub fn remove_node(&self, node: &NodeId) -> Vec<CacheLine> {
        let mut lines = self.lines.lock();
        lines
            .remove(node)
            .map(|node_lines| node_lines.into_values().collect())
            .unwrap_or_default()
    }

    /// `(node, address, state)` for every line held, for cross-checking
    /// against the directory.
    pub fn states(&self) -> Vec<(NodeId, Address, MoesiState)> {
        let lines = self.lines.lock();
        lines
            .iter()
            .flat_map(|(node, node_lines)| {
                node_lines
                    .values()
                    .map(move |line| (node.clone(), line.address, line.state))
            })
            .collect()
    }
}
