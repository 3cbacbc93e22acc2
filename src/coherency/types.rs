use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::membership::types::NodeId;

/// Byte address in the pooled address space.
pub type Address = u64;

pub const CACHE_LINE_SIZE: usize = 64;
pub const PAGE_SIZE: usize = 4096;
pub const LINES_PER_PAGE: usize = PAGE_SIZE / CACHE_LINE_SIZE;

pub fn line_base(address: Address) -> Address {
    address & !(CACHE_LINE_SIZE as Address - 1)
}

pub fn page_base(address: Address) -> Address {
    address & !(PAGE_SIZE as Address - 1)
}

/// Line-aligned addresses of every line in the page containing `address`.
pub fn page_lines(address: Address) -> impl Iterator<Item = Address> {
    let base = page_base(address);
    (0..LINES_PER_PAGE as Address).map(move |i| base + i * CACHE_LINE_SIZE as Address)
}

/// MOESI coherency state of one node's copy of a line.
///
/// <pre>
///   M O E S I    (may another node hold this state at the same time?)
/// M ✗ ✗ ✗ ✗ ✓
/// O ✗ ✗ ✗ ✓ ✓
/// E ✗ ✗ ✗ ✗ ✓
/// S ✗ ✓ ✗ ✓ ✓
/// I ✓ ✓ ✓ ✓ ✓
/// </pre>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoesiState {
    /// Only copy, dirty.
    Modified,
    /// Dirty, but other nodes may hold SHARED copies; this node supplies reads
    /// and is responsible for the writeback.
    Owned,
    /// Only copy, clean.
    Exclusive,
    /// Clean copy, possibly one of many.
    Shared,
    Invalid,
}

impl MoesiState {
    pub fn is_valid(self) -> bool {
        self != MoesiState::Invalid
    }

    /// States that make a node the line's owner.
    pub fn is_write_capable(self) -> bool {
        matches!(
            self,
            MoesiState::Modified | MoesiState::Owned | MoesiState::Exclusive
        )
    }

    /// States that permit a local write without contacting anyone.
    pub fn is_exclusive(self) -> bool {
        matches!(self, MoesiState::Modified | MoesiState::Exclusive)
    }

    pub fn is_dirty(self) -> bool {
        matches!(self, MoesiState::Modified | MoesiState::Owned)
    }

    pub fn is_sharer(self) -> bool {
        matches!(self, MoesiState::Shared | MoesiState::Owned)
    }

    /// State an owner keeps after supplying its line to a remote reader.
    pub fn after_remote_read(self) -> MoesiState {
        match self {
            MoesiState::Modified | MoesiState::Owned => MoesiState::Owned,
            MoesiState::Exclusive | MoesiState::Shared => MoesiState::Shared,
            MoesiState::Invalid => MoesiState::Invalid,
        }
    }

    /// State a line keeps after its dirty data reached the backing store.
    pub fn after_writeback(self) -> MoesiState {
        match self {
            MoesiState::Modified => MoesiState::Exclusive,
            MoesiState::Owned => MoesiState::Shared,
            other => other,
        }
    }
}

/// One node's cached copy of a 64-byte line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLine {
    pub address: Address,
    pub data: Option<Vec<u8>>,
    pub state: MoesiState,
    pub owner: NodeId,
    pub version: u64,
    pub last_modified: u64,
    pub last_access: u64,
    pub sharers: HashSet<NodeId>,
}

impl CacheLine {
    pub fn new(address: Address, owner: NodeId, data: Vec<u8>, state: MoesiState, version: u64) -> Self {
        let now = now_ms();
        Self {
            address: line_base(address),
            data: Some(data),
            state,
            owner,
            version,
            last_modified: now,
            last_access: now,
            sharers: HashSet::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid() && self.data.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Copies `data` in at `offset` and bumps the version.
    pub fn apply_write(&mut self, offset: usize, data: &[u8]) {
        let buf = self
            .data
            .get_or_insert_with(|| vec![0u8; CACHE_LINE_SIZE]);
        buf[offset..offset + data.len()].copy_from_slice(data);
        self.version += 1;
        self.state = MoesiState::Modified;
        self.last_modified = now_ms();
        self.last_access = self.last_modified;
    }
}

/// A contiguous piece of a caller's request that falls inside one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub line: Address,
    pub offset: usize,
    pub len: usize,
}

/// Splits `[address, address + size)` into per-line spans.
pub fn split_range(address: Address, size: usize) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let mut cursor = address;
    let end = address.saturating_add(size as Address);

    while cursor < end {
        let line = line_base(cursor);
        let offset = (cursor - line) as usize;
        let len = ((CACHE_LINE_SIZE - offset) as Address).min(end - cursor) as usize;
        spans.push(LineSpan { line, offset, len });
        cursor += len as Address;
    }

    spans
}

pub fn now_ms() -> u64 {
    crate::membership::types::now_ms()
}
