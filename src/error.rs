use thiserror::Error;

use crate::coherency::types::Address;
use crate::membership::types::NodeId;

/// Failures surfaced by coherency operations.
///
/// `Timeout`, `Unreachable` and `Busy` are transient: nothing was committed
/// locally and the caller may retry. `Rejected` is an explicit refusal from
/// a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoherencyError {
    #[error("transaction for {address:#x} timed out after {waited_ms}ms waiting on {missing:?}")]
    Timeout {
        address: Address,
        missing: Vec<NodeId>,
        waited_ms: u64,
    },

    #[error("node {node} unreachable while handling {address:#x}")]
    Unreachable { address: Address, node: NodeId },

    #[error("node {node} rejected request for {address:#x}: {reason}")]
    Rejected {
        address: Address,
        node: NodeId,
        reason: String,
    },

    #[error("node {0} is not attached to this engine")]
    UnknownNode(NodeId),

    #[error("backing store error: {0}")]
    Backing(String),

    /// A concurrent initiator on another node won the line.
    #[error("line {address:#x} busy at {node}")]
    Busy { address: Address, node: NodeId },
}

impl CoherencyError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoherencyError::Timeout { .. }
                | CoherencyError::Unreachable { .. }
                | CoherencyError::Busy { .. }
        )
    }
}

pub type CoherencyResult<T> = Result<T, CoherencyError>;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("node {requester} does not own page {page:#x} (owner: {owner})")]
    NotOwner {
        page: Address,
        requester: NodeId,
        owner: NodeId,
    },

    #[error("page {0:#x} is already owned by the target")]
    SameNode(Address),

    #[error("migration target {0} unreachable")]
    TargetUnreachable(NodeId),

    #[error("migration target {node} rejected page: {reason}")]
    Rejected { node: NodeId, reason: String },

    #[error("migration of page {0:#x} timed out")]
    Timeout(Address),

    #[error(transparent)]
    Coherency(#[from] CoherencyError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("compilation failed: {0}")]
    Compile(String),

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("device {0} not available")]
    DeviceUnavailable(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown kernel {0}")]
    UnknownKernel(String),

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("kernel {0} is not ready")]
    KernelNotReady(String),

    #[error("execution request has no targets")]
    NoTargets,
}

pub type DispatchResult<T> = Result<T, DispatchError>;
