//! Wire envelope and the tagged union of every message kind the cluster speaks.

use serde::{Deserialize, Serialize};

use crate::coherency::types::Address;
use crate::dispatcher::types::{
    DeviceId, KernelDefinition, KernelId, LaunchDims, TargetOutcome, TaskId,
};
use crate::membership::types::{DeviceInfo, NodeId, now_ms};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    ReadRequest,
    WriteRequest,
    Invalidate,
    DataResponse,
    Ack,
    Writeback,
    Migrate,
    MigrateCommit,
    MigrateAbort,
    NodeAnnounce,
    Heartbeat,
    Leave,
    KernelSubmit,
    KernelFetch,
    KernelExecute,
    KernelResult,
    Delivered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessagePayload {
    ReadRequest {
        address: Address,
    },
    /// Request for ownership: the recipient gives up its copy.
    WriteRequest {
        address: Address,
    },
    Invalidate {
        address: Address,
    },
    /// `data == None` means the responder had no valid copy.
    DataResponse {
        address: Address,
        data: Option<Vec<u8>>,
        version: u64,
    },
    /// Positive or negative acknowledgment. Invalidation acks carry the
    /// responder's bytes when it held a valid copy.
    Ack {
        address: Address,
        data: Option<Vec<u8>>,
        version: u64,
        error: Option<String>,
    },
    Writeback {
        address: Address,
        data: Vec<u8>,
        version: u64,
    },
    /// A whole page: 64 lines back to back plus one version per line.
    Migrate {
        page: Address,
        data: Vec<u8>,
        versions: Vec<u64>,
    },
    /// The staged page may be installed; the sender has dropped its copies.
    MigrateCommit {
        page: Address,
    },
    /// The staged page is discarded.
    MigrateAbort {
        page: Address,
    },
    NodeAnnounce {
        address: String,
        devices: Vec<DeviceInfo>,
    },
    Heartbeat,
    Leave,
    KernelSubmit {
        kernel: KernelDefinition,
    },
    KernelFetch {
        kernel_id: KernelId,
    },
    KernelExecute {
        task_id: TaskId,
        kernel_id: KernelId,
        device: DeviceId,
        input: Vec<u8>,
        launch: LaunchDims,
    },
    KernelResult {
        task_id: TaskId,
        device: DeviceId,
        outcome: TargetOutcome,
    },
    /// Transport-level receipt for a `requires_ack` message.
    Delivered {
        of: MessageType,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::ReadRequest { .. } => MessageType::ReadRequest,
            MessagePayload::WriteRequest { .. } => MessageType::WriteRequest,
            MessagePayload::Invalidate { .. } => MessageType::Invalidate,
            MessagePayload::DataResponse { .. } => MessageType::DataResponse,
            MessagePayload::Ack { .. } => MessageType::Ack,
            MessagePayload::Writeback { .. } => MessageType::Writeback,
            MessagePayload::Migrate { .. } => MessageType::Migrate,
            MessagePayload::MigrateCommit { .. } => MessageType::MigrateCommit,
            MessagePayload::MigrateAbort { .. } => MessageType::MigrateAbort,
            MessagePayload::NodeAnnounce { .. } => MessageType::NodeAnnounce,
            MessagePayload::Heartbeat => MessageType::Heartbeat,
            MessagePayload::Leave => MessageType::Leave,
            MessagePayload::KernelSubmit { .. } => MessageType::KernelSubmit,
            MessagePayload::KernelFetch { .. } => MessageType::KernelFetch,
            MessagePayload::KernelExecute { .. } => MessageType::KernelExecute,
            MessagePayload::KernelResult { .. } => MessageType::KernelResult,
            MessagePayload::Delivered { .. } => MessageType::Delivered,
        }
    }

    /// Coherency traffic jumps the inbound queue ahead of cluster chatter.
    pub fn default_priority(&self) -> Priority {
        match self.message_type() {
            MessageType::Invalidate
            | MessageType::WriteRequest
            | MessageType::Ack
            | MessageType::DataResponse
            | MessageType::ReadRequest => Priority::High,
            MessageType::Heartbeat | MessageType::NodeAnnounce | MessageType::Leave => {
                Priority::Low
            }
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub source_node: NodeId,
    /// `None` broadcasts to every known peer.
    pub target_node: Option<NodeId>,
    /// Correlates requests and replies; replies reuse the request's id.
    pub sequence_id: u64,
    pub timestamp: u64,
    pub payload: MessagePayload,
    pub checksum: Option<u32>,
    pub requires_ack: bool,
    pub priority: Priority,
}

impl Message {
    pub fn new(
        source_node: NodeId,
        target_node: Option<NodeId>,
        sequence_id: u64,
        payload: MessagePayload,
    ) -> Self {
        let priority = payload.default_priority();
        Self {
            source_node,
            target_node,
            sequence_id,
            timestamp: now_ms(),
            payload,
            checksum: None,
            requires_ack: false,
            priority,
        }
    }

    /// A message addressed back to this one's sender with the same sequence id.
    pub fn reply(&self, from: NodeId, payload: MessagePayload) -> Self {
        Message::new(from, Some(self.source_node.clone()), self.sequence_id, payload)
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_node.is_none()
    }

    fn digest(&self) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source_node.as_str().as_bytes());
        hasher.update(&self.sequence_id.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        // Encoding a plain enum of owned data cannot fail.
        if let Ok(encoded) = bincode::serialize(&self.payload) {
            hasher.update(&encoded);
        }
        let hash = hasher.finalize();
        let bytes = hash.as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn seal(mut self) -> Self {
        self.checksum = Some(self.digest());
        self
    }

    /// Unsealed messages pass; sealed ones must match their digest.
    pub fn verify_checksum(&self) -> bool {
        match self.checksum {
            Some(checksum) => checksum == self.digest(),
            None => true,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
