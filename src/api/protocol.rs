use serde::{Deserialize, Serialize};

use crate::coherency::directory::CoherencyViolation;
use crate::coherency::stats::CoherencyStats;
use crate::coherency::types::Address;
use crate::dispatcher::types::{ExecutionTarget, KernelId, KernelTask, LaunchDims, TaskId};
use crate::membership::types::{Node, NodeId};
use crate::migration::types::{MemoryPage, MigrationCandidate};

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryReadRequest {
    pub address: Address,
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryReadResponse {
    pub data: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryWriteRequest {
    pub address: Address,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryEvictRequest {
    pub address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryMigrateRequest {
    pub address: Address,
    pub target: NodeId,
}

/// Reply of every memory operation that returns no data.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl OperationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CandidatesQuery {
    #[serde(default = "default_min_remote")]
    pub min_remote: u64,
}

fn default_min_remote() -> u64 {
    8
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PagesResponse {
    pub pages: Vec<MemoryPage>,
    pub candidates: Vec<MigrationCandidate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterKernelRequest {
    pub name: String,
    pub source: String,
    pub language: String,
    pub entry_point: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterKernelResponse {
    pub kernel_id: Option<KernelId>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteKernelRequest {
    pub kernel_id: KernelId,
    pub targets: Vec<ExecutionTarget>,
    #[serde(default)]
    pub input: Vec<u8>,
    #[serde(default)]
    pub launch: LaunchDims,
    /// Block until the task finishes and return it.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteKernelResponse {
    pub task_id: Option<TaskId>,
    pub task: Option<KernelTask>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub consistent: bool,
    pub violations: Vec<CoherencyViolation>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub node: NodeId,
    pub coherency: CoherencyStats,
    pub members: usize,
    pub kernels: usize,
    pub tasks: usize,
    pub tracked_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub local: NodeId,
    pub members: Vec<Node>,
}
