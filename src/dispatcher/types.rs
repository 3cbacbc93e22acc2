use crate::membership::types::{NodeId, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content hash of a kernel's name and source.
///
/// Two nodes registering the same kernel independently arrive at the same id,
/// and a node receiving a definition can check it was not altered on the way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub String);

impl KernelId {
    pub fn from_content(name: &str, source: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(source.as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..16].to_string())
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one execution request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a compute device, unique within its node (e.g. `cpu0`, `gpu1`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grid/block launch dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl Default for LaunchDims {
    fn default() -> Self {
        Self {
            grid: [1, 1, 1],
            block: [1, 1, 1],
        }
    }
}

impl LaunchDims {
    pub fn total_threads(&self) -> u64 {
        self.grid
            .iter()
            .chain(self.block.iter())
            .map(|d| u64::from(*d))
            .product()
    }
}

/// Lifecycle of a kernel on one node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KernelState {
    Pending,
    Compiling,
    /// At least one local device compiled it, or there was nothing to compile.
    Ready,
    /// Every compatible local device rejected it.
    Failed,
}

/// What travels between nodes: everything needed to compile a kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelDefinition {
    pub id: KernelId,
    pub name: String,
    pub source: String,
    /// Target language tag, matched against device capabilities.
    pub language: String,
    pub entry_point: String,
}

impl KernelDefinition {
    pub fn new(name: &str, source: &str, language: &str, entry_point: &str) -> Self {
        Self {
            id: KernelId::from_content(name, source),
            name: name.to_string(),
            source: source.to_string(),
            language: language.to_string(),
            entry_point: entry_point.to_string(),
        }
    }

    /// True when the id matches the name and source it travels with.
    pub fn is_authentic(&self) -> bool {
        self.id == KernelId::from_content(&self.name, &self.source)
    }
}

/// Output of a backend's compile step for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub kernel_id: KernelId,
    pub device: DeviceId,
    pub entry_point: String,
    /// Backend-specific program image.
    pub program: Vec<u8>,
}

/// A kernel as tracked by one node's dispatcher.
#[derive(Debug, Clone)]
pub struct DistributedKernel {
    pub definition: KernelDefinition,
    pub state: KernelState,
    /// Per-device compiled artifacts.
    pub artifacts: BTreeMap<DeviceId, CompiledArtifact>,
    /// Per-device compile errors; they never fail the registry.
    pub compile_errors: BTreeMap<DeviceId, String>,
    pub registered_at: u64,
}

impl DistributedKernel {
    pub fn new(definition: KernelDefinition) -> Self {
        Self {
            definition,
            state: KernelState::Pending,
            artifacts: BTreeMap::new(),
            compile_errors: BTreeMap::new(),
            registered_at: now_ms(),
        }
    }

    pub fn id(&self) -> &KernelId {
        &self.definition.id
    }

    pub fn status(&self) -> KernelStatus {
        KernelStatus {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            language: self.definition.language.clone(),
            state: self.state,
            compiled_devices: self.artifacts.keys().cloned().collect(),
            errors: self.compile_errors.clone(),
        }
    }
}

/// Snapshot returned by the kernel status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelStatus {
    pub id: KernelId,
    pub name: String,
    pub language: String,
    pub state: KernelState,
    pub compiled_devices: Vec<DeviceId>,
    pub errors: BTreeMap<DeviceId, String>,
}

/// One `(node, device)` pair an execution request fans out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExecutionTarget {
    pub node: NodeId,
    pub device: DeviceId,
}

impl ExecutionTarget {
    pub fn new(node: impl Into<NodeId>, device: impl Into<DeviceId>) -> Self {
        Self {
            node: node.into(),
            device: device.into(),
        }
    }

    /// Key used in a task's result map.
    pub fn key(&self) -> String {
        format!("{}/{}", self.node, self.device)
    }
}

/// Result of one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetOutcome {
    Success { output: Vec<u8>, elapsed_ms: u64 },
    Failure { error: String },
}

impl TargetOutcome {
    pub fn failure(error: impl fmt::Display) -> Self {
        TargetOutcome::Failure {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TargetOutcome::Success { .. })
    }
}

/// Represents the lifecycle state of a kernel task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    /// Targets are executing or being awaited.
    Running,
    /// Every target reported success.
    Completed,
    /// At least one target failed or timed out. Successful siblings are
    /// still recorded in the result map.
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// One execution request and everything learned about it so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelTask {
    pub id: TaskId,
    pub kernel_id: KernelId,
    /// Ordered list of targets.
    pub targets: Vec<ExecutionTarget>,
    pub input: Vec<u8>,
    pub launch: LaunchDims,
    pub status: TaskStatus,
    /// `node/device` -> outcome, filled as targets report.
    pub results: BTreeMap<String, TargetOutcome>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}
