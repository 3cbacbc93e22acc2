//! Compute Backends & Device Registry
//!
//! A backend compiles and runs kernels written in one language. The registry
//! maps language tags to backends and keeps the list of local devices with the
//! languages each of them accepts, so the dispatcher never hardcodes what a
//! device can run.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use super::types::{CompiledArtifact, DeviceId, KernelId, LaunchDims};
use crate::error::BackendError;
use crate::membership::types::DeviceInfo;

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Language tag this backend understands (e.g. `"host"`, `"cuda"`).
    fn language(&self) -> &str;

    fn compile(
        &self,
        kernel_id: &KernelId,
        device: &DeviceId,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledArtifact, BackendError>;

    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        input: &[u8],
        launch: LaunchDims,
    ) -> Result<Vec<u8>, BackendError>;
}

/// Type alias for a host kernel body.
pub type HostKernelFn =
    Arc<dyn Fn(&[u8], LaunchDims) -> Result<Vec<u8>, BackendError> + Send + Sync>;

/// Runs kernels as native Rust functions on the host CPU.
///
/// "Compiling" checks that the entry point names a registered host function
/// and that the source actually declares it.
pub struct HostBackend {
    language: String,
    kernels: DashMap<String, HostKernelFn>,
}

impl HostBackend {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
            kernels: DashMap::new(),
        }
    }

    /// Backend preloaded with `add_kernel`, `scale_kernel` and `copy_kernel`.
    pub fn with_builtins(language: &str) -> Self {
        let backend = Self::new(language);
        backend.register("add_kernel", add_kernel);
        backend.register("scale_kernel", scale_kernel);
        backend.register("copy_kernel", |input, _| Ok(input.to_vec()));
        backend
    }

    pub fn register<F>(&self, entry_point: &str, kernel: F)
    where
        F: Fn(&[u8], LaunchDims) -> Result<Vec<u8>, BackendError> + Send + Sync + 'static,
    {
        self.kernels.insert(entry_point.to_string(), Arc::new(kernel));
        tracing::debug!("Host backend '{}' provides {}", self.language, entry_point);
    }

    pub fn has_kernel(&self, entry_point: &str) -> bool {
        self.kernels.contains_key(entry_point)
    }
}

#[async_trait]
impl ComputeBackend for HostBackend {
    fn language(&self) -> &str {
        &self.language
    }

    fn compile(
        &self,
        kernel_id: &KernelId,
        device: &DeviceId,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledArtifact, BackendError> {
        if !source.contains(entry_point) {
            return Err(BackendError::Compile(format!(
                "entry point {} not found in source",
                entry_point
            )));
        }
        if !self.kernels.contains_key(entry_point) {
            return Err(BackendError::Compile(format!(
                "no host implementation of {}",
                entry_point
            )));
        }

        Ok(CompiledArtifact {
            kernel_id: kernel_id.clone(),
            device: device.clone(),
            entry_point: entry_point.to_string(),
            program: entry_point.as_bytes().to_vec(),
        })
    }

    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        input: &[u8],
        launch: LaunchDims,
    ) -> Result<Vec<u8>, BackendError> {
        let kernel = self
            .kernels
            .get(&artifact.entry_point)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BackendError::Execute(format!("{} is no longer loaded", artifact.entry_point))
            })?;

        let input = input.to_vec();
        tokio::task::spawn_blocking(move || kernel(&input, launch))
            .await
            .map_err(|e| BackendError::Execute(format!("kernel panicked: {}", e)))?
    }
}

fn read_i32s(bytes: &[u8]) -> Result<Vec<i32>, BackendError> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::Execute(format!(
            "input of {} bytes is not a sequence of i32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn write_i32s(values: impl Iterator<Item = i32>) -> Vec<u8> {
    values.flat_map(i32::to_le_bytes).collect()
}

/// Input: two little-endian `i32` vectors of equal length, back to back.
fn add_kernel(input: &[u8], _launch: LaunchDims) -> Result<Vec<u8>, BackendError> {
    let values = read_i32s(input)?;
    if values.len() % 2 != 0 {
        return Err(BackendError::Execute(
            "add_kernel expects two vectors of equal length".to_string(),
        ));
    }
    let (a, b) = values.split_at(values.len() / 2);
    Ok(write_i32s(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y))))
}

/// Input: a factor followed by the vector to scale.
fn scale_kernel(input: &[u8], _launch: LaunchDims) -> Result<Vec<u8>, BackendError> {
    let values = read_i32s(input)?;
    let Some((factor, rest)) = values.split_first() else {
        return Err(BackendError::Execute("scale_kernel needs a factor".to_string()));
    };
    Ok(write_i32s(rest.iter().map(|v| v.wrapping_mul(*factor))))
}

/// Local devices plus the backend for every language they speak.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<DeviceInfo>>,
    backends: DashMap<String, Arc<dyn ComputeBackend>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_backend(&self, backend: Arc<dyn ComputeBackend>) {
        let language = backend.language().to_string();
        self.backends.insert(language.clone(), backend);
        tracing::info!("Registered compute backend: {}", language);
    }

    /// Adds (or replaces) a local device.
    pub fn register_device(&self, device: DeviceInfo) {
        let mut devices = self.devices.write();
        devices.retain(|existing| existing.id != device.id);
        tracing::info!(
            "Registered device {} ({}) for {:?}",
            device.id,
            device.kind,
            device.languages
        );
        devices.push(device);
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().clone()
    }

    pub fn has_device(&self, device: &DeviceId) -> bool {
        self.devices.read().iter().any(|d| d.id == device.0)
    }

    pub fn backend(&self, language: &str) -> Option<Arc<dyn ComputeBackend>> {
        self.backends.get(language).map(|entry| entry.value().clone())
    }

    /// Devices that accept `language` and have a backend for it.
    pub fn compatible_devices(&self, language: &str) -> Vec<DeviceId> {
        if !self.backends.contains_key(language) {
            return Vec::new();
        }
        self.devices
            .read()
            .iter()
            .filter(|device| device.languages.iter().any(|l| l == language))
            .map(|device| DeviceId(device.id.clone()))
            .collect()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}
