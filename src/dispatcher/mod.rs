//! Distributed Kernel Dispatcher Module
//!
//! Compute "kernels" (named source in some language plus an entry point) are
//! registered once, compiled wherever a compatible device exists and executed
//! across `(node, device)` targets.
//!
//! ## Submodules
//! - **`types`**: kernel, task and target types shared with the wire protocol.
//! - **`backend`**: the `ComputeBackend` plugin trait, the host CPU backend and
//!   the registry of local devices.
//! - **`dispatcher`**: kernel registry, fan-out and result collection.

pub mod backend;
pub mod dispatcher;
pub mod types;

#[cfg(test)]
mod tests;

pub use backend::{ComputeBackend, DeviceRegistry, HostBackend};
pub use dispatcher::KernelDispatcher;
