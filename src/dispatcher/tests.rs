//! Dispatcher Module Tests
//!
//! ## Test Scopes
//! - **Backend**: host kernels compile and run; compile errors are typed.
//! - **Registry**: kernel ids, lifecycle states and per-device compile errors.
//! - **Fan-out**: local and remote targets, unreachable and silent nodes,
//!   definitions pulled on demand and pushed on join.
//! - **Deadlines & retention**: hung local kernels and pruning of old tasks.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::backend::{ComputeBackend, DeviceRegistry, HostBackend};
    use crate::dispatcher::dispatcher::KernelDispatcher;
    use crate::dispatcher::types::*;
    use crate::error::{BackendError, DispatchError};
    use crate::membership::types::{DeviceInfo, MembershipEvent, NodeId};
    use crate::transport::local::LocalNetwork;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const ADD_SOURCE: &str =
        "__global__ void add_kernel(const int* a, const int* b, int* out) { out[i] = a[i] + b[i]; }";

    fn i32s(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn gpu(language: &str) -> DeviceInfo {
        DeviceInfo {
            id: "gpu0".to_string(),
            kind: "gpu".to_string(),
            languages: vec![language.to_string()],
        }
    }

    fn dispatcher_on(network: &Arc<LocalNetwork>, node: &str) -> Arc<KernelDispatcher> {
        let devices = DeviceRegistry::new();
        devices.register_backend(Arc::new(HostBackend::with_builtins("cuda")));
        devices.register_device(gpu("cuda"));

        let dispatcher =
            KernelDispatcher::new(network.endpoint(node), devices, DispatcherConfig::default());
        dispatcher.start();
        dispatcher
    }

    /// A backend whose kernels never return.
    struct StalledBackend;

    #[async_trait]
    impl ComputeBackend for StalledBackend {
        fn language(&self) -> &str {
            "stall"
        }

        fn compile(
            &self,
            kernel_id: &KernelId,
            device: &DeviceId,
            _source: &str,
            entry_point: &str,
        ) -> Result<CompiledArtifact, BackendError> {
            Ok(CompiledArtifact {
                kernel_id: kernel_id.clone(),
                device: device.clone(),
                entry_point: entry_point.to_string(),
                program: Vec::new(),
            })
        }

        async fn execute(
            &self,
            _artifact: &CompiledArtifact,
            _input: &[u8],
            _launch: LaunchDims,
        ) -> Result<Vec<u8>, BackendError> {
            std::future::pending().await
        }
    }

    fn output_of(task: &KernelTask, key: &str) -> Option<Vec<u8>> {
        match task.results.get(key) {
            Some(TargetOutcome::Success { output, .. }) => Some(output.clone()),
            _ => None,
        }
    }

    // ============================================================
    // TEST 1: Host backend
    // ============================================================

    #[tokio::test]
    async fn test_host_backend_compiles_and_runs_add() {
        let backend = HostBackend::with_builtins("cuda");
        let id = KernelId::from_content("add", ADD_SOURCE);

        let artifact = backend
            .compile(&id, &DeviceId::from("gpu0"), ADD_SOURCE, "add_kernel")
            .unwrap();
        assert_eq!(artifact.entry_point, "add_kernel");

        let output = backend
            .execute(&artifact, &i32s(&[1, 2, 3, 4, 5, 6]), LaunchDims::default())
            .await
            .unwrap();
        assert_eq!(output, i32s(&[5, 7, 9]));
    }

    #[test]
    fn test_host_backend_rejects_missing_entry_point() {
        let backend = HostBackend::with_builtins("cuda");
        let id = KernelId::from_content("mul", "void mul_kernel() {}");

        let err = backend
            .compile(&id, &DeviceId::from("gpu0"), "void mul_kernel() {}", "mul_kernel")
            .unwrap_err();
        assert!(matches!(err, BackendError::Compile(_)));

        let err = backend
            .compile(&id, &DeviceId::from("gpu0"), "void other() {}", "add_kernel")
            .unwrap_err();
        assert!(err.to_string().contains("not found in source"));
    }

    #[test]
    fn test_registry_matches_devices_by_language() {
        let devices = DeviceRegistry::new();
        devices.register_device(gpu("cuda"));
        devices.register_device(DeviceInfo {
            id: "cpu0".to_string(),
            kind: "cpu".to_string(),
            languages: vec!["host".to_string()],
        });

        // No backend yet: nothing is compatible.
        assert!(devices.compatible_devices("cuda").is_empty());

        devices.register_backend(Arc::new(HostBackend::with_builtins("cuda")));
        assert_eq!(devices.compatible_devices("cuda"), vec![DeviceId::from("gpu0")]);
        assert!(devices.compatible_devices("host").is_empty());
        assert_eq!(devices.backend_count(), 1);
    }

    // ============================================================
    // TEST 2: Kernel registry
    // ============================================================

    #[test]
    fn test_kernel_id_is_content_hash() {
        let a = KernelId::from_content("add", ADD_SOURCE);
        let b = KernelId::from_content("add", ADD_SOURCE);
        let c = KernelId::from_content("add", "void add_kernel() {}");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut definition = KernelDefinition::new("add", ADD_SOURCE, "cuda", "add_kernel");
        assert!(definition.is_authentic());
        definition.source.push(' ');
        assert!(!definition.is_authentic());
    }

    #[tokio::test]
    async fn test_register_kernel_compiles_on_local_devices() {
        let network = LocalNetwork::new();
        let dispatcher = dispatcher_on(&network, "node-a");

        let id = dispatcher
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        let status = dispatcher.kernel_status(&id).unwrap();
        assert_eq!(status.state, KernelState::Ready);
        assert_eq!(status.compiled_devices, vec![DeviceId::from("gpu0")]);
        assert!(status.errors.is_empty());
    }

    #[tokio::test]
    async fn test_compile_failure_is_recorded_not_fatal() {
        let network = LocalNetwork::new();
        let dispatcher = dispatcher_on(&network, "node-a");

        let id = dispatcher
            .register_kernel("broken", "int main() {}", "cuda", "add_kernel")
            .await
            .unwrap();

        let status = dispatcher.kernel_status(&id).unwrap();
        assert_eq!(status.state, KernelState::Failed);
        assert!(status.errors.contains_key(&DeviceId::from("gpu0")));

        // Executing it surfaces the compile error per target.
        let task_id = dispatcher
            .execute_kernel(
                &id,
                vec![ExecutionTarget::new("node-a", "gpu0")],
                Vec::new(),
                LaunchDims::default(),
            )
            .unwrap();
        let task = dispatcher.await_task(&task_id).await.unwrap();
        assert!(matches!(task.status, TaskStatus::Failed { .. }));
        match task.results.get("node-a/gpu0") {
            Some(TargetOutcome::Failure { error }) => assert!(error.contains("compilation failed")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kernel_without_local_backend_is_ready_remote_only() {
        let network = LocalNetwork::new();
        let dispatcher = dispatcher_on(&network, "node-a");

        let id = dispatcher
            .register_kernel("shader", "void main_spv() {}", "spirv", "main_spv")
            .await
            .unwrap();

        let status = dispatcher.kernel_status(&id).unwrap();
        assert_eq!(status.state, KernelState::Ready);
        assert!(status.compiled_devices.is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_kernel_and_empty_targets() {
        let network = LocalNetwork::new();
        let dispatcher = dispatcher_on(&network, "node-a");

        let unknown = KernelId("deadbeef".to_string());
        let err = dispatcher
            .execute_kernel(
                &unknown,
                vec![ExecutionTarget::new("node-a", "gpu0")],
                Vec::new(),
                LaunchDims::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownKernel(_)));

        let id = dispatcher
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();
        let err = dispatcher
            .execute_kernel(&id, Vec::new(), Vec::new(), LaunchDims::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoTargets));

        let err = dispatcher.task(&TaskId::new()).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask(_)));
    }

    // ============================================================
    // TEST 3: Fan-out
    // ============================================================

    #[tokio::test]
    async fn test_local_success_with_unreachable_remote_fails_task() {
        // ARRANGE: node-b exists but cannot be reached
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let _b = dispatcher_on(&network, "node-b");
        network.disconnect(&NodeId::from("node-b"));

        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        // ACT
        let task_id = a
            .execute_kernel(
                &id,
                vec![
                    ExecutionTarget::new("node-a", "gpu0"),
                    ExecutionTarget::new("node-b", "gpu0"),
                ],
                i32s(&[1, 2, 3, 4, 5, 6]),
                LaunchDims::default(),
            )
            .unwrap();
        let task = a.await_task(&task_id).await.unwrap();

        // ASSERT: failed overall, local result kept
        assert!(matches!(task.status, TaskStatus::Failed { .. }));
        assert_eq!(output_of(&task, "node-a/gpu0"), Some(i32s(&[5, 7, 9])));
        assert!(matches!(
            task.results.get("node-b/gpu0"),
            Some(TargetOutcome::Failure { .. })
        ));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_remote_node_pulls_unknown_kernel_on_demand() {
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        // node-b joins after the announcement went out.
        let b = dispatcher_on(&network, "node-b");
        assert!(b.kernel_status(&id).is_err());

        let task_id = a
            .execute_kernel(
                &id,
                vec![
                    ExecutionTarget::new("node-a", "gpu0"),
                    ExecutionTarget::new("node-b", "gpu0"),
                ],
                i32s(&[10, 20, 1, 2]),
                LaunchDims::default(),
            )
            .unwrap();
        let task = a.await_task(&task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(output_of(&task, "node-a/gpu0"), Some(i32s(&[11, 22])));
        assert_eq!(output_of(&task, "node-b/gpu0"), Some(i32s(&[11, 22])));
        assert_eq!(b.kernel_status(&id).unwrap().state, KernelState::Ready);
    }

    #[tokio::test]
    async fn test_announcement_reaches_existing_nodes() {
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let b = dispatcher_on(&network, "node-b");

        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        let known = tokio::time::timeout(Duration::from_secs(2), async {
            while b.kernel_status(&id).is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(known.is_ok(), "node-b never learned the kernel");
    }

    #[tokio::test]
    async fn test_catalog_pushed_to_joining_node() {
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        let (events, receiver) = broadcast::channel(8);
        a.follow_membership(receiver);

        let b = dispatcher_on(&network, "node-b");
        events
            .send(MembershipEvent::Joined(NodeId::from("node-b")))
            .unwrap();

        let known = tokio::time::timeout(Duration::from_secs(2), async {
            while b.kernel_status(&id).is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(known.is_ok(), "catalog was not pushed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_times_out_after_task_timeout() {
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let _b = dispatcher_on(&network, "node-b");

        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();
        network.mute(&NodeId::from("node-b"));

        let started = tokio::time::Instant::now();
        let task_id = a
            .execute_kernel(
                &id,
                vec![ExecutionTarget::new("node-b", "gpu0")],
                i32s(&[1, 1]),
                LaunchDims::default(),
            )
            .unwrap();
        let task = a.await_task(&task_id).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(30));
        match &task.status {
            TaskStatus::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_fails_only_that_target() {
        let network = LocalNetwork::new();
        let a = dispatcher_on(&network, "node-a");
        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        let task_id = a
            .execute_kernel(
                &id,
                vec![
                    ExecutionTarget::new("node-a", "gpu0"),
                    ExecutionTarget::new("node-a", "gpu7"),
                ],
                i32s(&[1, 2]),
                LaunchDims::default(),
            )
            .unwrap();
        let task = a.await_task(&task_id).await.unwrap();

        assert!(matches!(task.status, TaskStatus::Failed { .. }));
        assert_eq!(output_of(&task, "node-a/gpu0"), Some(i32s(&[3])));
        assert_eq!(a.tasks().len(), 1);
    }

    // ============================================================
    // TEST 4: Deadlines & retention
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_hung_local_kernel_fails_at_task_deadline() {
        let network = LocalNetwork::new();
        let devices = DeviceRegistry::new();
        devices.register_backend(Arc::new(StalledBackend));
        devices.register_backend(Arc::new(HostBackend::with_builtins("cuda")));
        devices.register_device(DeviceInfo {
            id: "gpu0".to_string(),
            kind: "gpu".to_string(),
            languages: vec!["stall".to_string(), "cuda".to_string()],
        });
        let a = KernelDispatcher::new(network.endpoint("node-a"), devices, DispatcherConfig::default());
        a.start();

        let hung = a
            .register_kernel("spin", "void spin() {}", "stall", "spin")
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let task_id = a
            .execute_kernel(
                &hung,
                vec![ExecutionTarget::new("node-a", "gpu0")],
                Vec::new(),
                LaunchDims::default(),
            )
            .unwrap();

        let task = tokio::time::timeout(Duration::from_secs(120), a.await_task(&task_id))
            .await
            .expect("task never left Running")
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(30));
        match &task.status {
            TaskStatus::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert!(matches!(
            task.results.get("node-a/gpu0"),
            Some(TargetOutcome::Failure { .. })
        ));
        assert!(task.finished_at.is_some());

        // The dispatcher is still usable afterwards.
        let add = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();
        let task_id = a
            .execute_kernel(
                &add,
                vec![ExecutionTarget::new("node-a", "gpu0")],
                i32s(&[1, 2]),
                LaunchDims::default(),
            )
            .unwrap();
        let task = a.await_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_oldest_finished_tasks_are_pruned() {
        let network = LocalNetwork::new();
        let devices = DeviceRegistry::new();
        devices.register_backend(Arc::new(HostBackend::with_builtins("cuda")));
        devices.register_device(gpu("cuda"));
        let config = DispatcherConfig {
            max_finished_tasks: 2,
            ..DispatcherConfig::default()
        };
        let a = KernelDispatcher::new(network.endpoint("node-a"), devices, config);
        a.start();

        let id = a
            .register_kernel("add", ADD_SOURCE, "cuda", "add_kernel")
            .await
            .unwrap();

        let mut finished = Vec::new();
        for value in 0..5 {
            let task_id = a
                .execute_kernel(
                    &id,
                    vec![ExecutionTarget::new("node-a", "gpu0")],
                    i32s(&[value, value]),
                    LaunchDims::default(),
                )
                .unwrap();
            let task = a.await_task(&task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            finished.push(task_id);
        }

        assert_eq!(a.tasks().len(), 2);
        assert!(matches!(a.task(&finished[0]), Err(DispatchError::UnknownTask(_))));
        assert!(matches!(a.task(&finished[2]), Err(DispatchError::UnknownTask(_))));
        assert!(a.task(&finished[3]).is_ok());
        assert!(a.task(&finished[4]).is_ok());
    }
}
