//! Kernel Dispatcher
//!
//! Registers kernels, compiles them on local devices and fans execution
//! requests out to local and remote `(node, device)` targets.
//!
//! ## Responsibilities
//! - **Registry**: kernel lifecycle `Pending -> Compiling -> Ready | Failed`,
//!   with per-device compile errors kept for the status query.
//! - **Announcement**: new kernels are broadcast as KERNEL_SUBMIT, and the whole
//!   catalog is pushed to nodes that join later. A node asked to run a kernel
//!   it has never seen pulls the definition from the requester (KERNEL_FETCH).
//! - **Execution**: local targets run in the task's own flow, remote targets
//!   become KERNEL_EXECUTE transactions answered by KERNEL_RESULT. One failing
//!   target fails the task without cancelling its siblings. Targets still
//!   running at the task deadline are failed as timed out.
//! - **Retention**: only the most recent finished tasks stay queryable.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::backend::DeviceRegistry;
use super::types::*;
use crate::config::DispatcherConfig;
use crate::error::{BackendError, DispatchError, DispatchResult};
use crate::membership::types::{MembershipEvent, NodeId, now_ms};
use crate::transaction::{TransactionKind, TransactionManager};
use crate::transport::message::{Message, MessagePayload, MessageType};
use crate::transport::{Transport, handler};

pub struct KernelDispatcher {
    node: NodeId,
    transport: Arc<dyn Transport>,
    devices: Arc<DeviceRegistry>,
    config: DispatcherConfig,
    kernels: DashMap<KernelId, DistributedKernel>,
    tasks: DashMap<TaskId, KernelTask>,
    /// Finished task ids, oldest first.
    finished: Mutex<VecDeque<TaskId>>,
    watchers: DashMap<TaskId, watch::Sender<TaskStatus>>,
    /// Remote executions awaiting KERNEL_RESULT.
    results: TransactionManager<TargetOutcome>,
    /// Definition pulls awaiting KERNEL_SUBMIT.
    fetches: TransactionManager<KernelDefinition>,
}

impl KernelDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        devices: Arc<DeviceRegistry>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: transport.local_node().clone(),
            transport,
            devices,
            config,
            kernels: DashMap::new(),
            tasks: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            watchers: DashMap::new(),
            results: TransactionManager::new(),
            fetches: TransactionManager::new(),
        })
    }

    /// Registers the kernel message handlers on the transport.
    pub fn start(self: &Arc<Self>) {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        let kernel_handler = handler(move |message: Message| {
            let dispatcher = dispatcher.clone();
            async move {
                if let Some(dispatcher) = dispatcher.upgrade() {
                    dispatcher.handle_message(message).await;
                }
            }
        });

        for kind in [
            MessageType::KernelSubmit,
            MessageType::KernelFetch,
            MessageType::KernelExecute,
            MessageType::KernelResult,
        ] {
            self.transport.register_handler(kind, kernel_handler.clone());
        }

        tracing::info!(
            "Kernel dispatcher started on {} with {} devices",
            self.node,
            self.devices.devices().len()
        );
    }

    /// Pushes the kernel catalog to every node that joins.
    pub fn follow_membership(self: &Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) {
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::Joined(node)) => {
                        let Some(dispatcher) = dispatcher.upgrade() else {
                            break;
                        };
                        dispatcher.push_catalog(&node).await;
                    }
                    Ok(MembershipEvent::Departed(node)) => {
                        tracing::debug!("Dispatcher noted departure of {}", node);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dispatcher missed {} membership events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    // --- Kernel registry ---

    /// Registers a kernel, compiles it on every compatible local device and
    /// announces it to the cluster. Compile failures are recorded per device
    /// and never fail the call.
    pub async fn register_kernel(
        &self,
        name: &str,
        source: &str,
        language: &str,
        entry_point: &str,
    ) -> DispatchResult<KernelId> {
        let definition = KernelDefinition::new(name, source, language, entry_point);
        let id = definition.id.clone();

        let status = self.install(definition.clone());
        tracing::info!(
            "Registered kernel {} ({}) as {:?} on {} devices",
            name,
            id,
            status.state,
            status.compiled_devices.len()
        );

        let announce = Message::new(
            self.node.clone(),
            None,
            self.transport.next_sequence_id(),
            MessagePayload::KernelSubmit { kernel: definition },
        );
        if !self.transport.send(announce).await {
            tracing::warn!("Announcement of kernel {} did not reach every peer", id);
        }

        Ok(id)
    }

    /// Adds a definition to the registry and compiles it. Known kernels are
    /// left as they are.
    fn install(&self, definition: KernelDefinition) -> KernelStatus {
        let id = definition.id.clone();

        {
            let mut entry = self
                .kernels
                .entry(id.clone())
                .or_insert_with(|| DistributedKernel::new(definition.clone()));
            if entry.state != KernelState::Pending {
                return entry.status();
            }
            entry.state = KernelState::Compiling;
        }

        let mut artifacts = Vec::new();
        let mut errors = Vec::new();
        let devices = self.devices.compatible_devices(&definition.language);

        match self.devices.backend(&definition.language) {
            Some(backend) => {
                for device in &devices {
                    match backend.compile(&id, device, &definition.source, &definition.entry_point)
                    {
                        Ok(artifact) => artifacts.push((device.clone(), artifact)),
                        Err(e) => {
                            tracing::warn!("Kernel {} failed to compile on {}: {}", id, device, e);
                            errors.push((device.clone(), e.to_string()));
                        }
                    }
                }
            }
            None => {
                tracing::debug!(
                    "No local backend for {}, kernel {} stays remote-only",
                    definition.language,
                    id
                );
            }
        }

        let Some(mut kernel) = self.kernels.get_mut(&id) else {
            return DistributedKernel::new(definition).status();
        };
        let attempted = artifacts.len() + errors.len();
        kernel.artifacts.extend(artifacts);
        kernel.compile_errors.extend(errors);
        kernel.state = if attempted > 0 && kernel.artifacts.is_empty() {
            KernelState::Failed
        } else {
            KernelState::Ready
        };
        kernel.status()
    }

    pub fn kernel_status(&self, kernel_id: &KernelId) -> DispatchResult<KernelStatus> {
        self.kernels
            .get(kernel_id)
            .map(|kernel| kernel.status())
            .ok_or_else(|| DispatchError::UnknownKernel(kernel_id.to_string()))
    }

    pub fn kernels(&self) -> Vec<KernelStatus> {
        let mut kernels: Vec<KernelStatus> =
            self.kernels.iter().map(|entry| entry.status()).collect();
        kernels.sort_by(|a, b| a.name.cmp(&b.name));
        kernels
    }

    pub fn definition(&self, kernel_id: &KernelId) -> Option<KernelDefinition> {
        self.kernels
            .get(kernel_id)
            .map(|kernel| kernel.definition.clone())
    }

    /// Sends every known definition to `node`.
    pub async fn push_catalog(&self, node: &NodeId) {
        if node == &self.node {
            return;
        }

        let definitions: Vec<KernelDefinition> = self
            .kernels
            .iter()
            .map(|entry| entry.definition.clone())
            .collect();

        for kernel in definitions {
            let id = kernel.id.clone();
            let message = Message::new(
                self.node.clone(),
                Some(node.clone()),
                self.transport.next_sequence_id(),
                MessagePayload::KernelSubmit { kernel },
            );
            if !self.transport.send(message).await {
                tracing::warn!("Could not push kernel {} to {}", id, node);
            }
        }
    }

    // --- Execution ---

    /// Starts a task over `targets` and returns its id immediately; use
    /// [`KernelDispatcher::await_task`] for the outcome.
    pub fn execute_kernel(
        self: &Arc<Self>,
        kernel_id: &KernelId,
        targets: Vec<ExecutionTarget>,
        input: Vec<u8>,
        launch: LaunchDims,
    ) -> DispatchResult<TaskId> {
        if targets.is_empty() {
            return Err(DispatchError::NoTargets);
        }
        if !self.kernels.contains_key(kernel_id) {
            return Err(DispatchError::UnknownKernel(kernel_id.to_string()));
        }

        let task = KernelTask {
            id: TaskId::new(),
            kernel_id: kernel_id.clone(),
            targets,
            input,
            launch,
            status: TaskStatus::Running,
            results: Default::default(),
            started_at: now_ms(),
            finished_at: None,
        };
        let task_id = task.id.clone();

        let (watcher, _) = watch::channel(TaskStatus::Running);
        self.watchers.insert(task_id.clone(), watcher);
        self.tasks.insert(task_id.clone(), task.clone());

        tracing::info!(
            "Task {} runs kernel {} on {} targets",
            task_id,
            kernel_id,
            task.targets.len()
        );

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_task(task).await;
        });

        Ok(task_id)
    }

    async fn run_task(self: Arc<Self>, task: KernelTask) {
        let deadline = self.config.task_timeout();

        if tokio::time::timeout(deadline, self.fan_out(&task)).await.is_err() {
            let error = format!("timed out after {}ms", deadline.as_millis());
            let mut unanswered = 0;
            if let Some(mut running) = self.tasks.get_mut(&task.id) {
                for target in &task.targets {
                    running.results.entry(target.key()).or_insert_with(|| {
                        unanswered += 1;
                        TargetOutcome::failure(error.clone())
                    });
                }
            }
            tracing::warn!(
                "Task {} hit its {}ms deadline with {} targets unanswered",
                task.id,
                deadline.as_millis(),
                unanswered
            );
        }

        self.finish_task(&task.id);
    }

    /// Runs every target of the task. Dropping the future aborts the remote
    /// executions still in flight.
    async fn fan_out(self: &Arc<Self>, task: &KernelTask) {
        let (local, remote): (Vec<ExecutionTarget>, Vec<ExecutionTarget>) = task
            .targets
            .iter()
            .cloned()
            .partition(|target| target.node == self.node);

        // Remote targets go out first so they run while local ones execute.
        let mut in_flight = JoinSet::new();
        for target in remote {
            let dispatcher = self.clone();
            let task = task.clone();
            in_flight.spawn(async move {
                let outcome = dispatcher.execute_remote(&task, &target).await;
                (target, outcome)
            });
        }

        for target in local {
            let outcome = self
                .execute_local(&task.kernel_id, &target.device, &task.input, task.launch)
                .await;
            self.record_result(&task.id, &target, outcome);
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((target, outcome)) => self.record_result(&task.id, &target, outcome),
                Err(e) => tracing::error!("Remote target of task {} aborted: {}", task.id, e),
            }
        }
    }

    /// Runs the kernel on one of this node's devices.
    async fn execute_local(
        &self,
        kernel_id: &KernelId,
        device: &DeviceId,
        input: &[u8],
        launch: LaunchDims,
    ) -> TargetOutcome {
        let started = Instant::now();

        if !self.devices.has_device(device) {
            return TargetOutcome::failure(BackendError::DeviceUnavailable(device.to_string()));
        }

        let (language, artifact, compile_error) = match self.kernels.get(kernel_id) {
            Some(kernel) => (
                kernel.definition.language.clone(),
                kernel.artifacts.get(device).cloned(),
                kernel.compile_errors.get(device).cloned(),
            ),
            None => return TargetOutcome::failure(DispatchError::UnknownKernel(kernel_id.to_string())),
        };

        let Some(artifact) = artifact else {
            return match compile_error {
                Some(error) => TargetOutcome::failure(error),
                None => TargetOutcome::failure(DispatchError::KernelNotReady(kernel_id.to_string())),
            };
        };

        let Some(backend) = self.devices.backend(&language) else {
            return TargetOutcome::failure(BackendError::DeviceUnavailable(format!(
                "{} has no {} backend",
                device, language
            )));
        };

        match backend.execute(&artifact, input, launch).await {
            Ok(output) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::debug!("Kernel {} ran on {} in {}ms", kernel_id, device, elapsed_ms);
                TargetOutcome::Success { output, elapsed_ms }
            }
            Err(e) => {
                tracing::warn!("Kernel {} failed on {}: {}", kernel_id, device, e);
                TargetOutcome::failure(e)
            }
        }
    }

    /// Ships one target to its node and waits for KERNEL_RESULT.
    async fn execute_remote(&self, task: &KernelTask, target: &ExecutionTarget) -> TargetOutcome {
        let handle = self.results.begin(
            self.node.clone(),
            TransactionKind::KernelExec,
            None,
            HashSet::from([target.node.clone()]),
        );
        let id = handle.id;

        let request = Message::new(
            self.node.clone(),
            Some(target.node.clone()),
            id,
            MessagePayload::KernelExecute {
                task_id: task.id.clone(),
                kernel_id: task.kernel_id.clone(),
                device: target.device.clone(),
                input: task.input.clone(),
                launch: task.launch,
            },
        )
        .with_ack();

        if !self.transport.send(request).await {
            self.results.cancel(id);
            tracing::warn!("Task {}: {} unreachable", task.id, target.node);
            return TargetOutcome::failure(format!("node {} unreachable", target.node));
        }

        match self.results.wait(handle, self.config.task_timeout()).await {
            Ok(mut transaction) => transaction
                .responses
                .remove(&target.node)
                .unwrap_or_else(|| TargetOutcome::failure("empty result")),
            Err(timeout) => {
                tracing::warn!(
                    "Task {}: {} did not answer within {}ms",
                    task.id,
                    target.key(),
                    timeout.waited.as_millis()
                );
                TargetOutcome::failure(format!(
                    "timed out after {}ms",
                    timeout.waited.as_millis()
                ))
            }
        }
    }

    fn record_result(&self, task_id: &TaskId, target: &ExecutionTarget, outcome: TargetOutcome) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.results.insert(target.key(), outcome);
        }
    }

    fn finish_task(&self, task_id: &TaskId) {
        let status = {
            let Some(mut task) = self.tasks.get_mut(task_id) else {
                return;
            };

            let failures: Vec<String> = task
                .targets
                .iter()
                .filter_map(|target| match task.results.get(&target.key()) {
                    Some(TargetOutcome::Success { .. }) => None,
                    Some(TargetOutcome::Failure { error }) => {
                        Some(format!("{}: {}", target.key(), error))
                    }
                    None => Some(format!("{}: no result", target.key())),
                })
                .collect();

            task.status = if failures.is_empty() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed {
                    error: format!(
                        "{} of {} targets failed ({})",
                        failures.len(),
                        task.targets.len(),
                        failures.join("; ")
                    ),
                }
            };
            task.finished_at = Some(now_ms());
            task.status.clone()
        };

        match &status {
            TaskStatus::Failed { error } => tracing::warn!("Task {} failed: {}", task_id, error),
            _ => tracing::info!("Task {} completed", task_id),
        }

        if let Some((_, watcher)) = self.watchers.remove(task_id) {
            watcher.send_replace(status);
        }

        self.prune_finished(task_id);
    }

    /// Forgets the oldest finished tasks beyond the configured limit.
    fn prune_finished(&self, task_id: &TaskId) {
        let pruned: Vec<TaskId> = {
            let mut finished = self.finished.lock();
            finished.push_back(task_id.clone());
            let excess = finished.len().saturating_sub(self.config.max_finished_tasks);
            finished.drain(..excess).collect()
        };

        for id in &pruned {
            self.tasks.remove(id);
        }
        if !pruned.is_empty() {
            tracing::debug!("Pruned {} finished tasks", pruned.len());
        }
    }

    pub fn task(&self, task_id: &TaskId) -> DispatchResult<KernelTask> {
        self.tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))
    }

    pub fn tasks(&self) -> Vec<KernelTask> {
        let mut tasks: Vec<KernelTask> = self.tasks.iter().map(|entry| entry.clone()).collect();
        tasks.sort_by_key(|task| task.started_at);
        tasks
    }

    /// Waits until the task is no longer running and returns it.
    pub async fn await_task(&self, task_id: &TaskId) -> DispatchResult<KernelTask> {
        let receiver = self.watchers.get(task_id).map(|watcher| watcher.subscribe());

        if let Some(mut receiver) = receiver
            && receiver.wait_for(TaskStatus::is_finished).await.is_err()
        {
            tracing::debug!("Watcher for task {} closed early", task_id);
        }

        self.task(task_id)
    }

    // --- Inbound messages ---

    pub async fn handle_message(&self, message: Message) {
        match &message.payload {
            MessagePayload::KernelSubmit { kernel } => {
                if !kernel.is_authentic() {
                    tracing::warn!(
                        "Dropping kernel {} from {}: id does not match content",
                        kernel.id,
                        message.source_node
                    );
                    return;
                }
                // A reply to one of our fetches, or a plain announcement.
                self.fetches
                    .respond(message.sequence_id, &message.source_node, kernel.clone());
                let status = self.install(kernel.clone());
                tracing::debug!(
                    "Kernel {} from {} is {:?} here",
                    kernel.id,
                    message.source_node,
                    status.state
                );
            }
            MessagePayload::KernelFetch { kernel_id } => match self.definition(kernel_id) {
                Some(kernel) => {
                    let reply =
                        message.reply(self.node.clone(), MessagePayload::KernelSubmit { kernel });
                    if !self.transport.send(reply).await {
                        tracing::warn!("Could not return kernel {} to {}", kernel_id, message.source_node);
                    }
                }
                None => {
                    tracing::warn!(
                        "{} asked for unknown kernel {}",
                        message.source_node,
                        kernel_id
                    );
                }
            },
            MessagePayload::KernelExecute {
                task_id,
                kernel_id,
                device,
                input,
                launch,
            } => {
                let outcome = self
                    .serve_execution(&message.source_node, kernel_id, device, input, *launch)
                    .await;
                let reply = message.reply(
                    self.node.clone(),
                    MessagePayload::KernelResult {
                        task_id: task_id.clone(),
                        device: device.clone(),
                        outcome,
                    },
                );
                if !self.transport.send(reply).await {
                    tracing::warn!(
                        "Result of task {} could not be returned to {}",
                        task_id,
                        message.source_node
                    );
                }
            }
            MessagePayload::KernelResult { outcome, .. } => {
                self.results
                    .respond(message.sequence_id, &message.source_node, outcome.clone());
            }
            MessagePayload::ReadRequest { .. }
            | MessagePayload::WriteRequest { .. }
            | MessagePayload::Invalidate { .. }
            | MessagePayload::DataResponse { .. }
            | MessagePayload::Ack { .. }
            | MessagePayload::Writeback { .. }
            | MessagePayload::Migrate { .. }
            | MessagePayload::MigrateCommit { .. }
            | MessagePayload::MigrateAbort { .. }
            | MessagePayload::NodeAnnounce { .. }
            | MessagePayload::Heartbeat
            | MessagePayload::Leave
            | MessagePayload::Delivered { .. } => {
                tracing::warn!("Dispatcher received unrelated {:?}", message.message_type());
            }
        }
    }

    /// Runs a target on behalf of `requester`, pulling the definition first
    /// if this node has never seen the kernel.
    async fn serve_execution(
        &self,
        requester: &NodeId,
        kernel_id: &KernelId,
        device: &DeviceId,
        input: &[u8],
        launch: LaunchDims,
    ) -> TargetOutcome {
        if !self.kernels.contains_key(kernel_id) {
            match self.fetch_definition(requester, kernel_id).await {
                Ok(definition) => {
                    self.install(definition);
                }
                Err(e) => return TargetOutcome::failure(e),
            }
        }

        self.execute_local(kernel_id, device, input, launch).await
    }

    async fn fetch_definition(
        &self,
        from: &NodeId,
        kernel_id: &KernelId,
    ) -> DispatchResult<KernelDefinition> {
        tracing::info!("Pulling unknown kernel {} from {}", kernel_id, from);

        let handle = self.fetches.begin(
            self.node.clone(),
            TransactionKind::KernelFetch,
            None,
            HashSet::from([from.clone()]),
        );
        let id = handle.id;

        let request = Message::new(
            self.node.clone(),
            Some(from.clone()),
            id,
            MessagePayload::KernelFetch {
                kernel_id: kernel_id.clone(),
            },
        );
        if !self.transport.send(request).await {
            self.fetches.cancel(id);
            return Err(DispatchError::UnknownKernel(kernel_id.to_string()));
        }

        match self.fetches.wait(handle, self.config.fetch_timeout()).await {
            Ok(mut transaction) => match transaction.responses.remove(from) {
                Some(definition) if &definition.id == kernel_id => Ok(definition),
                _ => Err(DispatchError::UnknownKernel(kernel_id.to_string())),
            },
            Err(_) => {
                tracing::warn!("{} never returned kernel {}", from, kernel_id);
                Err(DispatchError::UnknownKernel(kernel_id.to_string()))
            }
        }
    }
}
