use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::types::{DeviceInfo, MembershipEvent, Node, NodeId, NodeStatus, now_ms};
use crate::config::MembershipConfig;
use crate::transport::message::{Message, MessagePayload, MessageType};
use crate::transport::{Transport, handler};

const EVENT_CAPACITY: usize = 256;

pub struct MembershipService {
    local_node: Node,
    transport: Arc<dyn Transport>,
    config: MembershipConfig,
    members: DashMap<NodeId, Node>,
    events: broadcast::Sender<MembershipEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    /// `address` is what peers are told to reach us at; `devices` are
    /// announced alongside it.
    pub fn new(
        transport: Arc<dyn Transport>,
        address: String,
        devices: Vec<DeviceInfo>,
        config: MembershipConfig,
    ) -> Arc<Self> {
        let local_node = Node {
            id: transport.local_node().clone(),
            address,
            devices,
            last_heartbeat: now_ms(),
            status: NodeStatus::Active,
        };

        let members = DashMap::new();
        members.insert(local_node.id.clone(), local_node.clone());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            local_node,
            transport,
            config,
            members,
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers the cluster-management handlers, announces this node and
    /// spawns the heartbeat loop (which also sweeps timeouts) and the
    /// discovery loop.
    pub async fn start(self: &Arc<Self>) {
        tracing::info!("Starting membership service for {}", self.local_node.id);

        for kind in [
            MessageType::NodeAnnounce,
            MessageType::Heartbeat,
            MessageType::Leave,
        ] {
            let service: Weak<Self> = Arc::downgrade(self);
            self.transport.register_handler(
                kind,
                handler(move |message: Message| {
                    let service = service.clone();
                    async move {
                        if let Some(service) = service.upgrade() {
                            service.handle_message(message).await;
                        }
                    }
                }),
            );
        }

        self.announce(None).await;

        let heartbeat_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.heartbeat_loop().await;
            })
        };

        let discovery_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.discovery_loop().await;
            })
        };

        self.tasks.lock().extend([heartbeat_handle, discovery_handle]);

        tracing::info!("All background tasks started");
    }

    /// Says goodbye to the cluster and stops the background loops.
    pub async fn shutdown(&self) {
        let leave = self.message(None, MessagePayload::Leave);
        if !self.transport.send(leave).await {
            tracing::warn!("LEAVE from {} did not reach every peer", self.local_node.id);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("{} left the cluster", self.local_node.id);
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Every known member, this node included, ordered by id.
    pub fn members(&self) -> Vec<Node> {
        let mut members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub fn active_members(&self) -> Vec<Node> {
        self.members()
            .into_iter()
            .filter(|member| member.status == NodeStatus::Active)
            .collect()
    }

    pub fn member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    fn message(&self, target: Option<NodeId>, payload: MessagePayload) -> Message {
        Message::new(
            self.local_node.id.clone(),
            target,
            self.transport.next_sequence_id(),
            payload,
        )
    }

    /// NODE_ANNOUNCE to one node, or to everyone when `target` is `None`.
    pub async fn announce(&self, target: Option<NodeId>) {
        let payload = MessagePayload::NodeAnnounce {
            address: self.local_node.address.clone(),
            devices: self.local_node.devices.clone(),
        };
        let message = self.message(target.clone(), payload);

        if !self.transport.send(message).await {
            match target {
                Some(node) => tracing::warn!("Failed to announce to {}", node),
                None => tracing::debug!("Announcement did not reach every peer"),
            }
        }
    }

    pub async fn heartbeat(&self) {
        if let Some(mut local) = self.members.get_mut(&self.local_node.id) {
            local.last_heartbeat = now_ms();
        }

        let message = self.message(None, MessagePayload::Heartbeat);
        if !self.transport.send(message).await {
            tracing::debug!("Heartbeat did not reach every peer");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.heartbeat().await;
            self.sweep();
        }
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.discovery_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            tracing::debug!("Re-announcing {}", self.local_node.id);
            self.announce(None).await;
        }
    }

    /// Runs one timeout sweep against the wall clock.
    pub fn sweep(&self) -> Vec<NodeId> {
        self.sweep_at(now_ms())
    }

    /// A member silent for longer than the node timeout becomes inactive; an
    /// inactive member is removed on the following sweep. Returns the
    /// removed members.
    pub fn sweep_at(&self, now: u64) -> Vec<NodeId> {
        let mut departed = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_node.id {
                continue;
            }

            match member.status {
                NodeStatus::Inactive => departed.push(member.id.clone()),
                NodeStatus::Active => {
                    let silent_for = now.saturating_sub(member.last_heartbeat);
                    if silent_for > self.config.node_timeout_ms {
                        tracing::warn!(
                            "Node {} inactive (no heartbeat for {}ms)",
                            member.id,
                            silent_for
                        );
                        member.status = NodeStatus::Inactive;
                    }
                }
            }
        }

        for node in &departed {
            self.remove_member(node);
        }
        departed
    }

    fn remove_member(&self, node: &NodeId) {
        if self.members.remove(node).is_none() {
            return;
        }

        self.transport.forget_peer(node);
        let _ = self.events.send(MembershipEvent::Departed(node.clone()));
        tracing::info!(
            "Node {} departed, cluster size now: {}",
            node,
            self.members.len()
        );
    }

    pub async fn handle_message(&self, message: Message) {
        let from = message.source_node.clone();
        if from == self.local_node.id {
            return;
        }
        let kind = message.message_type();

        match message.payload {
            MessagePayload::NodeAnnounce { address, devices } => {
                let joined = self.upsert(from.clone(), address, devices);
                if joined {
                    let _ = self.events.send(MembershipEvent::Joined(from.clone()));
                    // The newcomer hears about us before our next discovery round.
                    self.announce(Some(from)).await;
                }
            }
            MessagePayload::Heartbeat => match self.members.get_mut(&from) {
                Some(mut member) => {
                    member.last_heartbeat = now_ms();
                    if member.status == NodeStatus::Inactive {
                        tracing::info!("Node {} is active again", from);
                        member.status = NodeStatus::Active;
                    }
                }
                None => {
                    tracing::debug!("Heartbeat from unannounced node {}", from);
                }
            },
            MessagePayload::Leave => {
                tracing::info!("Node {} is leaving", from);
                self.remove_member(&from);
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
            | MessagePayload::KernelSubmit { .. }
            | MessagePayload::KernelFetch { .. }
            | MessagePayload::KernelExecute { .. }
            | MessagePayload::KernelResult { .. }
            | MessagePayload::Delivered { .. } => {
                tracing::warn!(
                    "Membership service received unrelated {:?} from {}",
                    kind,
                    from
                );
            }
        }
    }

    /// Returns `true` when `id` was not a member before.
    fn upsert(&self, id: NodeId, address: String, devices: Vec<DeviceInfo>) -> bool {
        match self.members.get_mut(&id) {
            Some(mut existing) => {
                existing.address = address;
                existing.devices = devices;
                existing.last_heartbeat = now_ms();
                existing.status = NodeStatus::Active;
                false
            }
            None => {
                tracing::info!(
                    "Discovered new member: {} at {} ({} devices)",
                    id,
                    address,
                    devices.len()
                );
                self.members.insert(
                    id.clone(),
                    Node {
                        id,
                        address,
                        devices,
                        last_heartbeat: now_ms(),
                        status: NodeStatus::Active,
                    },
                );
                tracing::info!("Cluster size now: {}", self.members.len());
                true
            }
        }
    }
}
