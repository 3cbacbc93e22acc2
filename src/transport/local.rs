//! In-process network
//!
//! Connects endpoints living in one process through their inbound queues.
//! Two faults can be injected per node:
//! - **mute**: traffic to and from the node is silently dropped (sends still
//!   report success, like a lost datagram).
//! - **disconnect**: sends to or from the node fail outright.
//!
//! A drop filter additionally loses every message it matches.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::message::{Message, MessageType};
use super::{HandlerRegistry, InboundQueue, MessageHandlerFn, Transport};
use crate::membership::types::NodeId;

/// Returns `true` for messages the network should lose.
pub type DropFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Default)]
pub struct LocalNetwork {
    queues: DashMap<NodeId, InboundQueue>,
    muted: DashSet<NodeId>,
    disconnected: DashSet<NodeId>,
    filter: RwLock<Option<DropFilter>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the endpoint for `node` and starts its processing loop.
    /// Must be called inside a tokio runtime.
    pub fn endpoint(self: &Arc<Self>, node: impl Into<NodeId>) -> Arc<LocalTransport> {
        let node = node.into();
        let handlers = HandlerRegistry::new();
        let queue = InboundQueue::spawn(node.clone(), handlers.clone());
        self.queues.insert(node.clone(), queue);

        tracing::debug!("Local endpoint {} joined the network", node);

        Arc::new(LocalTransport {
            node,
            network: self.clone(),
            handlers,
            sequence: AtomicU64::new(rand::random::<u32>() as u64),
        })
    }

    pub fn mute(&self, node: &NodeId) {
        self.muted.insert(node.clone());
    }

    pub fn unmute(&self, node: &NodeId) {
        self.muted.remove(node);
    }

    pub fn disconnect(&self, node: &NodeId) {
        self.disconnected.insert(node.clone());
    }

    pub fn reconnect(&self, node: &NodeId) {
        self.disconnected.remove(node);
    }

    pub fn set_filter(&self, filter: DropFilter) {
        *self.filter.write() = Some(filter);
    }

    pub fn clear_filter(&self) {
        self.filter.write().take();
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, target: &NodeId, message: Message) -> bool {
        if self.disconnected.contains(target) {
            tracing::debug!("{} is disconnected, send fails", target);
            return false;
        }

        let Some(queue) = self.queues.get(target).map(|entry| entry.value().clone()) else {
            tracing::warn!("No endpoint for {}", target);
            return false;
        };

        if self.muted.contains(target) || self.muted.contains(&message.source_node) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Dropping {:?} {} -> {} (muted)",
                message.message_type(),
                message.source_node,
                target
            );
            return true;
        }

        let filtered = self
            .filter
            .read()
            .as_ref()
            .is_some_and(|filter| filter(&message));
        if filtered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Dropping {:?} {} -> {} (filtered)",
                message.message_type(),
                message.source_node,
                target
            );
            return true;
        }

        let accepted = queue.push(message);
        if accepted {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }
}

pub struct LocalTransport {
    node: NodeId,
    network: Arc<LocalNetwork>,
    handlers: Arc<HandlerRegistry>,
    sequence: AtomicU64,
}

impl LocalTransport {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: Message) -> bool {
        if self.network.disconnected.contains(&self.node) {
            return false;
        }

        let message = message.seal();

        match message.target_node.clone() {
            Some(target) => self.network.deliver(&target, message),
            None => {
                let peers = self.peers();
                let mut all_sent = true;
                for peer in peers {
                    let mut copy = message.clone();
                    copy.target_node = Some(peer.clone());
                    if !self.network.deliver(&peer, copy.seal()) {
                        all_sent = false;
                    }
                }
                all_sent
            }
        }
    }

    fn register_handler(&self, kind: MessageType, handler: MessageHandlerFn) {
        self.handlers.register(kind, handler);
    }

    fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .network
            .queues
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|node| node != &self.node)
            .collect();
        peers.sort();
        peers
    }
}
