//! UDP transport
//!
//! bincode datagrams over a single tokio socket. Messages are sealed with a
//! checksum, `requires_ack` unicasts wait for a `Delivered` receipt and are
//! resent with exponential backoff, and duplicates are suppressed by
//! `(source, type, sequence)`.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use super::message::{Message, MessagePayload, MessageType};
use super::{HandlerRegistry, InboundQueue, MessageHandlerFn, Transport};
use crate::config::TransportConfig;
use crate::membership::types::NodeId;

type ReceiptKey = (NodeId, MessageType, u64);

/// The most recent `capacity` message keys, oldest evicted first.
pub(crate) struct DedupWindow {
    capacity: usize,
    seen: Mutex<(HashSet<ReceiptKey>, VecDeque<ReceiptKey>)>,
}

impl DedupWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Records `key` and returns `true` the first time it is seen.
    pub(crate) fn first_sighting(&self, key: ReceiptKey) -> bool {
        let mut seen = self.seen.lock();
        let (keys, order) = &mut *seen;
        if !keys.insert(key.clone()) {
            return false;
        }
        order.push_back(key);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                keys.remove(&oldest);
            }
        }
        true
    }
}

pub struct UdpTransport {
    node: NodeId,
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    seeds: Vec<SocketAddr>,
    peers: DashMap<NodeId, SocketAddr>,
    handlers: Arc<HandlerRegistry>,
    inbound: InboundQueue,
    sequence: AtomicU64,
    receipts: DashMap<ReceiptKey, oneshot::Sender<()>>,
    processed: DedupWindow,
}

impl UdpTransport {
    pub async fn bind(
        node: NodeId,
        bind_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
        config: TransportConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let handlers = HandlerRegistry::new();
        let inbound = InboundQueue::spawn(node.clone(), handlers.clone());

        tracing::info!("UDP transport for {} bound to {}", node, socket.local_addr()?);

        Ok(Arc::new(Self {
            node,
            socket: Arc::new(socket),
            seeds,
            peers: DashMap::new(),
            handlers,
            inbound,
            sequence: AtomicU64::new(rand::random::<u32>() as u64),
            receipts: DashMap::new(),
            processed: DedupWindow::new(config.dedup_window),
            config,
        }))
    }

    /// Spawns the receive loop.
    pub fn start(self: &Arc<Self>) {
        let transport = self.clone();
        tokio::spawn(async move {
            transport.receive_loop().await;
        });
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        if node == self.node {
            return;
        }
        if self.peers.insert(node.clone(), addr).is_none() {
            tracing::info!("Learned peer {} at {}", node, addr);
        }
    }

    pub fn remove_peer(&self, node: &NodeId) {
        self.peers.remove(node);
    }

    fn should_process(&self, key: ReceiptKey) -> bool {
        self.processed.first_sighting(key)
    }

    async fn send_datagram(&self, addr: SocketAddr, encoded: &[u8]) -> bool {
        match self.socket.send_to(encoded, addr).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to send datagram to {}: {}", addr, e);
                false
            }
        }
    }

    /// Sends to one address, waiting for a delivery receipt if required.
    async fn send_unicast(&self, target: &NodeId, addr: SocketAddr, message: &Message) -> bool {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", message.message_type(), e);
                return false;
            }
        };

        if encoded.len() > self.config.max_datagram_bytes {
            tracing::error!(
                "{:?} is {} bytes, larger than a datagram ({})",
                message.message_type(),
                encoded.len(),
                self.config.max_datagram_bytes
            );
            return false;
        }

        if !message.requires_ack {
            return self.send_datagram(addr, &encoded).await;
        }

        let key = (target.clone(), message.message_type(), message.sequence_id);
        let (tx, mut rx) = oneshot::channel();
        self.receipts.insert(key.clone(), tx);

        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let attempts = self.config.send_attempts.max(1);
        let mut delay_ms = 150u64;
        let mut delivered = false;

        for attempt in 0..attempts {
            self.send_datagram(addr, &encoded).await;

            if tokio::time::timeout(ack_timeout, &mut rx).await.is_ok() {
                delivered = true;
                break;
            }

            if attempt + 1 == attempts {
                break;
            }

            tracing::debug!(
                "No receipt for {:?} seq {} from {} (attempt {}), retrying",
                message.message_type(),
                message.sequence_id,
                target,
                attempt + 1
            );
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(1200);
        }

        self.receipts.remove(&key);
        if !delivered {
            tracing::warn!(
                "{:?} seq {} to {} undelivered after {} attempts",
                message.message_type(),
                message.sequence_id,
                target,
                attempts
            );
        }
        delivered
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match Message::decode(&buf[..len]) {
                    Ok(message) => self.handle_datagram(message, src).await,
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, message: Message, src: SocketAddr) {
        if !message.verify_checksum() {
            tracing::warn!(
                "Checksum mismatch on {:?} from {} ({}), dropping",
                message.message_type(),
                message.source_node,
                src
            );
            return;
        }

        self.add_peer(message.source_node.clone(), src);

        if let MessagePayload::Delivered { of } = &message.payload {
            let key = (message.source_node.clone(), *of, message.sequence_id);
            if let Some((_, tx)) = self.receipts.remove(&key) {
                let _ = tx.send(());
            }
            return;
        }

        if message.requires_ack {
            let receipt = message
                .reply(
                    self.node.clone(),
                    MessagePayload::Delivered {
                        of: message.message_type(),
                    },
                )
                .seal();
            if let Ok(encoded) = receipt.encode() {
                self.send_datagram(src, &encoded).await;
            }
        }

        let key = (
            message.source_node.clone(),
            message.message_type(),
            message.sequence_id,
        );
        if !self.should_process(key) {
            tracing::trace!(
                "Duplicate {:?} seq {} from {}",
                message.message_type(),
                message.sequence_id,
                message.source_node
            );
            return;
        }

        if !self.inbound.push(message) {
            tracing::error!("Inbound queue closed, dropping message");
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: Message) -> bool {
        let message = message.seal();

        match message.target_node.clone() {
            Some(target) => {
                let Some(addr) = self.peers.get(&target).map(|entry| *entry.value()) else {
                    tracing::warn!("No address known for {}", target);
                    return false;
                };
                self.send_unicast(&target, addr, &message).await
            }
            None => {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::error!("Failed to encode broadcast: {}", e);
                        return false;
                    }
                };

                let mut addrs: Vec<SocketAddr> =
                    self.peers.iter().map(|entry| *entry.value()).collect();
                for seed in &self.seeds {
                    if !addrs.contains(seed) {
                        addrs.push(*seed);
                    }
                }

                let mut all_sent = true;
                for addr in addrs {
                    if !self.send_datagram(addr, &encoded).await {
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
        let mut peers: Vec<NodeId> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        peers.sort();
        peers
    }

    fn forget_peer(&self, node: &NodeId) {
        self.remove_peer(node);
    }
}
