//! Transport Module
//!
//! Point-to-point and broadcast delivery between named nodes.
//!
//! ## Core Concepts
//! - **Envelope**: every message is a [`message::Message`] whose payload is a
//!   tagged union, so handlers match exhaustively on message kind.
//! - **Handlers**: subsystems register one async handler per [`message::MessageType`]
//!   on each endpoint; inbound messages are queued and dispatched by a
//!   background processing loop.
//! - **Implementations**: [`local::LocalNetwork`] wires endpoints together
//!   in-process (with fault injection), [`udp::UdpTransport`] speaks bincode
//!   over UDP with checksums, delivery receipts and retries.

pub mod local;
pub mod message;
pub mod udp;


use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::membership::types::NodeId;
use message::{Message, MessageType, Priority};

/// Type alias for a thread-safe, asynchronous message handler.
pub type MessageHandlerFn =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps an async closure into a [`MessageHandlerFn`].
pub fn handler<F, Fut>(f: F) -> MessageHandlerFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message: Message| {
        Box::pin(f(message)) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> &NodeId;

    /// Fresh id for messages that do not belong to a transaction.
    fn next_sequence_id(&self) -> u64;

    /// Returns `false` when the message could not be handed to the network
    /// (unknown or unreachable peer, encoding failure, no delivery receipt).
    async fn send(&self, message: Message) -> bool;

    fn register_handler(&self, kind: MessageType, handler: MessageHandlerFn);

    /// Peers this endpoint currently knows how to reach.
    fn peers(&self) -> Vec<NodeId>;

    /// Drops whatever the transport remembers about a departed peer.
    fn forget_peer(&self, _node: &NodeId) {}
}

/// Maps message types to the handler registered for them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, MessageHandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers (or replaces) the handler for `kind`.
    pub fn register(&self, kind: MessageType, handler: MessageHandlerFn) {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::debug!("Replaced handler for {:?}", kind);
        } else {
            tracing::debug!("Registered handler for {:?}", kind);
        }
    }

    /// Runs the handler registered for the message's type.
    ///
    /// # Returns
    /// `false` if nothing is registered for that type.
    pub async fn dispatch(&self, message: Message) -> bool {
        let kind = message.message_type();
        // Clone out of the map so the shard lock is not held across the await.
        let handler = self.handlers.get(&kind).map(|entry| entry.value().clone());

        match handler {
            Some(handler_fn) => {
                handler_fn(message).await;
                true
            }
            None => {
                tracing::warn!(
                    "No handler for {:?} from {}, dropping",
                    kind,
                    message.source_node
                );
                false
            }
        }
    }

    pub fn has_handler(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Producer side of an endpoint's two-level inbound queue.
#[derive(Clone)]
pub struct InboundQueue {
    high: mpsc::UnboundedSender<Message>,
    normal: mpsc::UnboundedSender<Message>,
}

impl InboundQueue {
    /// Creates the queue and spawns the loop that drains it into `handlers`.
    /// High-priority messages are always taken first.
    pub fn spawn(node: NodeId, handlers: Arc<HandlerRegistry>) -> Self {
        let (high, mut high_rx) = mpsc::unbounded_channel::<Message>();
        let (normal, mut normal_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    Some(message) = high_rx.recv() => message,
                    Some(message) = normal_rx.recv() => message,
                    else => break,
                };

                tracing::trace!(
                    "{} processing {:?} (seq {}) from {}",
                    node,
                    message.message_type(),
                    message.sequence_id,
                    message.source_node
                );

                // Handlers may themselves wait on replies that arrive through
                // this queue, so each runs on its own task.
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    handlers.dispatch(message).await;
                });
            }
            tracing::debug!("Inbound queue for {} closed", node);
        });

        Self { high, normal }
    }

    pub fn push(&self, message: Message) -> bool {
        let queue = if message.priority == Priority::High {
            &self.high
        } else {
            &self.normal
        };
        queue.send(message).is_ok()
    }
}
