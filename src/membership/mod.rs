//! Membership & Discovery Module
//!
//! Keeps the list of cluster participants the transport and the dispatcher
//! work against.
//!
//! ## Core Mechanisms
//! - **Announce**: a node broadcasts NODE_ANNOUNCE (address and devices) on
//!   start and every discovery interval. A node seeing an announcer for the
//!   first time answers with its own announcement.
//! - **Heartbeat**: broadcast every heartbeat interval; refreshes the
//!   sender's `last_heartbeat`.
//! - **Failure Detection**: a member silent for longer than the node timeout
//!   is marked `Inactive`, then removed on the following sweep. LEAVE removes
//!   a member at once.
//! - **Events**: joins and departures are published as [`types::MembershipEvent`]
//!   so the engine can drop a departed node's lines and the dispatcher can
//!   push its kernel catalog to a newcomer.

pub mod service;
pub mod types;


pub use service::MembershipService;
pub use types::{DeviceInfo, MembershipEvent, Node, NodeId, NodeStatus};
