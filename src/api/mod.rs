//! HTTP API Module
//!
//! The node's introspection and control surface, served with axum. Memory
//! operations act on behalf of the local node; everything else reads the
//! state of the subsystems handed to [`router`].
//!
//! ## Routes
//! - `GET /stats`, `GET /coherency/verify`, `GET /members`
//! - `POST /memory/read`, `POST /memory/write`, `POST /memory/evict`,
//!   `POST /memory/migrate`, `GET /memory/pages`
//! - `POST /kernels`, `POST /kernels/execute`, `GET /kernels/:id`,
//!   `GET /tasks/:id`

pub mod handlers;
pub mod protocol;


use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;

use crate::coherency::engine::ClusterCoherencyEngine;
use crate::dispatcher::dispatcher::KernelDispatcher;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::migration::manager::PageMigrationManager;
use handlers::*;

/// The node the HTTP caller acts as.
#[derive(Debug, Clone)]
pub struct LocalNode(pub NodeId);

pub fn router(
    local: NodeId,
    engine: Arc<ClusterCoherencyEngine>,
    migration: Arc<PageMigrationManager>,
    dispatcher: Arc<KernelDispatcher>,
    membership: Arc<MembershipService>,
) -> Router {
    Router::new()
        .route("/stats", get(handle_stats))
        .route("/coherency/verify", get(handle_verify))
        .route("/members", get(handle_members))
        .route("/memory/read", post(handle_memory_read))
        .route("/memory/write", post(handle_memory_write))
        .route("/memory/evict", post(handle_memory_evict))
        .route("/memory/migrate", post(handle_memory_migrate))
        .route("/memory/pages", get(handle_memory_pages))
        .route("/kernels", post(handle_register_kernel))
        .route("/kernels/execute", post(handle_execute_kernel))
        .route("/kernels/:id", get(handle_get_kernel))
        .route("/tasks/:id", get(handle_get_task))
        .layer(Extension(LocalNode(local)))
        .layer(Extension(engine))
        .layer(Extension(migration))
        .layer(Extension(dispatcher))
        .layer(Extension(membership))
}
