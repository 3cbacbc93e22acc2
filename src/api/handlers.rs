use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
};
use std::sync::Arc;

use super::LocalNode;
use super::protocol::*;
use crate::coherency::engine::ClusterCoherencyEngine;
use crate::dispatcher::dispatcher::KernelDispatcher;
use crate::dispatcher::types::{KernelId, KernelStatus, KernelTask, TaskId};
use crate::error::{CoherencyError, DispatchError, MigrationError};
use crate::membership::service::MembershipService;
use crate::migration::manager::PageMigrationManager;

fn coherency_status(error: &CoherencyError) -> StatusCode {
    match error {
        CoherencyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoherencyError::Unreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoherencyError::Rejected { .. } | CoherencyError::Busy { .. } => StatusCode::CONFLICT,
        CoherencyError::UnknownNode(_) => StatusCode::NOT_FOUND,
        CoherencyError::Backing(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn migration_status(error: &MigrationError) -> StatusCode {
    match error {
        MigrationError::NotOwner { .. } | MigrationError::Rejected { .. } => StatusCode::CONFLICT,
        MigrationError::SameNode(_) => StatusCode::BAD_REQUEST,
        MigrationError::TargetUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MigrationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        MigrationError::Coherency(inner) => coherency_status(inner),
    }
}

fn dispatch_status(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::UnknownKernel(_) | DispatchError::UnknownTask(_) => StatusCode::NOT_FOUND,
        DispatchError::NoTargets => StatusCode::BAD_REQUEST,
        DispatchError::KernelNotReady(_) => StatusCode::CONFLICT,
    }
}

// --- Introspection ---

pub async fn handle_stats(
    Extension(local): Extension<LocalNode>,
    Extension(engine): Extension<Arc<ClusterCoherencyEngine>>,
    Extension(membership): Extension<Arc<MembershipService>>,
    Extension(dispatcher): Extension<Arc<KernelDispatcher>>,
    Extension(migration): Extension<Arc<PageMigrationManager>>,
) -> Json<StatsResponse> {
    Json(StatsResponse {
        node: local.0,
        coherency: engine.stats(),
        members: membership.active_members().len(),
        kernels: dispatcher.kernels().len(),
        tasks: dispatcher.tasks().len(),
        tracked_pages: migration.pages().len(),
    })
}

pub async fn handle_verify(
    Extension(engine): Extension<Arc<ClusterCoherencyEngine>>,
) -> Json<VerifyResponse> {
    let violations = engine.verify();
    if !violations.is_empty() {
        tracing::warn!("Coherency check found {} violations", violations.len());
    }

    Json(VerifyResponse {
        consistent: violations.is_empty(),
        violations,
    })
}

pub async fn handle_members(
    Extension(membership): Extension<Arc<MembershipService>>,
) -> Json<MembersResponse> {
    Json(MembersResponse {
        local: membership.local_id().clone(),
        members: membership.members(),
    })
}

// --- Memory ---

pub async fn handle_memory_read(
    Extension(local): Extension<LocalNode>,
    Extension(engine): Extension<Arc<ClusterCoherencyEngine>>,
    Extension(migration): Extension<Arc<PageMigrationManager>>,
    Json(req): Json<MemoryReadRequest>,
) -> (StatusCode, Json<MemoryReadResponse>) {
    match engine.read(&local.0, req.address, req.size).await {
        Ok(data) => {
            migration.record_access(&local.0, req.address);
            (
                StatusCode::OK,
                Json(MemoryReadResponse {
                    data: Some(data),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Read of {:#x} failed: {}", req.address, e);
            (
                coherency_status(&e),
                Json(MemoryReadResponse {
                    data: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_memory_write(
    Extension(local): Extension<LocalNode>,
    Extension(engine): Extension<Arc<ClusterCoherencyEngine>>,
    Extension(migration): Extension<Arc<PageMigrationManager>>,
    Json(req): Json<MemoryWriteRequest>,
) -> (StatusCode, Json<OperationResponse>) {
    match engine.write(&local.0, req.address, &req.data).await {
        Ok(()) => {
            migration.record_access(&local.0, req.address);
            (StatusCode::OK, Json(OperationResponse::ok()))
        }
        Err(e) => {
            tracing::error!("Write of {:#x} failed: {}", req.address, e);
            (coherency_status(&e), Json(OperationResponse::failed(e)))
        }
    }
}

pub async fn handle_memory_evict(
    Extension(local): Extension<LocalNode>,
    Extension(engine): Extension<Arc<ClusterCoherencyEngine>>,
    Json(req): Json<MemoryEvictRequest>,
) -> (StatusCode, Json<OperationResponse>) {
    match engine.evict_cache_line(&local.0, req.address).await {
        Ok(()) => (StatusCode::OK, Json(OperationResponse::ok())),
        Err(e) => {
            tracing::error!("Eviction of {:#x} failed: {}", req.address, e);
            (coherency_status(&e), Json(OperationResponse::failed(e)))
        }
    }
}

pub async fn handle_memory_migrate(
    Extension(local): Extension<LocalNode>,
    Extension(migration): Extension<Arc<PageMigrationManager>>,
    Json(req): Json<MemoryMigrateRequest>,
) -> (StatusCode, Json<OperationResponse>) {
    match migration
        .migrate_page(&local.0, req.address, &req.target)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(OperationResponse::ok())),
        Err(e) => {
            tracing::error!("Migration of {:#x} to {} failed: {}", req.address, req.target, e);
            (migration_status(&e), Json(OperationResponse::failed(e)))
        }
    }
}

pub async fn handle_memory_pages(
    Extension(migration): Extension<Arc<PageMigrationManager>>,
    Query(query): Query<CandidatesQuery>,
) -> Json<PagesResponse> {
    Json(PagesResponse {
        pages: migration.pages(),
        candidates: migration.migration_candidates(query.min_remote),
    })
}

// --- Kernels ---

pub async fn handle_register_kernel(
    Extension(dispatcher): Extension<Arc<KernelDispatcher>>,
    Json(req): Json<RegisterKernelRequest>,
) -> (StatusCode, Json<RegisterKernelResponse>) {
    match dispatcher
        .register_kernel(&req.name, &req.source, &req.language, &req.entry_point)
        .await
    {
        Ok(kernel_id) => {
            tracing::info!("Kernel {} registered as {}", req.name, kernel_id);
            (
                StatusCode::OK,
                Json(RegisterKernelResponse {
                    kernel_id: Some(kernel_id),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to register kernel {}: {}", req.name, e);
            (
                dispatch_status(&e),
                Json(RegisterKernelResponse {
                    kernel_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_execute_kernel(
    Extension(dispatcher): Extension<Arc<KernelDispatcher>>,
    Json(req): Json<ExecuteKernelRequest>,
) -> (StatusCode, Json<ExecuteKernelResponse>) {
    let task_id = match dispatcher.execute_kernel(&req.kernel_id, req.targets, req.input, req.launch)
    {
        Ok(task_id) => task_id,
        Err(e) => {
            tracing::error!("Failed to execute kernel {}: {}", req.kernel_id, e);
            return (
                dispatch_status(&e),
                Json(ExecuteKernelResponse {
                    task_id: None,
                    task: None,
                    error: Some(e.to_string()),
                }),
            );
        }
    };

    let task = if req.wait {
        dispatcher.await_task(&task_id).await.ok()
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(ExecuteKernelResponse {
            task_id: Some(task_id),
            task,
            error: None,
        }),
    )
}

pub async fn handle_get_kernel(
    Extension(dispatcher): Extension<Arc<KernelDispatcher>>,
    Path(kernel_id): Path<String>,
) -> (StatusCode, Json<Option<KernelStatus>>) {
    match dispatcher.kernel_status(&KernelId(kernel_id)) {
        Ok(status) => (StatusCode::OK, Json(Some(status))),
        Err(e) => {
            tracing::debug!("Kernel query failed: {}", e);
            (dispatch_status(&e), Json(None))
        }
    }
}

pub async fn handle_get_task(
    Extension(dispatcher): Extension<Arc<KernelDispatcher>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Option<KernelTask>>) {
    match dispatcher.task(&TaskId(task_id)) {
        Ok(task) => {
            tracing::debug!("Task status query: {} -> {:?}", task.id, task.status);
            (StatusCode::OK, Json(Some(task)))
        }
        Err(e) => {
            tracing::debug!("Task query failed: {}", e);
            (dispatch_status(&e), Json(None))
        }
    }
}
