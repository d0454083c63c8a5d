use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_common::{
    EndpointDiscoveryResult, FleetError, Instance, InstancePatch, InstanceStatus,
    MonitoringStatus,
};
use serde::Deserialize;
use uuid::Uuid;

use super::ApiResult;
use crate::app::AppState;
use crate::logger::{self, Subject};

pub fn create_instance_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/instances", post(register_instance))
        .route("/instances/{id}", get(get_instance).patch(update_instance))
        .route(
            "/instances/{id}/monitoring",
            post(start_monitoring)
                .delete(stop_monitoring)
                .get(monitoring_status),
        )
        .route("/instances/{id}/discover", post(discover))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RegisterInstanceRequest {
    pub marketplace_id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port_hints: Vec<u32>,
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Start the lifecycle monitor right away.
    #[serde(default = "default_true")]
    pub monitor: bool,
}

async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterInstanceRequest>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let mut instance = Instance::new(&req.marketplace_id, req.host.as_deref(), req.port_hints);
    if let Some(status) = req.status {
        instance.status = status;
    }
    if let Some(metadata) = req.metadata {
        instance.metadata = metadata;
    }
    state.store.insert_instance(&instance).await?;
    logger::log_quick(
        state.store.as_ref(),
        "INSTANCE_REGISTERED",
        Subject::instance(instance.id),
        Some(serde_json::json!({ "marketplace_id": instance.marketplace_id })),
    )
    .await;

    if req.monitor {
        state.monitors.schedule_monitoring(instance.id, None).await?;
    }
    let stored = state
        .store
        .get_instance(instance.id)
        .await?
        .ok_or_else(|| FleetError::instance_not_found(instance.id))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    let instance = state
        .store
        .get_instance(id)
        .await?
        .ok_or_else(|| FleetError::instance_not_found(id))?;
    Ok(Json(instance))
}

/// Provider-side updates (status, address metadata).
#[derive(Debug, Deserialize)]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port_hints: Option<Vec<u32>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

async fn update_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateInstanceRequest>,
) -> ApiResult<Json<Instance>> {
    let patch = InstancePatch {
        status: req.status,
        host: req.host,
        port_hints: req.port_hints,
        metadata: req.metadata,
        ..Default::default()
    };
    if !state.store.update_instance(id, &patch).await? {
        return Err(FleetError::instance_not_found(id).into());
    }
    if patch.host.is_some() || patch.port_hints.is_some() || patch.status.is_some() {
        state.discovery.invalidate(id);
    }
    get_instance(State(state), Path(id)).await
}

#[derive(Debug, Default, Deserialize)]
pub struct MonitorQuery {
    pub correlation_id: Option<String>,
}

async fn start_monitoring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<MonitorQuery>,
) -> ApiResult<(StatusCode, Json<MonitoringStatus>)> {
    state
        .monitors
        .schedule_monitoring(id, q.correlation_id.as_deref())
        .await?;
    let status = state.monitors.get_monitoring_status(id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn stop_monitoring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let stopped = state.monitors.stop_monitoring(id).await?;
    Ok(Json(serde_json::json!({ "instance_id": id, "stopped": stopped })))
}

async fn monitoring_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MonitoringStatus>> {
    Ok(Json(state.monitors.get_monitoring_status(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscoverQuery {
    #[serde(default)]
    pub refresh: bool,
}

async fn discover(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<DiscoverQuery>,
) -> ApiResult<Json<EndpointDiscoveryResult>> {
    let instance = state
        .store
        .get_instance(id)
        .await?
        .ok_or_else(|| FleetError::instance_not_found(id))?;
    if q.refresh {
        state.discovery.invalidate(id);
    }
    Ok(Json(state.discovery.discover_endpoint(&instance).await?))
}
