use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_common::{FleetError, GenerationJob, GenerationParams, JobPatch};
use serde::Deserialize;
use uuid::Uuid;

use super::ApiResult;
use crate::app::AppState;

pub fn create_job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/submit", post(submit_job))
        .route("/jobs/{id}/track", post(track_job))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub instance_id: Uuid,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
    /// Submit to the instance immediately.
    #[serde(default = "default_true")]
    pub submit: bool,
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<GenerationJob>)> {
    let job = state
        .generation
        .create_job(req.instance_id, req.workflow_id, req.params)
        .await?;
    if !req.submit {
        return Ok((StatusCode::CREATED, Json(job)));
    }
    let job = state.generation.submit_generation(job.id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<GenerationJob>> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| FleetError::job_not_found(id))?;
    Ok(Json(job))
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<GenerationJob>> {
    Ok(Json(state.generation.submit_generation(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrackQuery {
    pub correlation_id: Option<String>,
}

async fn track_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<TrackQuery>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| FleetError::job_not_found(id))?;
    let correlation_id = q
        .correlation_id
        .or(job.correlation_id.clone())
        .ok_or_else(|| {
            FleetError::Configuration(format!("job {} has no correlation id to track", id))
        })?;
    if job.correlation_id.as_deref() != Some(correlation_id.as_str()) {
        let patch = JobPatch {
            correlation_id: Some(correlation_id.clone()),
            ..Default::default()
        };
        state.store.update_job(id, &patch).await?;
    }
    state
        .tracker
        .start_tracking(id, job.instance_id, &correlation_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "job_id": id,
            "correlation_id": correlation_id,
            "tracking": true,
        })),
    ))
}
