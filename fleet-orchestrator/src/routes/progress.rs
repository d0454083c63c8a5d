use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use fleet_common::ProgressSnapshot;
use uuid::Uuid;

use crate::app::AppState;

pub fn create_progress_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/progress", get(list_progress))
        .route("/progress/{job_id}", get(get_progress).delete(clear_progress))
}

async fn list_progress(State(state): State<Arc<AppState>>) -> Json<Vec<ProgressSnapshot>> {
    Json(state.hub.all_progress().await)
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ProgressSnapshot>, StatusCode> {
    state
        .tracker
        .get_progress(job_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn clear_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Json<serde_json::Value> {
    let cleared = state.hub.clear_progress(job_id).await;
    Json(serde_json::json!({ "job_id": job_id, "cleared": cleared }))
}
