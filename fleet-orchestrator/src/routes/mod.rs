// Routes module - Centralizes all route definitions
pub mod instances;
pub mod jobs;
pub mod progress;
pub mod public;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use fleet_common::FleetError;

use crate::app::AppState;

/// Build the main application router
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(public::create_public_routes())
        .merge(progress::create_progress_routes())
        .merge(instances::create_instance_routes())
        .merge(jobs::create_job_routes())
}

/// Handler error: a `FleetError` rendered as `{ "error", "kind" }`.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::NotFound { .. } => StatusCode::NOT_FOUND,
            FleetError::Configuration(_) => StatusCode::CONFLICT,
            FleetError::RemoteRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
            FleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FleetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
