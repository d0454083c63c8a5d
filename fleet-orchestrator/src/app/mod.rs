pub mod state;

pub use state::AppState;

use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};

/// Dashboards on any origin may read progress and drive monitors.
pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}
