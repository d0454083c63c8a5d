// Library entry point for tests and external usage

pub mod app;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod event_listener;
pub mod generation;
pub mod installer;
pub mod job_monitor;
pub mod lifecycle_monitor;
pub mod logger;
pub mod progress_hub;
pub mod recovery;
pub mod routes;
pub mod setup;
pub mod state_machine;
pub mod store;

// Re-export commonly used types
pub use app::AppState;
pub use config::OrchestratorConfig;
