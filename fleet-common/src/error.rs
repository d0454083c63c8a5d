use uuid::Uuid;

/// Failure taxonomy shared by every orchestrator component.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Probe/poll/submit failure that may succeed on retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Attempt budget exhausted without a terminal signal.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Well-formed rejection from the remote service. Never retried.
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// Missing credentials or malformed address metadata, detected before any network attempt.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("store error: {0}")]
    Store(String),
}

impl FleetError {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::TransientNetwork(_) => "transient_network",
            FleetError::Timeout(_) => "timeout",
            FleetError::RemoteRejected(_) => "remote_rejected",
            FleetError::Configuration(_) => "configuration",
            FleetError::NotFound { .. } => "not_found",
            FleetError::Store(_) => "store",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::TransientNetwork(_) | FleetError::Store(_))
    }

    pub fn instance_not_found(id: Uuid) -> Self {
        FleetError::NotFound {
            entity: "instance",
            id,
        }
    }

    pub fn job_not_found(id: Uuid) -> Self {
        FleetError::NotFound { entity: "job", id }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
