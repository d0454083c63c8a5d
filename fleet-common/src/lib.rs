use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod endpoint;
pub mod error;

pub use error::FleetError;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Available,   // Offer listed on the marketplace
    Launching,   // Lease requested, machine not reachable yet
    Running,     // Machine up, service may or may not be installed
    Configuring, // Installer is working on the machine
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Available => "available",
            InstanceStatus::Launching => "launching",
            InstanceStatus::Running => "running",
            InstanceStatus::Configuring => "configuring",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Some(InstanceStatus::Available),
            "launching" => Some(InstanceStatus::Launching),
            "running" => Some(InstanceStatus::Running),
            "configuring" => Some(InstanceStatus::Configuring),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "error" => Some(InstanceStatus::Error),
            _ => None,
        }
    }
}

/// Installation state of the generation service on an instance.
///
/// Only moves forward: `pending -> installing -> {ready | failed | demo-ready}`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Pending,
    Installing,
    Ready,
    Failed,
    #[serde(rename = "demo-ready")]
    DemoReady,
}

impl SetupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStatus::Pending => "pending",
            SetupStatus::Installing => "installing",
            SetupStatus::Ready => "ready",
            SetupStatus::Failed => "failed",
            SetupStatus::DemoReady => "demo-ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(SetupStatus::Pending),
            "installing" => Some(SetupStatus::Installing),
            "ready" => Some(SetupStatus::Ready),
            "failed" => Some(SetupStatus::Failed),
            "demo-ready" | "demo_ready" => Some(SetupStatus::DemoReady),
            _ => None,
        }
    }

    /// Service usable (real or demo install).
    pub fn is_ready(&self) -> bool {
        matches!(self, SetupStatus::Ready | SetupStatus::DemoReady)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SetupStatus::Ready | SetupStatus::Failed | SetupStatus::DemoReady
        )
    }

    pub fn can_transition_to(&self, next: SetupStatus) -> bool {
        matches!(
            (self, next),
            (SetupStatus::Pending, SetupStatus::Installing)
                | (SetupStatus::Installing, SetupStatus::Ready)
                | (SetupStatus::Installing, SetupStatus::Failed)
                | (SetupStatus::Installing, SetupStatus::DemoReady)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Executing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "executing" => Some(JobStatus::Executing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only: nothing goes back to `queued`, nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Executing)
                | (JobStatus::Queued, JobStatus::Completed)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Executing, JobStatus::Completed)
                | (JobStatus::Executing, JobStatus::Failed)
        )
    }
}

// --- Entities ---

/// Scheduler bookkeeping persisted on the instance record.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SchedulerState {
    pub active: bool,
    pub checks_performed: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Instance {
    pub id: Uuid,
    pub marketplace_id: String,
    pub host: Option<String>,
    /// Marketplace port hints, primary (assigned) port first.
    pub port_hints: Vec<u32>,

    pub status: InstanceStatus,
    pub setup_status: SetupStatus,
    pub scheduler: SchedulerState,

    pub metadata: serde_json::Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(marketplace_id: &str, host: Option<&str>, port_hints: Vec<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            marketplace_id: marketplace_id.to_string(),
            host: host.map(|h| h.to_string()),
            port_hints,
            status: InstanceStatus::Launching,
            setup_status: SetupStatus::Pending,
            scheduler: SchedulerState::default(),
            metadata: serde_json::json!({}),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn primary_port(&self) -> Option<u32> {
        self.port_hints.first().copied()
    }

    /// SSH port advertised by the marketplace (`metadata.ssh_port`), 22 otherwise.
    pub fn ssh_port(&self) -> u16 {
        self.metadata
            .get("ssh_port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .unwrap_or(22)
    }
}

/// Partial update applied atomically by the store.
///
/// `setup_status` is deliberately absent: it only changes through
/// conditional transitions.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub host: Option<String>,
    pub port_hints: Option<Vec<u32>>,
    pub scheduler: Option<SchedulerState>,
    pub metadata: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl InstancePatch {
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerState) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.host.is_none()
            && self.port_hints.is_none()
            && self.scheduler.is_none()
            && self.metadata.is_none()
            && self.last_error.is_none()
    }

    pub fn apply(&self, instance: &mut Instance) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(host) = &self.host {
            instance.host = Some(host.clone());
        }
        if let Some(hints) = &self.port_hints {
            instance.port_hints = hints.clone();
        }
        if let Some(scheduler) = &self.scheduler {
            instance.scheduler = scheduler.clone();
        }
        if let Some(metadata) = &self.metadata {
            instance.metadata = metadata.clone();
        }
        if let Some(err) = &self.last_error {
            instance.last_error = Some(err.clone());
        }
        instance.updated_at = Utc::now();
    }
}

/// User-facing generation inputs.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub cfg: Option<f32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// Explicit node graph; `{{prompt}}`-style placeholders are substituted.
    #[serde(default)]
    pub workflow: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub workflow_id: Option<String>,
    pub params: GenerationParams,
    pub status: JobStatus,
    pub correlation_id: Option<String>,
    pub image_urls: Vec<String>,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn new(instance_id: Uuid, workflow_id: Option<String>, params: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            workflow_id,
            params,
            status: JobStatus::Queued,
            correlation_id: None,
            image_urls: Vec::new(),
            error_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct JobPatch {
    pub correlation_id: Option<String>,
    pub image_urls: Option<Vec<String>>,
    pub error_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn apply(&self, job: &mut GenerationJob) {
        if let Some(cid) = &self.correlation_id {
            job.correlation_id = Some(cid.clone());
        }
        if let Some(urls) = &self.image_urls {
            job.image_urls = urls.clone();
        }
        if let Some(reason) = &self.error_reason {
            job.error_reason = Some(reason.clone());
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
    }
}

/// Latest known state of a job, kept in memory for live push.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub instance_id: Uuid,
    pub status: JobStatus,
    pub stage: String,
    pub current_node: Option<String>,
    /// 0.0..=1.0
    pub fraction: f32,
    pub completed_nodes: u32,
    pub total_nodes: u32,
    pub attempts: u32,
    pub message: Option<String>,
    pub last_error: Option<String>,
    pub image_urls: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn queued(job_id: Uuid, instance_id: Uuid, total_nodes: u32) -> Self {
        Self {
            job_id,
            instance_id,
            status: JobStatus::Queued,
            stage: "queued".to_string(),
            current_node: None,
            fraction: 0.0,
            completed_nodes: 0,
            total_nodes,
            attempts: 0,
            message: None,
            last_error: None,
            image_urls: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn percent(&self) -> u8 {
        (self.fraction.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndpointDiscoveryResult {
    pub instance_id: Uuid,
    pub attempted_urls: Vec<String>,
    pub resolved_url: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl EndpointDiscoveryResult {
    pub fn is_found(&self) -> bool {
        self.resolved_url.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MonitoringStatus {
    pub instance_id: Uuid,
    pub active: bool,
    pub checks_performed: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
}

/// One row of the action/audit log.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action_type: String,
    pub status: String,
    pub instance_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub duration_ms: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AuditEntry {
    pub fn new(action_type: &str, status: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: action_type.to_string(),
            status: status.to_string(),
            instance_id: None,
            job_id: None,
            error_message: None,
            metadata: None,
            duration_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
