// Common test utilities and fixtures
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleet_common::error::Result;
use fleet_common::{
    AuditEntry, FleetError, GenerationJob, GenerationParams, Instance, InstancePatch,
    InstanceStatus, JobPatch, JobStatus, SchedulerState, SetupStatus,
};
use fleet_orchestrator::installer::InstallationExecutor;
use fleet_orchestrator::progress_hub::ProgressHub;
use fleet_orchestrator::store::{MemoryStore, RecordStore};
use fleet_orchestrator::{AppState, OrchestratorConfig};
use fleet_remote::mock::MockRemote;
use fleet_remote::HistoryEntry;
use uuid::Uuid;

/// Setup executor that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<Uuid>>,
    pub fail: AtomicBool,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstallationExecutor for RecordingExecutor {
    async fn trigger_installation(&self, instance: &Instance) -> Result<String> {
        self.calls.lock().unwrap().push(instance.id);
        if self.fail.load(Ordering::SeqCst) {
            return Err(FleetError::Configuration("ssh key missing".into()));
        }
        Ok(format!("rec-{}", instance.id))
    }
}

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<MockRemote>,
    pub executor: Arc<RecordingExecutor>,
    pub state: Arc<AppState>,
}

/// Production defaults, minus the event channel (polling only).
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        remote_events: false,
        ..Default::default()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let executor = Arc::new(RecordingExecutor::default());
        let hub = Arc::new(ProgressHub::new(config.hub_client_buffer));
        let state = AppState::assemble(
            config,
            store.clone(),
            remote.clone(),
            hub,
            executor.clone(),
        );
        Self {
            store,
            remote,
            executor,
            state,
        }
    }

    pub async fn add_instance(
        &self,
        host: Option<&str>,
        hints: Vec<u32>,
        status: InstanceStatus,
    ) -> Instance {
        let mut instance = Instance::new("mkt-1", host, hints);
        instance.status = status;
        self.store.insert_instance(&instance).await.unwrap();
        instance
    }

    /// Running instance whose service answers on `http://10.0.0.5:8188`.
    pub async fn healthy_instance(&self) -> Instance {
        self.remote.set_healthy("http://10.0.0.5:8188");
        self.add_instance(Some("10.0.0.5"), vec![8188], InstanceStatus::Running)
            .await
    }

    pub async fn add_job(&self, instance_id: Uuid, correlation_id: Option<&str>) -> GenerationJob {
        let mut job = GenerationJob::new(
            instance_id,
            None,
            GenerationParams {
                prompt: "a lighthouse at dusk".into(),
                ..Default::default()
            },
        );
        job.correlation_id = correlation_id.map(|c| c.to_string());
        self.store.insert_job(&job).await.unwrap();
        job
    }

    pub async fn instance(&self, id: Uuid) -> Instance {
        self.store.get_instance(id).await.unwrap().unwrap()
    }

    pub async fn job(&self, id: Uuid) -> GenerationJob {
        self.store.get_job(id).await.unwrap().unwrap()
    }

    pub async fn audit(&self, action_type: &str) -> Vec<AuditEntry> {
        self.store
            .list_audit_entries(None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action_type == action_type)
            .collect()
    }
}

/// History entry with `images` SaveImage outputs on node 9.
pub fn history_with_images(images: usize) -> HistoryEntry {
    let items: Vec<serde_json::Value> = (0..images)
        .map(|i| {
            serde_json::json!({
                "filename": format!("fleet_{:05}_.png", i + 1),
                "subfolder": "",
                "type": "output",
            })
        })
        .collect();
    serde_json::from_value(serde_json::json!({
        "outputs": { "9": { "images": items } },
        "status": { "status_str": "success", "completed": true, "messages": [] },
    }))
    .unwrap()
}

pub fn history_with_error(node: &str, message: &str) -> HistoryEntry {
    serde_json::from_value(serde_json::json!({
        "outputs": {},
        "status": {
            "status_str": "error",
            "completed": false,
            "messages": [
                ["execution_start", { "prompt_id": "p" }],
                ["execution_error", { "node_id": node, "exception_message": message }],
            ],
        },
    }))
    .unwrap()
}

/// Memory store whose next `get_instance` stalls after reading, so a check
/// can be caught between its read and its write.
pub struct StallingStore {
    pub inner: Arc<MemoryStore>,
    stall: Mutex<Option<std::time::Duration>>,
}

impl StallingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            stall: Mutex::new(None),
        }
    }

    pub fn stall_next_read(&self, delay: std::time::Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl RecordStore for StallingStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        self.inner.insert_instance(instance).await
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        let read = self.inner.get_instance(id).await;
        let delay = self.stall.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        read
    }

    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<bool> {
        self.inner.update_instance(id, patch).await
    }

    async fn transition_setup_status(
        &self,
        id: Uuid,
        from: SetupStatus,
        to: SetupStatus,
    ) -> Result<bool> {
        self.inner.transition_setup_status(id, from, to).await
    }

    async fn transition_instance_status(
        &self,
        id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        self.inner.transition_instance_status(id, from, to).await
    }

    async fn swap_scheduler(
        &self,
        id: Uuid,
        expected: &SchedulerState,
        next: &SchedulerState,
    ) -> Result<bool> {
        self.inner.swap_scheduler(id, expected, next).await
    }

    async fn list_monitored_instances(&self) -> Result<Vec<Instance>> {
        self.inner.list_monitored_instances().await
    }

    async fn list_instances_by_setup_status(&self, status: SetupStatus) -> Result<Vec<Instance>> {
        self.inner.list_instances_by_setup_status(status).await
    }

    async fn insert_job(&self, job: &GenerationJob) -> Result<()> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        self.inner.get_job(id).await
    }

    async fn update_job(&self, id: Uuid, patch: &JobPatch) -> Result<bool> {
        self.inner.update_job(id, patch).await
    }

    async fn claim_correlation_id(&self, id: Uuid, correlation_id: &str) -> Result<bool> {
        self.inner.claim_correlation_id(id, correlation_id).await
    }

    async fn transition_job_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool> {
        self.inner.transition_job_status(id, from, to, patch).await
    }

    async fn list_inflight_jobs(&self) -> Result<Vec<GenerationJob>> {
        self.inner.list_inflight_jobs().await
    }

    async fn create_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.inner.create_audit_entry(entry).await
    }

    async fn complete_audit_entry(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.inner
            .complete_audit_entry(id, status, duration_ms, error_message, metadata)
            .await
    }

    async fn list_audit_entries(
        &self,
        instance_id: Option<Uuid>,
        job_id: Option<Uuid>,
    ) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit_entries(instance_id, job_id).await
    }
}
