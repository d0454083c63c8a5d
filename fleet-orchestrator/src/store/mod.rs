use async_trait::async_trait;
use fleet_common::error::Result;
use fleet_common::{
    AuditEntry, GenerationJob, Instance, InstancePatch, InstanceStatus, JobPatch, JobStatus,
    SchedulerState, SetupStatus,
};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistent records consumed by the monitors.
///
/// Status columns are only written through the conditional `transition_*`
/// methods, which return `Ok(false)` when the record was not in `from`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_instance(&self, instance: &Instance) -> Result<()>;
    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>>;
    /// `Ok(false)` if the instance does not exist.
    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<bool>;
    async fn transition_setup_status(
        &self,
        id: Uuid,
        from: SetupStatus,
        to: SetupStatus,
    ) -> Result<bool>;
    async fn transition_instance_status(
        &self,
        id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool>;
    /// Writes `next` only while the stored scheduler bookkeeping still equals
    /// `expected`.
    async fn swap_scheduler(
        &self,
        id: Uuid,
        expected: &SchedulerState,
        next: &SchedulerState,
    ) -> Result<bool>;
    /// Instances whose scheduler flag is still set.
    async fn list_monitored_instances(&self) -> Result<Vec<Instance>>;
    async fn list_instances_by_setup_status(&self, status: SetupStatus) -> Result<Vec<Instance>>;

    async fn insert_job(&self, job: &GenerationJob) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>>;
    async fn update_job(&self, id: Uuid, patch: &JobPatch) -> Result<bool>;
    /// Sets the correlation id only if the job has none yet.
    async fn claim_correlation_id(&self, id: Uuid, correlation_id: &str) -> Result<bool>;
    async fn transition_job_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool>;
    /// Non-terminal jobs that already have a correlation id.
    async fn list_inflight_jobs(&self) -> Result<Vec<GenerationJob>>;

    async fn create_audit_entry(&self, entry: &AuditEntry) -> Result<()>;
    async fn complete_audit_entry(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;
    async fn list_audit_entries(
        &self,
        instance_id: Option<Uuid>,
        job_id: Option<Uuid>,
    ) -> Result<Vec<AuditEntry>>;
}
