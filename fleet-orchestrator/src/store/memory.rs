use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::error::Result;
use fleet_common::{
    AuditEntry, GenerationJob, Instance, InstancePatch, InstanceStatus, JobPatch, JobStatus,
    SchedulerState, SetupStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordStore;

/// In-process store used when no `DATABASE_URL` is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<Uuid, Instance>>,
    jobs: RwLock<HashMap<Uuid, GenerationJob>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove_job(&self, id: Uuid) -> bool {
        self.jobs.write().await.remove(&id).is_some()
    }

    pub async fn remove_instance(&self, id: Uuid) -> bool {
        self.instances.write().await.remove(&id).is_some()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<bool> {
        let mut map = self.instances.write().await;
        let Some(inst) = map.get_mut(&id) else {
            return Ok(false);
        };
        patch.apply(inst);
        Ok(true)
    }

    async fn transition_setup_status(
        &self,
        id: Uuid,
        from: SetupStatus,
        to: SetupStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let mut map = self.instances.write().await;
        match map.get_mut(&id) {
            Some(inst) if inst.setup_status == from => {
                inst.setup_status = to;
                inst.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_instance_status(
        &self,
        id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        let mut map = self.instances.write().await;
        match map.get_mut(&id) {
            Some(inst) if inst.status == from => {
                inst.status = to;
                inst.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn swap_scheduler(
        &self,
        id: Uuid,
        expected: &SchedulerState,
        next: &SchedulerState,
    ) -> Result<bool> {
        let mut map = self.instances.write().await;
        match map.get_mut(&id) {
            Some(inst) if inst.scheduler == *expected => {
                inst.scheduler = next.clone();
                inst.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_instances_by_setup_status(&self, status: SetupStatus) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.setup_status == status)
            .cloned()
            .collect())
    }

    async fn list_monitored_instances(&self) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.scheduler.active)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &GenerationJob) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(&self, id: Uuid, patch: &JobPatch) -> Result<bool> {
        let mut map = self.jobs.write().await;
        let Some(job) = map.get_mut(&id) else {
            return Ok(false);
        };
        patch.apply(job);
        Ok(true)
    }

    async fn claim_correlation_id(&self, id: Uuid, correlation_id: &str) -> Result<bool> {
        let mut map = self.jobs.write().await;
        match map.get_mut(&id) {
            Some(job) if job.correlation_id.is_none() => {
                job.correlation_id = Some(correlation_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_job_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let mut map = self.jobs.write().await;
        match map.get_mut(&id) {
            Some(job) if job.status == from => {
                job.status = to;
                patch.apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_inflight_jobs(&self) -> Result<Vec<GenerationJob>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| !j.status.is_terminal() && j.correlation_id.is_some())
            .cloned()
            .collect())
    }

    async fn create_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn complete_audit_entry(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut entries = self.audit.write().await;
        if let Some(e) = entries.iter_mut().find(|e| e.id == id) {
            e.status = status.to_string();
            e.duration_ms = Some(duration_ms);
            e.error_message = error_message.map(|s| s.to_string());
            if metadata.is_some() {
                e.metadata = metadata;
            }
            e.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        instance_id: Option<Uuid>,
        job_id: Option<Uuid>,
    ) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|e| instance_id.is_none() || e.instance_id == instance_id)
            .filter(|e| job_id.is_none() || e.job_id == job_id)
            .cloned()
            .collect())
    }
}
