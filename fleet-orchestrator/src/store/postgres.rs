use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::error::Result;
use fleet_common::{
    AuditEntry, FleetError, GenerationJob, GenerationParams, Instance, InstancePatch,
    InstanceStatus, JobPatch, JobStatus, SchedulerState, SetupStatus,
};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::RecordStore;

/// Postgres-backed store. Uses `query()` / `query_as()` so no DATABASE_URL is needed at build time.
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }
}

fn store_err(e: sqlx::Error) -> FleetError {
    FleetError::Store(e.to_string())
}

fn hints_to_db(hints: &[u32]) -> Vec<i32> {
    hints
        .iter()
        .filter_map(|p| i32::try_from(*p).ok())
        .collect()
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    marketplace_id: String,
    host: Option<String>,
    port_hints: Vec<i32>,
    status: String,
    setup_status: String,
    scheduler_active: bool,
    checks_performed: i32,
    scheduler_started_at: Option<DateTime<Utc>>,
    last_check_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = FleetError;

    fn try_from(r: InstanceRow) -> Result<Self> {
        let status = InstanceStatus::parse(&r.status)
            .ok_or_else(|| FleetError::Store(format!("unknown instance status '{}'", r.status)))?;
        let setup_status = SetupStatus::parse(&r.setup_status).ok_or_else(|| {
            FleetError::Store(format!("unknown setup status '{}'", r.setup_status))
        })?;
        Ok(Instance {
            id: r.id,
            marketplace_id: r.marketplace_id,
            host: r.host,
            port_hints: r
                .port_hints
                .into_iter()
                .filter_map(|p| u32::try_from(p).ok())
                .collect(),
            status,
            setup_status,
            scheduler: SchedulerState {
                active: r.scheduler_active,
                checks_performed: u32::try_from(r.checks_performed).unwrap_or(0),
                started_at: r.scheduler_started_at,
                last_check_at: r.last_check_at,
            },
            metadata: r.metadata,
            last_error: r.last_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    instance_id: Uuid,
    workflow_id: Option<String>,
    params: serde_json::Value,
    status: String,
    correlation_id: Option<String>,
    image_urls: serde_json::Value,
    error_reason: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = FleetError;

    fn try_from(r: JobRow) -> Result<Self> {
        let status = JobStatus::parse(&r.status)
            .ok_or_else(|| FleetError::Store(format!("unknown job status '{}'", r.status)))?;
        let params: GenerationParams = serde_json::from_value(r.params)
            .map_err(|e| FleetError::Store(format!("bad job params: {}", e)))?;
        let image_urls: Vec<String> = serde_json::from_value(r.image_urls).unwrap_or_default();
        Ok(GenerationJob {
            id: r.id,
            instance_id: r.instance_id,
            workflow_id: r.workflow_id,
            params,
            status,
            correlation_id: r.correlation_id,
            image_urls,
            error_reason: r.error_reason,
            created_at: r.created_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    action_type: String,
    status: String,
    instance_id: Option<Uuid>,
    job_id: Option<Uuid>,
    error_message: Option<String>,
    metadata: Option<serde_json::Value>,
    duration_ms: Option<i32>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<AuditRow> for AuditEntry {
    fn from(r: AuditRow) -> Self {
        AuditEntry {
            id: r.id,
            action_type: r.action_type,
            status: r.status,
            instance_id: r.instance_id,
            job_id: r.job_id,
            error_message: r.error_message,
            metadata: r.metadata,
            duration_ms: r.duration_ms,
            created_at: r.created_at,
            completed_at: r.completed_at,
        }
    }
}

const INSTANCE_COLUMNS: &str = "id, marketplace_id, host, port_hints, status, setup_status, \
     scheduler_active, checks_performed, scheduler_started_at, last_check_at, \
     metadata, last_error, created_at, updated_at";

const JOB_COLUMNS: &str = "id, instance_id, workflow_id, params, status, correlation_id, \
     image_urls, error_reason, created_at, completed_at";

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances
             (id, marketplace_id, host, port_hints, status, setup_status,
              scheduler_active, checks_performed, scheduler_started_at, last_check_at,
              metadata, last_error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(instance.id)
        .bind(&instance.marketplace_id)
        .bind(&instance.host)
        .bind(hints_to_db(&instance.port_hints))
        .bind(instance.status.as_str())
        .bind(instance.setup_status.as_str())
        .bind(instance.scheduler.active)
        .bind(instance.scheduler.checks_performed as i32)
        .bind(instance.scheduler.started_at)
        .bind(instance.scheduler.last_check_at)
        .bind(&instance.metadata)
        .bind(&instance.last_error)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(store_err)?;
        row.map(Instance::try_from).transpose()
    }

    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<bool> {
        let scheduler = patch.scheduler.as_ref();
        let res = sqlx::query(
            "UPDATE instances
             SET status = COALESCE($2, status),
                 host = COALESCE($3, host),
                 port_hints = COALESCE($4, port_hints),
                 scheduler_active = COALESCE($5, scheduler_active),
                 checks_performed = COALESCE($6, checks_performed),
                 scheduler_started_at = CASE WHEN $5 IS NULL THEN scheduler_started_at ELSE $7 END,
                 last_check_at = CASE WHEN $5 IS NULL THEN last_check_at ELSE $8 END,
                 metadata = COALESCE($9, metadata),
                 last_error = COALESCE($10, last_error),
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.host)
        .bind(patch.port_hints.as_deref().map(hints_to_db))
        .bind(scheduler.map(|s| s.active))
        .bind(scheduler.map(|s| s.checks_performed as i32))
        .bind(scheduler.and_then(|s| s.started_at))
        .bind(scheduler.and_then(|s| s.last_check_at))
        .bind(&patch.metadata)
        .bind(&patch.last_error)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
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
        let res = sqlx::query(
            "UPDATE instances
             SET setup_status = $3, updated_at = NOW()
             WHERE id = $1 AND setup_status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn transition_instance_status(
        &self,
        id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE instances
             SET status = $3, updated_at = NOW()
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn swap_scheduler(
        &self,
        id: Uuid,
        expected: &SchedulerState,
        next: &SchedulerState,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE instances
             SET scheduler_active = $6,
                 checks_performed = $7,
                 scheduler_started_at = $8,
                 last_check_at = $9,
                 updated_at = NOW()
             WHERE id = $1
               AND scheduler_active = $2
               AND checks_performed = $3
               AND scheduler_started_at IS NOT DISTINCT FROM $4::timestamptz
               AND last_check_at IS NOT DISTINCT FROM $5::timestamptz",
        )
        .bind(id)
        .bind(expected.active)
        .bind(expected.checks_performed as i32)
        .bind(expected.started_at)
        .bind(expected.last_check_at)
        .bind(next.active)
        .bind(next.checks_performed as i32)
        .bind(next.started_at)
        .bind(next.last_check_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_instances_by_setup_status(&self, status: SetupStatus) -> Result<Vec<Instance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM instances WHERE setup_status = $1 ORDER BY created_at",
            INSTANCE_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn list_monitored_instances(&self) -> Result<Vec<Instance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM instances WHERE scheduler_active ORDER BY created_at",
            INSTANCE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn insert_job(&self, job: &GenerationJob) -> Result<()> {
        let params = serde_json::to_value(&job.params)
            .map_err(|e| FleetError::Store(format!("bad job params: {}", e)))?;
        sqlx::query(
            "INSERT INTO generation_jobs
             (id, instance_id, workflow_id, params, status, correlation_id,
              image_urls, error_reason, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.id)
        .bind(job.instance_id)
        .bind(&job.workflow_id)
        .bind(params)
        .bind(job.status.as_str())
        .bind(&job.correlation_id)
        .bind(serde_json::json!(job.image_urls))
        .bind(&job.error_reason)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM generation_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(store_err)?;
        row.map(GenerationJob::try_from).transpose()
    }

    async fn update_job(&self, id: Uuid, patch: &JobPatch) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE generation_jobs
             SET correlation_id = COALESCE($2, correlation_id),
                 image_urls = COALESCE($3, image_urls),
                 error_reason = COALESCE($4, error_reason),
                 completed_at = COALESCE($5, completed_at)
             WHERE id = $1",
        )
        .bind(id)
        .bind(&patch.correlation_id)
        .bind(patch.image_urls.as_ref().map(|u| serde_json::json!(u)))
        .bind(&patch.error_reason)
        .bind(patch.completed_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn claim_correlation_id(&self, id: Uuid, correlation_id: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE generation_jobs
             SET correlation_id = $2
             WHERE id = $1 AND correlation_id IS NULL",
        )
        .bind(id)
        .bind(correlation_id)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
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
        let res = sqlx::query(
            "UPDATE generation_jobs
             SET status = $3,
                 correlation_id = COALESCE($4, correlation_id),
                 image_urls = COALESCE($5, image_urls),
                 error_reason = COALESCE($6, error_reason),
                 completed_at = COALESCE($7, completed_at)
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&patch.correlation_id)
        .bind(patch.image_urls.as_ref().map(|u| serde_json::json!(u)))
        .bind(&patch.error_reason)
        .bind(patch.completed_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_inflight_jobs(&self) -> Result<Vec<GenerationJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM generation_jobs
             WHERE status IN ('queued', 'executing') AND correlation_id IS NOT NULL
             ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(GenerationJob::try_from).collect()
    }

    async fn create_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO action_logs
             (id, action_type, component, status, error_message, instance_id, job_id, metadata, created_at)
             VALUES ($1, $2, 'orchestrator', $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(&entry.action_type)
        .bind(&entry.status)
        .bind(&entry.error_message)
        .bind(entry.instance_id)
        .bind(entry.job_id)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
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
        sqlx::query(
            "UPDATE action_logs
             SET status = $2, duration_ms = $3, error_message = $4,
                 metadata = COALESCE($5, metadata), completed_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(duration_ms)
        .bind(error_message)
        .bind(metadata)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        instance_id: Option<Uuid>,
        job_id: Option<Uuid>,
    ) -> Result<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, action_type, status, instance_id, job_id, error_message,
                    metadata, duration_ms, created_at, completed_at
             FROM action_logs
             WHERE ($1::uuid IS NULL OR instance_id = $1)
               AND ($2::uuid IS NULL OR job_id = $2)
             ORDER BY created_at",
        )
        .bind(instance_id)
        .bind(job_id)
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }
}
