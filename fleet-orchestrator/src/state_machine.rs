use chrono::Utc;
use fleet_common::error::Result;
use fleet_common::{InstancePatch, InstanceStatus, JobPatch, JobStatus, SetupStatus};
use uuid::Uuid;

use crate::logger::{self, Subject};
use crate::store::RecordStore;

/// Record a state transition in the action log.
async fn log_state_transition(
    store: &dyn RecordStore,
    action_type: &str,
    subject: Subject,
    from_status: &str,
    to_status: &str,
    reason: &str,
) {
    logger::log_quick(
        store,
        action_type,
        subject,
        Some(serde_json::json!({"from": from_status, "to": to_status, "reason": reason})),
    )
    .await;
}

async fn setup_transition(
    store: &dyn RecordStore,
    instance_id: Uuid,
    from: SetupStatus,
    to: SetupStatus,
    reason: &str,
) -> Result<bool> {
    let moved = store.transition_setup_status(instance_id, from, to).await?;
    if moved {
        tracing::info!(
            "🔄 [state_machine] instance {} setup {} -> {} ({})",
            instance_id,
            from.as_str(),
            to.as_str(),
            reason
        );
        log_state_transition(
            store,
            "INSTANCE_SETUP_TRANSITION",
            Subject::instance(instance_id),
            from.as_str(),
            to.as_str(),
            reason,
        )
        .await;
    } else {
        tracing::debug!(
            "[state_machine] instance {} setup {} -> {} not applied (state moved on)",
            instance_id,
            from.as_str(),
            to.as_str()
        );
    }
    Ok(moved)
}

/// Transition PENDING -> INSTALLING (idempotent). Only the winner may start the installer.
pub async fn setup_pending_to_installing(
    store: &dyn RecordStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool> {
    setup_transition(
        store,
        instance_id,
        SetupStatus::Pending,
        SetupStatus::Installing,
        reason,
    )
    .await
}

/// Transition INSTALLING -> READY (idempotent).
pub async fn setup_installing_to_ready(
    store: &dyn RecordStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool> {
    setup_transition(
        store,
        instance_id,
        SetupStatus::Installing,
        SetupStatus::Ready,
        reason,
    )
    .await
}

/// Transition INSTALLING -> DEMO-READY (idempotent).
pub async fn setup_installing_to_demo_ready(
    store: &dyn RecordStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool> {
    setup_transition(
        store,
        instance_id,
        SetupStatus::Installing,
        SetupStatus::DemoReady,
        reason,
    )
    .await
}

/// Transition INSTALLING -> FAILED and keep the error on the record.
pub async fn setup_installing_to_failed(
    store: &dyn RecordStore,
    instance_id: Uuid,
    error: &str,
) -> Result<bool> {
    let moved = setup_transition(
        store,
        instance_id,
        SetupStatus::Installing,
        SetupStatus::Failed,
        error,
    )
    .await?;
    if moved {
        store
            .update_instance(instance_id, &InstancePatch::default().last_error(error))
            .await?;
    }
    Ok(moved)
}

async fn instance_transition(
    store: &dyn RecordStore,
    instance_id: Uuid,
    from: InstanceStatus,
    to: InstanceStatus,
    reason: &str,
) -> Result<bool> {
    let moved = store.transition_instance_status(instance_id, from, to).await?;
    if moved {
        tracing::info!(
            "🔄 [state_machine] instance {} {} -> {} ({})",
            instance_id,
            from.as_str(),
            to.as_str(),
            reason
        );
        log_state_transition(
            store,
            "INSTANCE_STATUS_TRANSITION",
            Subject::instance(instance_id),
            from.as_str(),
            to.as_str(),
            reason,
        )
        .await;
    } else {
        tracing::debug!(
            "[state_machine] instance {} {} -> {} not applied (state moved on)",
            instance_id,
            from.as_str(),
            to.as_str()
        );
    }
    Ok(moved)
}

/// Transition RUNNING -> CONFIGURING while an installer works on the machine.
pub async fn instance_running_to_configuring(
    store: &dyn RecordStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool> {
    instance_transition(
        store,
        instance_id,
        InstanceStatus::Running,
        InstanceStatus::Configuring,
        reason,
    )
    .await
}

/// Transition CONFIGURING -> RUNNING. A stop or error recorded meanwhile is kept.
pub async fn instance_configuring_to_running(
    store: &dyn RecordStore,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool> {
    instance_transition(
        store,
        instance_id,
        InstanceStatus::Configuring,
        InstanceStatus::Running,
        reason,
    )
    .await
}

/// Transition QUEUED -> EXECUTING (idempotent).
pub async fn job_queued_to_executing(
    store: &dyn RecordStore,
    job_id: Uuid,
    instance_id: Uuid,
) -> Result<bool> {
    let moved = store
        .transition_job_status(
            job_id,
            JobStatus::Queued,
            JobStatus::Executing,
            &JobPatch::default(),
        )
        .await?;
    if moved {
        tracing::info!("🔄 [state_machine] job {} queued -> executing", job_id);
        log_state_transition(
            store,
            "GENERATION_STATUS_TRANSITION",
            Subject::job(job_id, instance_id),
            "queued",
            "executing",
            "prompt running on remote",
        )
        .await;
    }
    Ok(moved)
}

/// Move a job from whatever non-terminal state it is in to `to`.
/// Returns `Ok(false)` when the job is gone or already terminal.
async fn finish_job(
    store: &dyn RecordStore,
    job_id: Uuid,
    to: JobStatus,
    patch: &JobPatch,
) -> Result<bool> {
    // One retry covers a concurrent queued -> executing promotion.
    for _ in 0..2 {
        let Some(job) = store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        if store
            .transition_job_status(job_id, job.status, to, patch)
            .await?
        {
            tracing::info!(
                "🔄 [state_machine] job {} {} -> {}",
                job_id,
                job.status.as_str(),
                to.as_str()
            );
            return Ok(true);
        }
    }
    Ok(false)
}

/// Mark a job completed with its artifact URLs.
pub async fn job_to_completed(
    store: &dyn RecordStore,
    job_id: Uuid,
    image_urls: Vec<String>,
) -> Result<bool> {
    let patch = JobPatch {
        image_urls: Some(image_urls),
        completed_at: Some(Utc::now()),
        ..Default::default()
    };
    finish_job(store, job_id, JobStatus::Completed, &patch).await
}

/// Mark a job failed with a reason.
pub async fn job_to_failed(store: &dyn RecordStore, job_id: Uuid, reason: &str) -> Result<bool> {
    let patch = JobPatch {
        error_reason: Some(reason.to_string()),
        completed_at: Some(Utc::now()),
        ..Default::default()
    };
    finish_job(store, job_id, JobStatus::Failed, &patch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fleet_common::{GenerationJob, GenerationParams, Instance};

    #[tokio::test]
    async fn failed_setup_keeps_error() {
        let store = MemoryStore::new();
        let inst = Instance::new("m-1", Some("10.0.0.1"), vec![]);
        store.insert_instance(&inst).await.unwrap();

        // Not installing yet: nothing happens.
        assert!(!setup_installing_to_failed(&store, inst.id, "ssh refused").await.unwrap());
        assert!(setup_pending_to_installing(&store, inst.id, "test").await.unwrap());
        assert!(setup_installing_to_failed(&store, inst.id, "ssh refused").await.unwrap());

        let got = store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(got.setup_status, SetupStatus::Failed);
        assert_eq!(got.last_error.as_deref(), Some("ssh refused"));
        let audit = store.list_audit_entries(Some(inst.id), None).await.unwrap();
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_touched() {
        let store = MemoryStore::new();
        let job = GenerationJob::new(Uuid::new_v4(), None, GenerationParams::default());
        store.insert_job(&job).await.unwrap();

        assert!(job_to_completed(&store, job.id, vec!["u".into()]).await.unwrap());
        assert!(!job_to_failed(&store, job.id, "late").await.unwrap());
        let got = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Completed);
        assert!(got.error_reason.is_none());
        assert_eq!(got.image_urls, vec!["u".to_string()]);
        assert!(!job_to_failed(&store, Uuid::new_v4(), "missing").await.unwrap());
    }

    #[test]
    fn queued_promotion_happens_once() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let job = GenerationJob::new(Uuid::new_v4(), None, GenerationParams::default());
            store.insert_job(&job).await.unwrap();

            let first = tokio_test::assert_ok!(
                job_queued_to_executing(&store, job.id, job.instance_id).await
            );
            let second = tokio_test::assert_ok!(
                job_queued_to_executing(&store, job.id, job.instance_id).await
            );
            assert!(first);
            assert!(!second);
            let got = store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(got.status, JobStatus::Executing);
        });
    }
}
