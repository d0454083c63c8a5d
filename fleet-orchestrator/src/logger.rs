use fleet_common::error::Result;
use fleet_common::AuditEntry;
use uuid::Uuid;

use crate::store::RecordStore;

/// Which record an audit entry is about.
#[derive(Debug, Clone, Copy, Default)]
pub struct Subject {
    pub instance_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
}

impl Subject {
    pub fn instance(id: Uuid) -> Self {
        Self {
            instance_id: Some(id),
            job_id: None,
        }
    }

    pub fn job(job_id: Uuid, instance_id: Uuid) -> Self {
        Self {
            instance_id: Some(instance_id),
            job_id: Some(job_id),
        }
    }
}

/// Simple action logger
pub async fn log_event(
    store: &dyn RecordStore,
    action_type: &str,
    status: &str,
    subject: Subject,
    error_message: Option<&str>,
) -> Result<Uuid> {
    log_event_with_metadata(store, action_type, status, subject, error_message, None).await
}

/// Log event with metadata (context info)
pub async fn log_event_with_metadata(
    store: &dyn RecordStore,
    action_type: &str,
    status: &str,
    subject: Subject,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<Uuid> {
    let mut entry = AuditEntry::new(action_type, status);
    entry.instance_id = subject.instance_id;
    entry.job_id = subject.job_id;
    entry.error_message = error_message.map(|s| s.to_string());
    entry.metadata = metadata;
    store.create_audit_entry(&entry).await?;

    tracing::debug!("📝 Logged: {} - {} ({})", action_type, status, entry.id);
    Ok(entry.id)
}

/// Log event completion with duration
pub async fn log_event_complete(
    store: &dyn RecordStore,
    log_id: Uuid,
    status: &str,
    duration_ms: i32,
    error_message: Option<&str>,
) -> Result<()> {
    log_event_complete_with_metadata(store, log_id, status, duration_ms, error_message, None).await
}

/// Log event completion with metadata
pub async fn log_event_complete_with_metadata(
    store: &dyn RecordStore,
    log_id: Uuid,
    status: &str,
    duration_ms: i32,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<()> {
    store
        .complete_audit_entry(log_id, status, duration_ms, error_message, metadata)
        .await
}

/// Quick log for one-off events (like state transitions)
pub async fn log_quick(
    store: &dyn RecordStore,
    action_type: &str,
    subject: Subject,
    metadata: Option<serde_json::Value>,
) {
    if let Ok(id) =
        log_event_with_metadata(store, action_type, "in_progress", subject, None, metadata).await
    {
        let _ = log_event_complete(store, id, "success", 0, None).await;
    }
}

pub fn elapsed_ms(started: std::time::Instant) -> i32 {
    i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX)
}
