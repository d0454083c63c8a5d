use std::sync::Arc;

use fleet_common::SetupStatus;
use serde::Serialize;

use crate::job_monitor::JobTracker;
use crate::lifecycle_monitor::InstanceMonitorRegistry;
use crate::state_machine;
use crate::store::RecordStore;

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub monitors_rescheduled: usize,
    pub installs_failed: usize,
    pub jobs_resumed: usize,
    pub errors: usize,
}

/// Restart the work that was in flight when the process stopped.
pub async fn recover(
    store: &dyn RecordStore,
    monitors: &Arc<InstanceMonitorRegistry>,
    tracker: &Arc<JobTracker>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    // Installer processes die with us; nothing will ever finish these.
    match store.list_instances_by_setup_status(SetupStatus::Installing).await {
        Ok(instances) => {
            for instance in instances {
                match state_machine::setup_installing_to_failed(
                    store,
                    instance.id,
                    "setup interrupted by orchestrator restart",
                )
                .await
                {
                    Ok(true) => report.installs_failed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!("recovery: instance {}: {}", instance.id, e);
                        continue;
                    }
                }
                if let Err(e) = state_machine::instance_configuring_to_running(
                    store,
                    instance.id,
                    "recovery",
                )
                .await
                {
                    report.errors += 1;
                    tracing::warn!("recovery: instance {}: {}", instance.id, e);
                }
            }
        }
        Err(e) => {
            report.errors += 1;
            tracing::error!("recovery: cannot list installing instances: {}", e);
        }
    }

    match store.list_monitored_instances().await {
        Ok(instances) => {
            for instance in instances {
                match monitors.resume_monitoring(instance.id).await {
                    Ok(()) => report.monitors_rescheduled += 1,
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!("recovery: instance {}: {}", instance.id, e);
                    }
                }
            }
        }
        Err(e) => {
            report.errors += 1;
            tracing::error!("recovery: cannot list monitored instances: {}", e);
        }
    }

    match store.list_inflight_jobs().await {
        Ok(jobs) => {
            for job in jobs {
                let Some(correlation_id) = job.correlation_id.as_deref() else {
                    continue;
                };
                match tracker
                    .start_tracking(job.id, job.instance_id, correlation_id)
                    .await
                {
                    Ok(()) => report.jobs_resumed += 1,
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!("recovery: job {}: {}", job.id, e);
                    }
                }
            }
        }
        Err(e) => {
            report.errors += 1;
            tracing::error!("recovery: cannot list in-flight jobs: {}", e);
        }
    }

    tracing::info!(
        "♻️  recovery: {} monitor(s) rescheduled, {} stale install(s) failed, {} job(s) resumed, {} error(s)",
        report.monitors_rescheduled,
        report.installs_failed,
        report.jobs_resumed,
        report.errors
    );
    report
}
