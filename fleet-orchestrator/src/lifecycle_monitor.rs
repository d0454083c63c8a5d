//! Per-instance lifecycle monitoring.
//!
//! One task per instance re-reads the record on a fixed interval and decides
//! whether to keep waiting, trigger the setup executor, or give up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use fleet_common::error::Result;
use fleet_common::{
    FleetError, Instance, InstancePatch, InstanceStatus, MonitoringStatus, SchedulerState,
    SetupStatus,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::discovery::EndpointDiscovery;
use crate::installer::InstallationExecutor;
use crate::logger::{self, Subject};
use crate::state_machine;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub max_checks: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_checks: 20,
        }
    }
}

/// Result of a single check. Everything but `Continue` ends the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Continue,
    SetupReady,
    Failed,
    Stopped,
    SetupTriggered,
    /// Another worker won the pending -> installing transition.
    SetupRaced,
    Abandoned,
    Missing,
    /// The monitor was stopped or replaced while this check ran.
    Cancelled,
}

impl CheckOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, CheckOutcome::Continue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Continue => "continue",
            CheckOutcome::SetupReady => "setup_ready",
            CheckOutcome::Failed => "failed",
            CheckOutcome::Stopped => "stopped",
            CheckOutcome::SetupTriggered => "setup_triggered",
            CheckOutcome::SetupRaced => "setup_raced",
            CheckOutcome::Abandoned => "abandoned",
            CheckOutcome::Missing => "missing",
            CheckOutcome::Cancelled => "cancelled",
        }
    }
}

// Postgres keeps microseconds; scheduler timestamps are compared on write.
fn scheduler_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(|t| t.is_cancelled())
}

struct MonitorHandle {
    token: CancellationToken,
    generation: u64,
}

pub struct InstanceMonitorRegistry {
    store: Arc<dyn RecordStore>,
    executor: Arc<dyn InstallationExecutor>,
    discovery: Arc<EndpointDiscovery>,
    settings: MonitorSettings,
    monitors: Mutex<HashMap<Uuid, MonitorHandle>>,
    next_generation: AtomicU64,
}

impl InstanceMonitorRegistry {
    pub fn new(
        store: Arc<dyn RecordStore>,
        executor: Arc<dyn InstallationExecutor>,
        discovery: Arc<EndpointDiscovery>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            executor,
            discovery,
            settings,
            monitors: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn with_monitors<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, MonitorHandle>) -> R) -> R {
        let mut guard = match self.monitors.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn is_monitoring(&self, instance_id: Uuid) -> bool {
        self.with_monitors(|m| m.contains_key(&instance_id))
    }

    pub fn active_count(&self) -> usize {
        self.with_monitors(|m| m.len())
    }

    /// Start (or restart) monitoring `instance_id`.
    ///
    /// Any previous monitor for the instance is cancelled first and the
    /// scheduler bookkeeping is reset.
    pub async fn schedule_monitoring(
        self: &Arc<Self>,
        instance_id: Uuid,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        self.start_monitor(instance_id, correlation_id, false).await
    }

    /// Pick up a monitor that was running when the process stopped. The
    /// persisted check counter is kept, so the cap bounds the whole run.
    pub async fn resume_monitoring(self: &Arc<Self>, instance_id: Uuid) -> Result<()> {
        self.start_monitor(instance_id, Some("recovery"), true).await
    }

    async fn start_monitor(
        self: &Arc<Self>,
        instance_id: Uuid,
        correlation_id: Option<&str>,
        resume: bool,
    ) -> Result<()> {
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Err(FleetError::instance_not_found(instance_id));
        };

        if let Some(prev) = self.with_monitors(|m| m.remove(&instance_id)) {
            prev.token.cancel();
            tracing::debug!("lifecycle: replaced existing monitor for instance {}", instance_id);
        }

        let scheduler = if resume {
            SchedulerState {
                active: true,
                started_at: instance.scheduler.started_at.or_else(|| Some(scheduler_now())),
                ..instance.scheduler
            }
        } else {
            SchedulerState {
                active: true,
                checks_performed: 0,
                started_at: Some(scheduler_now()),
                last_check_at: None,
            }
        };
        let checks_performed = scheduler.checks_performed;
        if !self
            .store
            .update_instance(instance_id, &InstancePatch::default().scheduler(scheduler))
            .await?
        {
            return Err(FleetError::instance_not_found(instance_id));
        }

        logger::log_quick(
            self.store.as_ref(),
            "INSTANCE_MONITOR_STARTED",
            Subject::instance(instance_id),
            Some(serde_json::json!({
                "interval_s": self.settings.check_interval.as_secs(),
                "max_checks": self.settings.max_checks,
                "correlation_id": correlation_id,
                "resumed": resume,
                "checks_performed": checks_performed,
            })),
        )
        .await;

        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.with_monitors(|m| {
            m.insert(
                instance_id,
                MonitorHandle {
                    token: token.clone(),
                    generation,
                },
            )
        });

        tracing::info!(
            "👀 lifecycle: monitoring instance {} every {}s (max {} checks)",
            instance_id,
            self.settings.check_interval.as_secs(),
            self.settings.max_checks
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_monitor(instance_id, token, generation).await;
        });
        Ok(())
    }

    /// Cancel the monitor and clear the scheduler flag. Returns whether a
    /// monitor task was running.
    pub async fn stop_monitoring(&self, instance_id: Uuid) -> Result<bool> {
        let handle = self.with_monitors(|m| m.remove(&instance_id));
        let was_running = handle.is_some();
        if let Some(h) = handle {
            h.token.cancel();
        }

        // A check may be writing its counter concurrently: retry the swap.
        for _ in 0..3 {
            let Some(instance) = self.store.get_instance(instance_id).await? else {
                if was_running {
                    return Ok(true);
                }
                return Err(FleetError::instance_not_found(instance_id));
            };
            if !instance.scheduler.active {
                break;
            }
            let stopped = SchedulerState {
                active: false,
                ..instance.scheduler.clone()
            };
            if self
                .store
                .swap_scheduler(instance_id, &instance.scheduler, &stopped)
                .await?
            {
                break;
            }
        }
        if was_running {
            tracing::info!("🛑 lifecycle: monitoring stopped for instance {}", instance_id);
        }
        Ok(was_running)
    }

    pub async fn get_monitoring_status(&self, instance_id: Uuid) -> Result<MonitoringStatus> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| FleetError::instance_not_found(instance_id))?;
        Ok(MonitoringStatus {
            instance_id,
            active: instance.scheduler.active,
            checks_performed: instance.scheduler.checks_performed,
            started_at: instance.scheduler.started_at,
            last_check_at: instance.scheduler.last_check_at,
        })
    }

    async fn run_monitor(self: Arc<Self>, instance_id: Uuid, token: CancellationToken, generation: u64) {
        let period = self.settings.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("lifecycle: monitor for instance {} cancelled", instance_id);
                    break;
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    match self.check(instance_id, Some(&token)).await {
                        Ok(outcome) if outcome.is_final() => {
                            tracing::info!(
                                "lifecycle: instance {} monitor finished: {}",
                                instance_id,
                                outcome.as_str()
                            );
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("lifecycle: check for instance {} failed: {}", instance_id, e);
                            // The store may never have seen our counter.
                            if ticks >= self.settings.max_checks {
                                tracing::warn!(
                                    "lifecycle: giving up on instance {} after {} failed checks",
                                    instance_id,
                                    ticks
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.with_monitors(|m| {
            if m.get(&instance_id).map(|h| h.generation) == Some(generation) {
                m.remove(&instance_id);
            }
        });
    }

    /// One lifecycle check. Persists the check counters and, on a final
    /// outcome, clears the scheduler flag.
    pub async fn check_once(&self, instance_id: Uuid) -> Result<CheckOutcome> {
        self.check(instance_id, None).await
    }

    /// Scheduler writes are compare-and-swap against what this check read, so
    /// a stop or reschedule that lands mid-check wins and the check bails out.
    async fn check(
        &self,
        instance_id: Uuid,
        token: Option<&CancellationToken>,
    ) -> Result<CheckOutcome> {
        let Some(mut instance) = self.store.get_instance(instance_id).await? else {
            tracing::warn!("lifecycle: instance {} disappeared", instance_id);
            return Ok(CheckOutcome::Missing);
        };
        if is_cancelled(token) {
            return Ok(CheckOutcome::Cancelled);
        }

        let read = instance.scheduler.clone();
        if read.checks_performed >= self.settings.max_checks {
            return self.abandon(&instance, read).await;
        }
        let mut scheduler = read.clone();
        scheduler.checks_performed += 1;
        scheduler.last_check_at = Some(scheduler_now());
        if !self.store.swap_scheduler(instance_id, &read, &scheduler).await? {
            tracing::debug!(
                "lifecycle: scheduler for instance {} changed during check, dropping it",
                instance_id
            );
            return Ok(CheckOutcome::Cancelled);
        }

        tracing::debug!(
            "lifecycle: check {}/{} for instance {} (status={}, setup={})",
            scheduler.checks_performed,
            self.settings.max_checks,
            instance_id,
            instance.status.as_str(),
            instance.setup_status.as_str()
        );

        if instance.status != InstanceStatus::Running {
            self.discovery.invalidate(instance_id);
        }

        let outcome = if instance.setup_status.is_ready() {
            CheckOutcome::SetupReady
        } else if instance.status == InstanceStatus::Error
            || instance.setup_status == SetupStatus::Failed
        {
            CheckOutcome::Failed
        } else if matches!(
            instance.status,
            InstanceStatus::Stopping | InstanceStatus::Stopped
        ) {
            CheckOutcome::Stopped
        } else if instance.status == InstanceStatus::Running {
            if is_cancelled(token) {
                return Ok(CheckOutcome::Cancelled);
            }
            self.trigger_setup(&mut instance).await?
        } else if scheduler.checks_performed >= self.settings.max_checks {
            return self.abandon(&instance, scheduler).await;
        } else {
            CheckOutcome::Continue
        };

        if outcome.is_final() {
            let finished = SchedulerState {
                active: false,
                ..scheduler.clone()
            };
            if !self
                .store
                .swap_scheduler(instance_id, &scheduler, &finished)
                .await?
            {
                tracing::debug!(
                    "lifecycle: scheduler for instance {} already cleared",
                    instance_id
                );
            }
        }
        Ok(outcome)
    }

    async fn trigger_setup(&self, instance: &mut Instance) -> Result<CheckOutcome> {
        let id = instance.id;
        if !state_machine::setup_pending_to_installing(self.store.as_ref(), id, "instance running")
            .await?
        {
            tracing::info!(
                "lifecycle: instance {} setup already claimed ({}), not triggering",
                id,
                instance.setup_status.as_str()
            );
            return Ok(CheckOutcome::SetupRaced);
        }
        instance.setup_status = SetupStatus::Installing;

        let started = std::time::Instant::now();
        match self.executor.trigger_installation(instance).await {
            Ok(execution_id) => {
                tracing::info!(
                    "⚙️  lifecycle: setup triggered for instance {} ({})",
                    id,
                    execution_id
                );
                if let Ok(log_id) = logger::log_event_with_metadata(
                    self.store.as_ref(),
                    "INSTANCE_SETUP_TRIGGERED",
                    "in_progress",
                    Subject::instance(id),
                    None,
                    Some(serde_json::json!({ "execution_id": execution_id })),
                )
                .await
                {
                    let _ = logger::log_event_complete(
                        self.store.as_ref(),
                        log_id,
                        "success",
                        logger::elapsed_ms(started),
                        None,
                    )
                    .await;
                }
                Ok(CheckOutcome::SetupTriggered)
            }
            Err(e) => {
                let msg = format!("setup executor failed to start: {}", e);
                tracing::error!("❌ lifecycle: instance {}: {}", id, msg);
                state_machine::setup_installing_to_failed(self.store.as_ref(), id, &msg).await?;
                let _ = logger::log_event(
                    self.store.as_ref(),
                    "INSTANCE_SETUP_TRIGGERED",
                    "failed",
                    Subject::instance(id),
                    Some(msg.as_str()),
                )
                .await;
                Ok(CheckOutcome::Failed)
            }
        }
    }

    async fn abandon(&self, instance: &Instance, expected: SchedulerState) -> Result<CheckOutcome> {
        let scheduler = SchedulerState {
            active: false,
            ..expected.clone()
        };
        if !self
            .store
            .swap_scheduler(instance.id, &expected, &scheduler)
            .await?
        {
            return Ok(CheckOutcome::Cancelled);
        }
        tracing::warn!(
            "⏱️  lifecycle: instance {} still {} after {} checks, abandoning",
            instance.id,
            instance.status.as_str(),
            scheduler.checks_performed
        );
        logger::log_quick(
            self.store.as_ref(),
            "INSTANCE_MONITOR_ABANDONED",
            Subject::instance(instance.id),
            Some(serde_json::json!({
                "checks_performed": scheduler.checks_performed,
                "status": instance.status.as_str(),
                "setup_status": instance.setup_status.as_str(),
            })),
        )
        .await;
        Ok(CheckOutcome::Abandoned)
    }
}
