//! Generation job tracking: history polling plus the optional event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use fleet_common::error::Result;
use fleet_common::{FleetError, JobStatus, ProgressSnapshot};
use fleet_remote::workflow::{build_prompt, node_count};
use fleet_remote::{view_url, HistoryEntry, QueuePosition, RemoteError, RemoteService};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::discovery::EndpointDiscovery;
use crate::event_listener;
use crate::logger::{self, Subject};
use crate::progress_hub::ProgressHub;
use crate::state_machine;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub remote_events: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(5000),
            max_polls: 60,
            remote_events: true,
        }
    }
}

struct TrackHandle {
    token: CancellationToken,
    generation: u64,
}

enum PollStep {
    Pending,
    Finished,
}

/// Context shared by one tracking task.
struct Tracked {
    job_id: Uuid,
    instance_id: Uuid,
    correlation_id: String,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
}

pub struct JobTracker {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteService>,
    discovery: Arc<EndpointDiscovery>,
    hub: Arc<ProgressHub>,
    settings: TrackerSettings,
    tasks: StdMutex<HashMap<Uuid, TrackHandle>>,
    next_generation: AtomicU64,
}

impl JobTracker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
        discovery: Arc<EndpointDiscovery>,
        hub: Arc<ProgressHub>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            store,
            remote,
            discovery,
            hub,
            settings,
            tasks: StdMutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn with_tasks<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, TrackHandle>) -> R) -> R {
        let mut guard = match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn is_tracking(&self, job_id: Uuid) -> bool {
        self.with_tasks(|t| t.contains_key(&job_id))
    }

    pub fn active_count(&self) -> usize {
        self.with_tasks(|t| t.len())
    }

    pub async fn get_progress(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.hub.get_progress(job_id).await
    }

    /// Begin tracking `job_id` under the remote `correlation_id`.
    ///
    /// Publishes a fresh queued snapshot; the first poll happens after the
    /// initial delay. A previous tracker for the same job is replaced.
    pub async fn start_tracking(
        self: &Arc<Self>,
        job_id: Uuid,
        instance_id: Uuid,
        correlation_id: &str,
    ) -> Result<()> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::job_not_found(job_id))?;
        if job.status.is_terminal() {
            return Err(FleetError::Configuration(format!(
                "job {} is already {}",
                job_id,
                job.status.as_str()
            )));
        }

        if let Some(prev) = self.with_tasks(|t| t.remove(&job_id)) {
            prev.token.cancel();
        }

        let total = node_count(&build_prompt(&job.params, 0));
        let mut initial = ProgressSnapshot::queued(job_id, instance_id, total);
        if job.status == JobStatus::Executing {
            initial.status = JobStatus::Executing;
            initial.stage = "executing".to_string();
        }
        // Rebuild from scratch, also over a stale terminal entry.
        self.hub.clear_progress(job_id).await;
        self.hub.publish(initial.clone()).await;

        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.with_tasks(|t| {
            t.insert(
                job_id,
                TrackHandle {
                    token: token.clone(),
                    generation,
                },
            )
        });

        let tracked = Tracked {
            job_id,
            instance_id,
            correlation_id: correlation_id.to_string(),
            snapshot: Arc::new(Mutex::new(initial)),
        };

        if self.settings.remote_events {
            tokio::spawn(event_listener::run(
                self.store.clone(),
                self.remote.clone(),
                self.discovery.clone(),
                self.hub.clone(),
                job_id,
                instance_id,
                tracked.correlation_id.clone(),
                tracked.snapshot.clone(),
                token.child_token(),
            ));
        }

        tracing::info!(
            "📡 tracking job {} (prompt {}) on instance {}",
            job_id,
            correlation_id,
            instance_id
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_tracker(tracked, token, generation).await;
        });
        Ok(())
    }

    pub fn stop_tracking(&self, job_id: Uuid) -> bool {
        match self.with_tasks(|t| t.remove(&job_id)) {
            Some(h) => {
                h.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_tracker(self: Arc<Self>, tracked: Tracked, token: CancellationToken, generation: u64) {
        let max = self.settings.max_polls.max(1);
        let mut last_error: Option<String> = None;
        // Poll error currently shown on the snapshot, if any.
        let mut shown_error: Option<String> = None;
        let mut finished = false;

        for attempt in 1..=max {
            let wait = if attempt == 1 {
                self.settings.initial_delay
            } else {
                self.settings.poll_interval
            };
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("job {}: tracking cancelled", tracked.job_id);
                    finished = true;
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.poll_once(&tracked, attempt, &mut shown_error).await {
                Ok(PollStep::Finished) => {
                    finished = true;
                    break;
                }
                Ok(PollStep::Pending) => {}
                Err(e) => {
                    tracing::warn!(
                        "job {}: poll {}/{} failed: {}",
                        tracked.job_id,
                        attempt,
                        max,
                        e
                    );
                    last_error = Some(e.to_string());
                    shown_error = last_error.clone();
                    let mut snap = tracked.snapshot.lock().await;
                    snap.attempts = attempt;
                    snap.last_error = Some(e.to_string());
                    snap.updated_at = Utc::now();
                    self.hub.publish(snap.clone()).await;
                }
            }
        }

        if !finished {
            let reason = format!(
                "no outputs after {} polls (last error: {})",
                max,
                last_error.as_deref().unwrap_or("none")
            );
            if let Err(e) = self.fail(&tracked, &reason).await {
                tracing::error!("job {}: could not record timeout: {}", tracked.job_id, e);
            }
        }

        token.cancel();
        self.with_tasks(|t| {
            if t.get(&tracked.job_id).map(|h| h.generation) == Some(generation) {
                t.remove(&tracked.job_id);
            }
        });
    }

    async fn poll_once(
        &self,
        tracked: &Tracked,
        attempt: u32,
        shown_error: &mut Option<String>,
    ) -> Result<PollStep> {
        let Some(job) = self.store.get_job(tracked.job_id).await? else {
            tracing::info!("job {}: record removed, tracking stops", tracked.job_id);
            return Ok(PollStep::Finished);
        };
        if job.status.is_terminal() {
            return Ok(PollStep::Finished);
        }
        let instance = self
            .store
            .get_instance(tracked.instance_id)
            .await?
            .ok_or_else(|| FleetError::instance_not_found(tracked.instance_id))?;
        let base = self.discovery.resolve_base_url(&instance).await?;

        let entry = self
            .remote
            .fetch_history(&base, &tracked.correlation_id)
            .await
            .map_err(|e| self.remote_failure(tracked.instance_id, e))?;

        if let Some(entry) = entry {
            if entry.is_error() {
                let reason = format!("remote execution error: {}", entry.error_summary());
                self.fail(tracked, &reason).await?;
                return Ok(PollStep::Finished);
            }
            if entry.has_outputs() {
                self.complete(tracked, &base, &entry, attempt).await?;
                return Ok(PollStep::Finished);
            }
        }

        let queue = self
            .remote
            .fetch_queue(&base)
            .await
            .map_err(|e| self.remote_failure(tracked.instance_id, e))?;
        let position = queue.position(&tracked.correlation_id);
        if position == QueuePosition::Running && job.status == JobStatus::Queued {
            state_machine::job_queued_to_executing(
                self.store.as_ref(),
                tracked.job_id,
                tracked.instance_id,
            )
            .await?;
        }

        let mut snap = tracked.snapshot.lock().await;
        snap.attempts = attempt;
        // Only clear what a failed poll put there; errors pushed by the remote stay.
        if let Some(shown) = shown_error.take() {
            if snap.last_error.as_deref() == Some(shown.as_str()) {
                snap.last_error = None;
            }
        }
        match position {
            QueuePosition::Running => {
                if snap.status == JobStatus::Queued {
                    snap.status = JobStatus::Executing;
                    snap.stage = "executing".to_string();
                }
            }
            QueuePosition::Pending => {
                snap.message = Some("waiting in remote queue".to_string());
            }
            QueuePosition::Absent => {
                snap.message = Some("waiting for outputs".to_string());
            }
        }
        snap.updated_at = Utc::now();
        self.hub.publish(snap.clone()).await;
        Ok(PollStep::Pending)
    }

    fn remote_failure(&self, instance_id: Uuid, e: RemoteError) -> FleetError {
        if matches!(e, RemoteError::Transport(_)) {
            self.discovery.invalidate(instance_id);
        }
        e.into()
    }

    async fn complete(
        &self,
        tracked: &Tracked,
        base: &str,
        entry: &HistoryEntry,
        attempt: u32,
    ) -> Result<()> {
        let urls: Vec<String> = entry
            .artifacts()
            .iter()
            .map(|a| view_url(base, a))
            .collect();
        let moved =
            state_machine::job_to_completed(self.store.as_ref(), tracked.job_id, urls.clone())
                .await?;
        if !moved {
            tracing::debug!("job {}: already terminal, completion ignored", tracked.job_id);
            return Ok(());
        }

        {
            let mut snap = tracked.snapshot.lock().await;
            snap.status = JobStatus::Completed;
            snap.stage = "completed".to_string();
            snap.fraction = 1.0;
            snap.completed_nodes = snap.total_nodes;
            snap.current_node = None;
            snap.attempts = attempt;
            snap.last_error = None;
            snap.message = Some(format!("{} artifact(s)", urls.len()));
            snap.image_urls = urls.clone();
            snap.updated_at = Utc::now();
            self.hub.publish(snap.clone()).await;
        }

        tracing::info!(
            "✅ job {} completed with {} artifact(s) after {} poll(s)",
            tracked.job_id,
            urls.len(),
            attempt
        );
        logger::log_quick(
            self.store.as_ref(),
            "GENERATION_COMPLETED",
            Subject::job(tracked.job_id, tracked.instance_id),
            Some(serde_json::json!({
                "correlation_id": tracked.correlation_id,
                "image_urls": urls,
                "polls": attempt,
            })),
        )
        .await;
        Ok(())
    }

    async fn fail(&self, tracked: &Tracked, reason: &str) -> Result<()> {
        let moved = state_machine::job_to_failed(self.store.as_ref(), tracked.job_id, reason).await?;
        if !moved {
            return Ok(());
        }

        {
            let mut snap = tracked.snapshot.lock().await;
            snap.status = JobStatus::Failed;
            snap.stage = "failed".to_string();
            snap.current_node = None;
            snap.last_error = Some(reason.to_string());
            snap.updated_at = Utc::now();
            self.hub.publish(snap.clone()).await;
        }

        tracing::error!("❌ job {} failed: {}", tracked.job_id, reason);
        let _ = logger::log_event_with_metadata(
            self.store.as_ref(),
            "GENERATION_FAILED",
            "failed",
            Subject::job(tracked.job_id, tracked.instance_id),
            Some(reason),
            Some(serde_json::json!({ "correlation_id": tracked.correlation_id })),
        )
        .await;
        Ok(())
    }
}
