use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fleet_common::error::Result;
use fleet_common::{FleetError, GenerationJob, GenerationParams, InstanceStatus};
use fleet_remote::workflow::build_prompt;
use fleet_remote::{PromptRequest, RemoteError, RemoteService};
use uuid::Uuid;

use crate::discovery::EndpointDiscovery;
use crate::job_monitor::JobTracker;
use crate::logger::{self, Subject};
use crate::state_machine;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct SubmitSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// Seed used when the caller did not pin one. Stable per job so a
/// resubmission renders the same image.
fn derived_seed(job_id: Uuid) -> u64 {
    job_id.as_u64_pair().0 & 0x0000_FFFF_FFFF_FFFF
}

struct Submitted {
    prompt_id: String,
    base_url: String,
    attempts: u32,
    /// False when another submission stored its correlation id first.
    claimed: bool,
}

/// Removes the job from the in-flight set when the submission ends.
struct InFlight<'a> {
    jobs: &'a StdMutex<HashSet<Uuid>>,
    job_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = match self.jobs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&self.job_id);
    }
}

pub struct GenerationService {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteService>,
    discovery: Arc<EndpointDiscovery>,
    tracker: Arc<JobTracker>,
    settings: SubmitSettings,
    in_flight: StdMutex<HashSet<Uuid>>,
}

impl GenerationService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
        discovery: Arc<EndpointDiscovery>,
        tracker: Arc<JobTracker>,
        settings: SubmitSettings,
    ) -> Self {
        Self {
            store,
            remote,
            discovery,
            tracker,
            settings,
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    fn begin_submit(&self, job_id: Uuid) -> Option<InFlight<'_>> {
        let mut guard = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.insert(job_id) {
            return None;
        }
        Some(InFlight {
            jobs: &self.in_flight,
            job_id,
        })
    }

    pub async fn create_job(
        &self,
        instance_id: Uuid,
        workflow_id: Option<String>,
        params: GenerationParams,
    ) -> Result<GenerationJob> {
        if self.store.get_instance(instance_id).await?.is_none() {
            return Err(FleetError::instance_not_found(instance_id));
        }
        let job = GenerationJob::new(instance_id, workflow_id, params);
        self.store.insert_job(&job).await?;
        logger::log_quick(
            self.store.as_ref(),
            "GENERATION_CREATED",
            Subject::job(job.id, instance_id),
            Some(serde_json::json!({ "workflow_id": job.workflow_id })),
        )
        .await;
        Ok(job)
    }

    async fn reject(&self, job: &GenerationJob, err: FleetError) -> FleetError {
        let reason = err.to_string();
        if let Err(e) = state_machine::job_to_failed(self.store.as_ref(), job.id, &reason).await {
            tracing::error!("generation: could not mark job {} failed: {}", job.id, e);
        }
        err
    }

    /// Send a queued job to its instance and start tracking it.
    ///
    /// Returns the job with its correlation id set. A job that already has
    /// one is returned unchanged. A second call while the first is still
    /// submitting is refused.
    pub async fn submit_generation(&self, job_id: Uuid) -> Result<GenerationJob> {
        let Some(_in_flight) = self.begin_submit(job_id) else {
            return Err(FleetError::Configuration(format!(
                "job {} is already being submitted",
                job_id
            )));
        };
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
        if job.correlation_id.is_some() {
            return Ok(job);
        }

        let started = std::time::Instant::now();
        let log_id = logger::log_event(
            self.store.as_ref(),
            "GENERATION_SUBMITTED",
            "in_progress",
            Subject::job(job.id, job.instance_id),
            None,
        )
        .await
        .ok();

        let result = self.submit(&job).await;

        if let Some(lid) = log_id {
            let (status, error, meta) = match &result {
                Ok(sent) => (
                    "success",
                    None,
                    Some(serde_json::json!({
                        "prompt_id": sent.prompt_id,
                        "base_url": sent.base_url,
                        "attempts": sent.attempts,
                        "claimed": sent.claimed,
                    })),
                ),
                Err(e) => ("failed", Some(e.to_string()), None),
            };
            let _ = logger::log_event_complete_with_metadata(
                self.store.as_ref(),
                lid,
                status,
                logger::elapsed_ms(started),
                error.as_deref(),
                meta,
            )
            .await;
        }

        let sent = result?;
        if sent.claimed {
            self.tracker
                .start_tracking(job.id, job.instance_id, &sent.prompt_id)
                .await?;
        }
        self.store
            .get_job(job.id)
            .await?
            .ok_or_else(|| FleetError::job_not_found(job.id))
    }

    async fn submit(&self, job: &GenerationJob) -> Result<Submitted> {
        let instance = match self.store.get_instance(job.instance_id).await? {
            Some(i) => i,
            None => {
                return Err(self
                    .reject(job, FleetError::instance_not_found(job.instance_id))
                    .await)
            }
        };
        if instance.status != InstanceStatus::Running {
            let err = FleetError::Configuration(format!(
                "instance {} is {}, not running",
                instance.id,
                instance.status.as_str()
            ));
            return Err(self.reject(job, err).await);
        }

        let discovered = match self.discovery.discover_endpoint(&instance).await {
            Ok(d) => d,
            Err(e) => return Err(self.reject(job, e).await),
        };
        let Some(base) = discovered.resolved_url else {
            let err = FleetError::TransientNetwork(format!(
                "no reachable endpoint; attempted: {}",
                discovered.attempted_urls.join(", ")
            ));
            return Err(self.reject(job, err).await);
        };

        let seed = job.params.seed.unwrap_or_else(|| derived_seed(job.id));
        let request = PromptRequest {
            prompt: build_prompt(&job.params, seed),
            client_id: job.id.to_string(),
        };

        let max = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        let accepted = loop {
            attempt += 1;
            match self.remote.submit_prompt(&base, &request).await {
                Ok(accepted) => break accepted,
                Err(e) if e.is_transient() && attempt < max => {
                    tracing::warn!(
                        "generation: submit of job {} failed (attempt {}/{}): {}",
                        job.id,
                        attempt,
                        max,
                        e
                    );
                    if matches!(e, RemoteError::Transport(_)) {
                        self.discovery.invalidate(instance.id);
                    }
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(self.reject(job, e.into()).await),
            }
        };

        let claimed = self
            .store
            .claim_correlation_id(job.id, &accepted.prompt_id)
            .await?;
        if !claimed {
            tracing::warn!(
                "generation: job {} already has a correlation id, prompt {} on {} is not tracked",
                job.id,
                accepted.prompt_id,
                base
            );
            return Ok(Submitted {
                prompt_id: accepted.prompt_id,
                base_url: base,
                attempts: attempt,
                claimed,
            });
        }
        tracing::info!(
            "🎨 job {} submitted to {} as prompt {} (seed {})",
            job.id,
            base,
            accepted.prompt_id,
            seed
        );
        Ok(Submitted {
            prompt_id: accepted.prompt_id,
            base_url: base,
            attempts: attempt,
            claimed,
        })
    }
}
