use std::sync::Arc;

use fleet_remote::RemoteService;

use crate::config::OrchestratorConfig;
use crate::discovery::{DiscoverySettings, EndpointDiscovery};
use crate::generation::{GenerationService, SubmitSettings};
use crate::installer::{self, InstallationExecutor};
use crate::job_monitor::{JobTracker, TrackerSettings};
use crate::lifecycle_monitor::{InstanceMonitorRegistry, MonitorSettings};
use crate::progress_hub::ProgressHub;
use crate::store::RecordStore;

/// Everything the handlers, the command bus and the monitors share.
pub struct AppState {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn RecordStore>,
    pub remote: Arc<dyn RemoteService>,
    pub hub: Arc<ProgressHub>,
    pub discovery: Arc<EndpointDiscovery>,
    pub monitors: Arc<InstanceMonitorRegistry>,
    pub tracker: Arc<JobTracker>,
    pub generation: Arc<GenerationService>,
}

impl AppState {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
    ) -> Arc<Self> {
        let hub = Arc::new(ProgressHub::new(config.hub_client_buffer));
        let executor = installer::from_config(&config, store.clone(), hub.clone());
        Self::assemble(config, store, remote, hub, executor)
    }

    /// Wire the components with an explicit setup executor.
    pub fn assemble(
        config: OrchestratorConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
        hub: Arc<ProgressHub>,
        executor: Arc<dyn InstallationExecutor>,
    ) -> Arc<Self> {
        let discovery = Arc::new(EndpointDiscovery::new(
            remote.clone(),
            DiscoverySettings {
                max_attempts: config.discovery_max_attempts,
                retry_delay: config.discovery_retry_delay,
                plan: config.candidate_plan.clone(),
            },
        ));
        let monitors = Arc::new(InstanceMonitorRegistry::new(
            store.clone(),
            executor,
            discovery.clone(),
            MonitorSettings {
                check_interval: config.instance_check_interval,
                max_checks: config.instance_max_checks,
            },
        ));
        let tracker = Arc::new(JobTracker::new(
            store.clone(),
            remote.clone(),
            discovery.clone(),
            hub.clone(),
            TrackerSettings {
                initial_delay: config.job_initial_delay,
                poll_interval: config.job_poll_interval,
                max_polls: config.job_max_polls,
                remote_events: config.remote_events,
            },
        ));
        let generation = Arc::new(GenerationService::new(
            store.clone(),
            remote.clone(),
            discovery.clone(),
            tracker.clone(),
            SubmitSettings {
                max_attempts: config.submit_max_attempts,
                retry_delay: config.submit_retry_delay,
            },
        ));

        Arc::new(Self {
            config,
            store,
            remote,
            hub,
            discovery,
            monitors,
            tracker,
            generation,
        })
    }
}
