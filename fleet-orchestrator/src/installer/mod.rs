use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::error::Result;
use fleet_common::Instance;

use crate::config::{InstallerMode, OrchestratorConfig};
use crate::progress_hub::ProgressHub;
use crate::store::RecordStore;

pub mod demo;
pub mod ssh;

pub use demo::DemoInstaller;
pub use ssh::{SshInstaller, SshSettings};

/// Starts the installation of the generation service on an instance whose
/// setup status is already `installing`.
///
/// Returns an execution id once the work has started; completion is reported
/// by the executor itself through the record store.
#[async_trait]
pub trait InstallationExecutor: Send + Sync {
    async fn trigger_installation(&self, instance: &Instance) -> Result<String>;
}

pub fn from_config(
    config: &OrchestratorConfig,
    store: Arc<dyn RecordStore>,
    hub: Arc<ProgressHub>,
) -> Arc<dyn InstallationExecutor> {
    match config.installer {
        InstallerMode::Demo => Arc::new(DemoInstaller::new(store)),
        InstallerMode::Ssh => Arc::new(SshInstaller::new(
            store,
            hub,
            SshSettings::from_config(config),
        )),
    }
}
