use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::error::Result;
use fleet_common::Instance;
use uuid::Uuid;

use super::InstallationExecutor;
use crate::logger::{self, Subject};
use crate::state_machine;
use crate::store::RecordStore;

/// No remote work: marks the instance `demo-ready` straight away.
pub struct DemoInstaller {
    store: Arc<dyn RecordStore>,
}

impl DemoInstaller {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InstallationExecutor for DemoInstaller {
    async fn trigger_installation(&self, instance: &Instance) -> Result<String> {
        let execution_id = format!("demo-{}", Uuid::new_v4());
        state_machine::setup_installing_to_demo_ready(
            self.store.as_ref(),
            instance.id,
            "demo installer",
        )
        .await?;
        logger::log_quick(
            self.store.as_ref(),
            "DEMO_INSTALL",
            Subject::instance(instance.id),
            Some(serde_json::json!({"execution_id": execution_id})),
        )
        .await;
        Ok(execution_id)
    }
}
