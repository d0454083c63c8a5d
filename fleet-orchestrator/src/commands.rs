//! Redis Pub/Sub command listener (`CMD:*` messages).

use std::sync::Arc;

use fleet_common::bus::{Command, CHANNEL_ORCHESTRATOR_COMMANDS};
use fleet_common::error::Result;
use futures_util::StreamExt;

use crate::app::AppState;

/// Apply one command to the registries.
pub async fn dispatch(state: &Arc<AppState>, command: Command) -> Result<()> {
    match command {
        Command::MonitorInstance {
            instance_id,
            correlation_id,
        } => {
            state
                .monitors
                .schedule_monitoring(instance_id, correlation_id.as_deref())
                .await
        }
        Command::StopMonitoring { instance_id } => {
            state.monitors.stop_monitoring(instance_id).await.map(|_| ())
        }
        Command::SubmitGeneration { job_id } => {
            state.generation.submit_generation(job_id).await.map(|_| ())
        }
        Command::TrackJob {
            job_id,
            instance_id,
            correlation_id,
        } => {
            state
                .tracker
                .start_tracking(job_id, instance_id, &correlation_id)
                .await
        }
    }
}

/// Listen on the command channel until the connection drops.
pub async fn run(state: Arc<AppState>, redis_client: redis::Client) -> anyhow::Result<()> {
    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_ORCHESTRATOR_COMMANDS).await?;
    tracing::info!(
        "🎧 Orchestrator listening on Redis channel '{}'...",
        CHANNEL_ORCHESTRATOR_COMMANDS
    );

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("commands: unreadable payload: {}", e);
                continue;
            }
        };
        tracing::info!("📩 Received Event: {}", payload);

        let command = match serde_json::from_str::<Command>(&payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("commands: ignoring message: {}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let name = command.as_str();
            if let Err(e) = dispatch(&state, command).await {
                tracing::error!("commands: {} failed: {}", name, e);
            }
        });
    }

    tracing::warn!("commands: Redis subscription closed");
    Ok(())
}
