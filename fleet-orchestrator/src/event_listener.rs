//! Push-event channel for a tracked job.
//!
//! Events only refine the live snapshot (stage, node counts, fraction).
//! Completion and failure are decided by the poll loop.

use std::sync::Arc;

use chrono::Utc;
use fleet_common::{JobStatus, ProgressSnapshot};
use fleet_remote::{RemoteEvent, RemoteService};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::discovery::EndpointDiscovery;
use crate::progress_hub::ProgressHub;
use crate::store::RecordStore;

// Only the poll loop reports 100%.
const MAX_LIVE_FRACTION: f32 = 0.99;

fn node_fraction(completed: u32, total: u32, partial: f32) -> f32 {
    let total = total.max(1) as f32;
    ((completed as f32 + partial.clamp(0.0, 1.0)) / total).min(MAX_LIVE_FRACTION)
}

/// Fold one event into `snapshot`. Returns whether anything changed.
pub fn apply_event(snapshot: &mut ProgressSnapshot, event: &RemoteEvent) -> bool {
    if snapshot.status.is_terminal() {
        return false;
    }
    let before = snapshot.clone();
    let mut partial = 0.0;

    match event {
        RemoteEvent::ExecutionStart { .. } => {
            snapshot.status = JobStatus::Executing;
            snapshot.stage = "executing".to_string();
            snapshot.message = Some("execution started".to_string());
        }
        RemoteEvent::Executing {
            node: Some(node), ..
        } => {
            if snapshot.current_node.as_deref() != Some(node.as_str()) {
                if snapshot.current_node.is_some() {
                    snapshot.completed_nodes += 1;
                }
                snapshot.current_node = Some(node.clone());
            }
            snapshot.status = JobStatus::Executing;
            snapshot.stage = "executing".to_string();
        }
        RemoteEvent::Executing { node: None, .. } => {
            if snapshot.current_node.take().is_some() {
                snapshot.completed_nodes += 1;
            }
            snapshot.stage = "finalizing".to_string();
        }
        RemoteEvent::ExecutionCached { nodes, .. } => {
            snapshot.completed_nodes += nodes.len() as u32;
            if !nodes.is_empty() {
                snapshot.message = Some(format!("{} node(s) cached", nodes.len()));
            }
        }
        RemoteEvent::Progress { node, value, max, .. } => {
            if let Some(node) = node {
                snapshot.current_node = Some(node.clone());
            }
            snapshot.status = JobStatus::Executing;
            snapshot.stage = "sampling".to_string();
            snapshot.message = Some(format!("step {}/{}", value, max));
            if *max > 0 {
                partial = *value as f32 / *max as f32;
            }
        }
        RemoteEvent::ExecutionError { node, message, .. } => {
            snapshot.stage = "error".to_string();
            snapshot.last_error = Some(match node {
                Some(n) => format!("node {}: {}", n, message),
                None => message.clone(),
            });
        }
        RemoteEvent::Executed { node, .. } => {
            snapshot.message = Some(format!("node {} done", node));
        }
        RemoteEvent::Status { .. } => return false,
    }

    if snapshot.total_nodes > 0 {
        snapshot.completed_nodes = snapshot.completed_nodes.min(snapshot.total_nodes);
    }
    let fraction = node_fraction(snapshot.completed_nodes, snapshot.total_nodes, partial);
    snapshot.fraction = snapshot.fraction.max(fraction);

    *snapshot != before
}

/// Listen on the remote event channel for one job until `token` fires or
/// the stream ends. Failing to connect only loses live detail.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteService>,
    discovery: Arc<EndpointDiscovery>,
    hub: Arc<ProgressHub>,
    job_id: Uuid,
    instance_id: Uuid,
    correlation_id: String,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
    token: CancellationToken,
) {
    let instance = match store.get_instance(instance_id).await {
        Ok(Some(i)) => i,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("events: job {} cannot load instance: {}", job_id, e);
            return;
        }
    };

    let base = tokio::select! {
        _ = token.cancelled() => return,
        r = discovery.resolve_base_url(&instance) => match r {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("events: job {} has no endpoint yet: {}", job_id, e);
                return;
            }
        },
    };

    let mut stream = match remote.subscribe_events(&base, &job_id.to_string()).await {
        Ok(s) => s,
        Err(e) => {
            tracing::info!("events: job {} falls back to polling only: {}", job_id, e);
            return;
        }
    };
    tracing::debug!("events: job {} listening on {}", job_id, base);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => {
                let Some(event) = next else { break };
                if !event.concerns(&correlation_id) {
                    continue;
                }
                let mut snap = snapshot.lock().await;
                if apply_event(&mut snap, &event) {
                    snap.updated_at = Utc::now();
                    hub.publish(snap.clone()).await;
                }
            }
        }
    }
    tracing::debug!("events: job {} listener closed", job_id);
}
