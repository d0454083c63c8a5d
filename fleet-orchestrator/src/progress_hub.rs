//! Fan-out of progress snapshots to live clients.
//!
//! Each client owns a bounded queue. Publishing never waits on a slow client:
//! a full queue drops that message for that client only, a closed queue is
//! removed during the pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fleet_common::bus::HubMessage;
use fleet_common::ProgressSnapshot;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub type ClientId = u64;

/// A registered connection: its id, its queue, and the snapshot history to send first.
pub struct ClientHandle {
    pub id: ClientId,
    pub receiver: mpsc::Receiver<Arc<str>>,
    pub backlog: Vec<Arc<str>>,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<ClientId, mpsc::Sender<Arc<str>>>,
    snapshots: HashMap<Uuid, ProgressSnapshot>,
}

pub struct ProgressHub {
    inner: Mutex<HubInner>,
    client_buffer: usize,
    next_client: AtomicU64,
}

fn encode(msg: &HubMessage) -> Option<Arc<str>> {
    match msg.to_line() {
        Ok(line) => Some(Arc::from(line)),
        Err(e) => {
            tracing::error!("progress hub: failed to serialize message: {}", e);
            None
        }
    }
}

impl ProgressHub {
    pub fn new(client_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            client_buffer: client_buffer.max(1),
            next_client: AtomicU64::new(1),
        }
    }

    pub async fn register_client(&self) -> ClientHandle {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_buffer);

        let mut inner = self.inner.lock().await;
        let mut snapshots: Vec<&ProgressSnapshot> = inner.snapshots.values().collect();
        snapshots.sort_by_key(|s| s.updated_at);
        let backlog = snapshots
            .into_iter()
            .filter_map(|s| encode(&HubMessage::Progress { job: s.clone() }))
            .collect();
        inner.clients.insert(id, tx);
        tracing::debug!("progress hub: client {} connected ({} total)", id, inner.clients.len());

        ClientHandle {
            id,
            receiver: rx,
            backlog,
        }
    }

    pub async fn disconnect(&self, id: ClientId) {
        let mut inner = self.inner.lock().await;
        if inner.clients.remove(&id).is_some() {
            tracing::debug!(
                "progress hub: client {} disconnected ({} left)",
                id,
                inner.clients.len()
            );
        }
    }

    /// Store the snapshot and push it to every client. Returns how many
    /// clients accepted the message.
    ///
    /// A terminal snapshot is never replaced by a non-terminal one.
    pub async fn publish(&self, snapshot: ProgressSnapshot) -> usize {
        let mut inner = self.inner.lock().await;
        if let Some(prev) = inner.snapshots.get(&snapshot.job_id) {
            if prev.status.is_terminal() && !snapshot.status.is_terminal() {
                tracing::debug!(
                    "progress hub: ignoring non-terminal update for finished job {}",
                    snapshot.job_id
                );
                return 0;
            }
        }
        inner.snapshots.insert(snapshot.job_id, snapshot.clone());
        let Some(line) = encode(&HubMessage::Progress { job: snapshot }) else {
            return 0;
        };
        Self::broadcast(&mut inner, line)
    }

    /// Installer phase notification (`type = setup_progress`). Not buffered.
    pub async fn publish_setup_progress(
        &self,
        instance_id: Uuid,
        step: u32,
        total_steps: u32,
        message: &str,
    ) -> usize {
        let msg = HubMessage::SetupProgress {
            instance_id,
            step,
            total_steps,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let Some(line) = encode(&msg) else {
            return 0;
        };
        let mut inner = self.inner.lock().await;
        Self::broadcast(&mut inner, line)
    }

    fn broadcast(inner: &mut HubInner, line: Arc<str>) -> usize {
        let mut delivered = 0;
        inner.clients.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("progress hub: client {} is lagging, message dropped", id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub async fn get_progress(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.inner.lock().await.snapshots.get(&job_id).cloned()
    }

    pub async fn all_progress(&self) -> Vec<ProgressSnapshot> {
        let inner = self.inner.lock().await;
        let mut all: Vec<ProgressSnapshot> = inner.snapshots.values().cloned().collect();
        all.sort_by_key(|s| s.updated_at);
        all
    }

    pub async fn clear_progress(&self, job_id: Uuid) -> bool {
        self.inner.lock().await.snapshots.remove(&job_id).is_some()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }
}
