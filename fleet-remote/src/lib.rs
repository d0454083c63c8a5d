use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_common::FleetError;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod http;
pub mod workflow;

#[cfg(feature = "mock")]
pub mod mock;

pub use events::RemoteEvent;

/// Errors surfaced by a remote generation service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Well-formed refusal (validation failure, node errors). Never retried.
    #[error("rejected by remote: {message}")]
    Rejected {
        message: String,
        node_errors: serde_json::Value,
    },

    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Decode(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            RemoteError::Rejected { .. } => false,
        }
    }
}

impl From<RemoteError> for FleetError {
    fn from(e: RemoteError) -> Self {
        if e.is_transient() {
            FleetError::TransientNetwork(e.to_string())
        } else {
            FleetError::RemoteRejected(e.to_string())
        }
    }
}

// --- Wire types ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRequest {
    pub prompt: serde_json::Value,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptAccepted {
    pub prompt_id: String,
    #[serde(default)]
    pub number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    Pending,
    Absent,
}

/// `GET /queue`. Entries are `[number, prompt_id, prompt, extra, outputs]` arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueSnapshot {
    fn has(entries: &[serde_json::Value], prompt_id: &str) -> bool {
        entries
            .iter()
            .any(|e| e.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
    }

    pub fn position(&self, prompt_id: &str) -> QueuePosition {
        if Self::has(&self.queue_running, prompt_id) {
            QueuePosition::Running
        } else if Self::has(&self.queue_pending, prompt_id) {
            QueuePosition::Pending
        } else {
            QueuePosition::Absent
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// One entry of `GET /history/{prompt_id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

impl HistoryEntry {
    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .map(|s| s.eq_ignore_ascii_case("error"))
            .unwrap_or(false)
    }

    /// Human readable summary of `execution_error` messages.
    pub fn error_summary(&self) -> String {
        let Some(status) = &self.status else {
            return "execution error".to_string();
        };
        let parts: Vec<String> = status
            .messages
            .iter()
            .filter(|m| m.get(0).and_then(|v| v.as_str()) == Some("execution_error"))
            .filter_map(|m| {
                let data = m.get(1)?;
                let node = data.get("node_id").and_then(|v| v.as_str()).unwrap_or("?");
                let msg = data
                    .get("exception_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                Some(format!("node {}: {}", node, msg.trim()))
            })
            .collect();
        if parts.is_empty() {
            "execution error".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Every artifact of every output node, in node-id order.
    pub fn artifacts(&self) -> Vec<Artifact> {
        let mut out = Vec::new();
        for (node_id, output) in &self.outputs {
            let Some(obj) = output.as_object() else {
                continue;
            };
            for (_key, value) in obj {
                let Some(items) = value.as_array() else {
                    continue;
                };
                for item in items {
                    let Some(filename) = item.get("filename").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    out.push(Artifact {
                        node_id: node_id.clone(),
                        filename: filename.to_string(),
                        subfolder: item
                            .get("subfolder")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        kind: item
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("output")
                            .to_string(),
                    });
                }
            }
        }
        out
    }
}

/// `{base}/view?filename=..&subfolder=..&type=..`
pub fn view_url(base_url: &str, artifact: &Artifact) -> String {
    format!(
        "{}/view?filename={}&subfolder={}&type={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(&artifact.filename),
        urlencoding::encode(&artifact.subfolder),
        urlencoding::encode(&artifact.kind),
    )
}

pub type EventStream = BoxStream<'static, RemoteEvent>;

/// Stateless client for a ComfyUI-compatible job-queue API.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// GET `url` (full URL including probe path). `Ok(true)` on a 2xx answer.
    async fn probe(&self, url: &str) -> Result<bool, RemoteError>;

    async fn submit_prompt(
        &self,
        base_url: &str,
        request: &PromptRequest,
    ) -> Result<PromptAccepted, RemoteError>;

    async fn fetch_queue(&self, base_url: &str) -> Result<QueueSnapshot, RemoteError>;

    /// `Ok(None)` while the prompt has no history entry yet.
    async fn fetch_history(
        &self,
        base_url: &str,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, RemoteError>;

    // Optional: push channel. Default is an empty stream (polling only).
    async fn subscribe_events(
        &self,
        _base_url: &str,
        _client_id: &str,
    ) -> Result<EventStream, RemoteError> {
        Ok(Box::pin(futures_util::stream::empty()))
    }
}
