//! Push events sent by the remote service over `/ws?clientId=..`.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    ExecutionStart {
        prompt_id: String,
    },
    /// `node == None` means the prompt finished executing.
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    ExecutionCached {
        prompt_id: String,
        nodes: Vec<String>,
    },
    Progress {
        prompt_id: Option<String>,
        node: Option<String>,
        value: u32,
        max: u32,
    },
    ExecutionError {
        prompt_id: String,
        node: Option<String>,
        message: String,
    },
    Executed {
        prompt_id: String,
        node: String,
    },
    Status {
        queue_remaining: Option<u32>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn str_field(data: &serde_json::Value, key: &str) -> Option<String> {
    data.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn u32_field(data: &serde_json::Value, key: &str) -> Option<u32> {
    data.get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
}

impl RemoteEvent {
    /// Parse one text frame. Unknown or malformed frames yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let env: Envelope = serde_json::from_str(text).ok()?;
        let d = &env.data;
        match env.kind.as_str() {
            "execution_start" => Some(RemoteEvent::ExecutionStart {
                prompt_id: str_field(d, "prompt_id")?,
            }),
            "executing" => Some(RemoteEvent::Executing {
                prompt_id: str_field(d, "prompt_id"),
                node: str_field(d, "node"),
            }),
            "execution_cached" => Some(RemoteEvent::ExecutionCached {
                prompt_id: str_field(d, "prompt_id")?,
                nodes: d
                    .get("nodes")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|n| n.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            "progress" => Some(RemoteEvent::Progress {
                prompt_id: str_field(d, "prompt_id"),
                node: str_field(d, "node"),
                value: u32_field(d, "value")?,
                max: u32_field(d, "max")?,
            }),
            "execution_error" => Some(RemoteEvent::ExecutionError {
                prompt_id: str_field(d, "prompt_id")?,
                node: str_field(d, "node_id"),
                message: str_field(d, "exception_message")
                    .unwrap_or_else(|| "execution error".to_string()),
            }),
            "executed" => Some(RemoteEvent::Executed {
                prompt_id: str_field(d, "prompt_id")?,
                node: str_field(d, "node")?,
            }),
            "status" => Some(RemoteEvent::Status {
                queue_remaining: d
                    .pointer("/status/exec_info/queue_remaining")
                    .and_then(|v| v.as_u64())
                    .and_then(|n| u32::try_from(n).ok()),
            }),
            _ => None,
        }
    }

    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            RemoteEvent::ExecutionStart { prompt_id }
            | RemoteEvent::ExecutionCached { prompt_id, .. }
            | RemoteEvent::ExecutionError { prompt_id, .. }
            | RemoteEvent::Executed { prompt_id, .. } => Some(prompt_id),
            RemoteEvent::Executing { prompt_id, .. } | RemoteEvent::Progress { prompt_id, .. } => {
                prompt_id.as_deref()
            }
            RemoteEvent::Status { .. } => None,
        }
    }

    /// Whether this event concerns `prompt_id`. Events without a prompt id
    /// (older servers omit it on `progress`) are attributed to the listener's prompt.
    pub fn concerns(&self, prompt_id: &str) -> bool {
        match self {
            RemoteEvent::Status { .. } => false,
            other => other.prompt_id().map(|p| p == prompt_id).unwrap_or(true),
        }
    }
}
