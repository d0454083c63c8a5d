use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    EventStream, HistoryEntry, PromptAccepted, PromptRequest, QueueSnapshot, RemoteError,
    RemoteEvent, RemoteService,
};

/// reqwest-backed client. Probes use their own short-timeout client.
pub struct HttpRemoteService {
    client: Client,
    probe_client: Client,
}

impl HttpRemoteService {
    pub fn new(probe_timeout: Duration, request_timeout: Duration) -> Result<Self, RemoteError> {
        let connect = probe_timeout.min(Duration::from_secs(2));
        let probe_client = Client::builder()
            .connect_timeout(connect)
            .timeout(probe_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            probe_client,
        })
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

fn trim_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

fn ws_url(base_url: &str, client_id: &str) -> String {
    let base = trim_base(base_url);
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws?clientId={}", ws_base, urlencoding::encode(client_id))
}

/// Rejection body: `{"error": {"message": ..} | "..", "node_errors": {..}}`.
fn rejection_from_body(body: &serde_json::Value) -> RemoteError {
    let message = body
        .get("error")
        .map(|e| {
            e.get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
                .or_else(|| e.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| e.to_string())
        })
        .unwrap_or_else(|| "prompt rejected".to_string());
    RemoteError::Rejected {
        message,
        node_errors: body
            .get("node_errors")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    }
}

fn has_node_errors(body: &serde_json::Value) -> bool {
    body.get("node_errors")
        .and_then(|v| v.as_object())
        .map(|m| !m.is_empty())
        .unwrap_or(false)
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn probe(&self, url: &str) -> Result<bool, RemoteError> {
        let resp = self.probe_client.get(url).send().await.map_err(transport)?;
        Ok(resp.status().is_success())
    }

    async fn submit_prompt(
        &self,
        base_url: &str,
        request: &PromptRequest,
    ) -> Result<PromptAccepted, RemoteError> {
        let url = format!("{}/prompt", trim_base(base_url));
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;

        if status.is_success() {
            let body: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))?;
            if has_node_errors(&body) {
                return Err(rejection_from_body(&body));
            }
            return serde_json::from_value(body).map_err(|e| RemoteError::Decode(e.to_string()));
        }

        if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
            if let Ok(body) = serde_json::from_str::<serde_json::Value>(&text) {
                return Err(rejection_from_body(&body));
            }
            return Err(RemoteError::Rejected {
                message: format!("HTTP {}: {}", status.as_u16(), text.trim()),
                node_errors: serde_json::Value::Null,
            });
        }

        Err(RemoteError::Status {
            status: status.as_u16(),
            body: text,
        })
    }

    async fn fetch_queue(&self, base_url: &str) -> Result<QueueSnapshot, RemoteError> {
        let url = format!("{}/queue", trim_base(base_url));
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<QueueSnapshot>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn fetch_history(
        &self,
        base_url: &str,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, RemoteError> {
        let url = format!(
            "{}/history/{}",
            trim_base(base_url),
            urlencoding::encode(prompt_id)
        );
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let mut body: serde_json::Map<String, serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        match body.remove(prompt_id) {
            None => Ok(None),
            Some(entry) => serde_json::from_value(entry)
                .map(Some)
                .map_err(|e| RemoteError::Decode(e.to_string())),
        }
    }

    async fn subscribe_events(
        &self,
        base_url: &str,
        client_id: &str,
    ) -> Result<EventStream, RemoteError> {
        let url = ws_url(base_url, client_id);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        tracing::debug!("remote event channel connected: {}", url);

        let (_sink, stream) = ws.split();
        let events = stream
            .take_while(|msg| futures_util::future::ready(msg.is_ok()))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => RemoteEvent::parse(&text),
                    _ => None,
                }
            });
        Ok(Box::pin(events))
    }
}
