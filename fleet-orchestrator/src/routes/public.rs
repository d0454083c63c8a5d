// Public routes: banner, health and the live progress socket
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::app::AppState;

pub fn create_public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
}

async fn root() -> &'static str {
    "Fleet Orchestrator - instance lifecycle & generation progress"
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "clients": state.hub.client_count().await,
        "monitors": state.monitors.active_count(),
        "tracked_jobs": state.tracker.active_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Answer to an inbound text frame.
fn reply_to(text: &str) -> String {
    let is_ping = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false);
    if is_ping {
        r#"{"type":"pong"}"#.to_string()
    } else {
        format!("Echo: {}", text)
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let client = state.hub.register_client().await;
    let id = client.id;
    let mut rx = client.receiver;

    for line in client.backlog {
        if socket.send(Message::Text(line.to_string().into())).await.is_err() {
            state.hub.disconnect(id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(line) = outgoing else { break };
                if socket.send(Message::Text(line.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = reply_to(text.as_str());
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_gets_pong_and_rest_is_echoed() {
        assert_eq!(reply_to(r#"{"type":"ping"}"#), r#"{"type":"pong"}"#);
        assert_eq!(reply_to("hello"), "Echo: hello");
        assert_eq!(reply_to(r#"{"type":"other"}"#), r#"Echo: {"type":"other"}"#);
    }
}
