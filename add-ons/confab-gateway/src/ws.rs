//! Connection gateway: the authenticated, long-lived WebSocket.
//!
//! The credential is resolved *before* the upgrade completes; a refused
//! connection never processes an application event. An admitted connection
//! gets one writer task that serializes outbound events in emission order,
//! and one read loop that forwards `send_message` events to the orchestrator
//! under the single-flight rule. Disconnecting drops the outbound channel —
//! the in-flight pipeline keeps running (dispatched persistence completes)
//! and its late emissions are discarded silently.

use crate::events::{ClientEvent, ErrorCode, EventSink, ServerEvent};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pulls the bearer token from the `Authorization` header or the `token`
/// query parameter.
fn bearer_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .or_else(|| params.get("token").map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// GET /ws — upgrades to a WebSocket after the credential resolves to a
/// known principal. Refusals answer 401 with the reason string as payload.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = bearer_token(&headers, &params);
    match state
        .verifier
        .resolve(token.as_deref(), state.store.as_ref())
        .await
    {
        Ok(principal) => {
            tracing::info!(target: "confab::gateway", user = %principal.id, "connection admitted");
            ws.on_upgrade(move |socket| handle_connection(socket, state, principal))
        }
        Err(reason) => {
            tracing::info!(target: "confab::gateway", "connection refused: {}", reason);
            (StatusCode::UNAUTHORIZED, reason.to_string()).into_response()
        }
    }
}

async fn handle_connection(socket: WebSocket, state: AppState, principal: confab_core::Principal) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Writer task: the only place that touches the socket's send half, so
    // events for this connection can never interleave or reorder.
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(target: "confab::gateway", "event serialization failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(inbound) = ws_rx.next().await {
        let message = match inbound {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::SendMessage {
                    conversation_id,
                    prompt,
                }) => {
                    // Single-flight: claim the connection's session slot or
                    // reject immediately — never queue.
                    let Some(guard) = state.sessions.begin(connection_id) else {
                        let _ = out_tx.send(ServerEvent::Error {
                            code: ErrorCode::Busy,
                            message: "a message is already being processed on this connection"
                                .into(),
                        });
                        continue;
                    };
                    let orchestrator = state.orchestrator.clone();
                    let sink = EventSink::new(out_tx.clone());
                    let principal = principal.clone();
                    tokio::spawn(async move {
                        // Guard released on every exit path of the pipeline.
                        let _guard = guard;
                        let status = orchestrator
                            .handle_message(&principal, conversation_id, prompt, &sink)
                            .await;
                        tracing::debug!(
                            target: "confab::gateway",
                            user = %principal.id,
                            "session finished: {}",
                            status.as_str()
                        );
                    });
                }
                Err(_) => {
                    let _ = out_tx.send(ServerEvent::Error {
                        code: ErrorCode::Validation,
                        message: "unrecognized event".into(),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/pong are answered by axum; binary frames are ignored.
            _ => {}
        }
    }

    tracing::info!(target: "confab::gateway", user = %principal.id, "connection closed");
    drop(out_tx);
    let _ = writer.await;
}
