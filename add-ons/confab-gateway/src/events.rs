//! Wire protocol for the WebSocket connection.
//!
//! One inbound event (`send_message`) and the fixed outbound sequence per
//! successful session: `message_saved` → `stream_start` → `stream_chunk`* →
//! `stream_end` → `response`. Failures surface as one `error` event carrying
//! a machine `code` and a human-readable message; when a failure lands after
//! `stream_start`, a `stream_end` precedes it so clients never stay in a
//! perpetually streaming state.
//!
//! There is exactly one accepted shape per event — anything non-conforming is
//! rejected at this boundary instead of leaking alternate field names inward.

use chrono::{DateTime, Utc};
use confab_core::Turn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events a client may send over an admitted connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// `{ "type": "send_message", "conversationId": "...", "prompt": "..." }`
    /// Fields are optional at the parse layer so absence maps to a
    /// validation error event rather than a silent parse failure.
    SendMessage {
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
}

/// Machine-readable error classification carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A second `send_message` arrived while a session was in flight.
    Busy,
    Validation,
    AccessDenied,
    Persistence,
    Embedding,
    Index,
    RateLimited,
    BadRequest,
    UpstreamUnavailable,
    Unknown,
    /// The response was streamed but could not be durably recorded.
    Finalization,
}

/// Events the gateway emits to a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    MessageSaved { message: Turn },

    #[serde(rename_all = "camelCase")]
    StreamStart { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    StreamChunk {
        chunk: String,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    StreamEnd { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    Response {
        text: String,
        message: Turn,
        conversation_id: String,
    },

    Error { code: ErrorCode, message: String },
}

/// Outbound event channel for one connection. The writer task on the other
/// end serializes events onto the socket in emission order; once the
/// connection closes the channel drops and late emissions are discarded
/// silently instead of reaching a closed socket.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(target: "confab::gateway", "connection closed; event discarded");
        }
    }
}
