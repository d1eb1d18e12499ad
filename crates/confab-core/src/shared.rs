//! Shared domain types used across the Confab crates.
//!
//! JSON shapes follow the wire format the clients already speak: camelCase
//! field names, lowercase `sender` values, RFC 3339 timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed dimensionality of every embedding vector and MemoryRecord.
pub const EMBEDDING_DIM: usize = 768;

/// The authenticated identity bound to a connection for its whole lifetime.
/// Resolved once from the bearer credential at connection time; immutable
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
}

/// A conversation owned by exactly one principal. Created over the CRUD
/// surface; the message pipeline only reads it (ownership check) and bumps
/// `updated_at` when a turn lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Owning principal id.
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who authored a stored turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Model,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Model => "model",
        }
    }
}

/// One persisted message within a conversation. Turns are immutable once
/// written; per-conversation ordering is defined by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Builds a new turn stamped with the current time and a fresh id.
    pub fn new(conversation_id: &str, sender: Sender, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Metadata carried by every MemoryRecord. `user_id` scopes retrieval to the
/// owning principal; `text` is the turn content so retrieved records can be
/// concatenated into the generation context without a second store read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub conversation_id: String,
    pub user_id: String,
    pub text: String,
}

/// Vector representation of one Turn, stored for semantic retrieval. The
/// record id equals the source turn id (one-to-one), which makes re-indexing
/// idempotent: upserting the same id replaces the old vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl MemoryRecord {
    /// Builds the record for a stored turn and its embedding.
    pub fn for_turn(turn: &Turn, user_id: &str, vector: Vec<f32>) -> Self {
        Self {
            id: turn.id.clone(),
            vector,
            metadata: RecordMetadata {
                conversation_id: turn.conversation_id.clone(),
                user_id: user_id.to_string(),
                text: turn.content.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_serializes_camel_case() {
        let turn = Turn::new("c-1", Sender::User, "hello");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["conversationId"], "c-1");
        assert_eq!(json["sender"], "user");
        assert!(json["createdAt"].is_string());
    }

    #[test]
    fn memory_record_id_matches_turn() {
        let turn = Turn::new("c-1", Sender::Model, "answer");
        let record = MemoryRecord::for_turn(&turn, "u-1", vec![0.0; 4]);
        assert_eq!(record.id, turn.id);
        assert_eq!(record.metadata.user_id, "u-1");
        assert_eq!(record.metadata.text, "answer");
    }
}
