//! Durable stores backed by sled.
//!
//! The store engine is treated as a key-indexed durable collaborator; the
//! pipeline only sees the three adapter traits. Turn keys embed the creation
//! timestamp so a prefix scan returns creation order without a sort, and the
//! backend provides per-write atomicity.

use crate::shared::{Conversation, Principal, Turn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::Tree;
use std::path::Path;

/// Errors surfaced by the storage adapters. The backend retries transient
/// faults internally; anything escaping here is fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Principal lookup and registration.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<Principal>, StoreError>;
    async fn put_user(&self, principal: &Principal) -> Result<(), StoreError>;
}

/// Conversation metadata: creation, ownership lookup, listing, and the
/// implicit last-activity bookkeeping.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;
}

/// Append-only turn log, ordered by creation time per conversation.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Appends one immutable turn and bumps the conversation's `updated_at`.
    async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError>;

    /// All turns of a conversation, oldest first.
    async fn history(&self, conversation_id: &str) -> Result<Vec<Turn>, StoreError>;
}

/// Sled-backed implementation of all three store adapters.
///
/// Trees: `users` (id → Principal), `conversations` (id → Conversation),
/// `turns` (`{conversation_id}/{created_at_nanos:020}/{turn_id}` → Turn).
pub struct SledStore {
    users: Tree,
    conversations: Tree,
    turns: Tree,
}

impl SledStore {
    /// Opens or creates the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            users: db.open_tree("users")?,
            conversations: db.open_tree("conversations")?,
            turns: db.open_tree("turns")?,
        })
    }

    fn turn_key(turn: &Turn) -> String {
        // Nanos zero-padded so lexicographic order equals creation order.
        let nanos = turn.created_at.timestamp_nanos_opt().unwrap_or(0);
        format!("{}/{:020}/{}", turn.conversation_id, nanos, turn.id)
    }

    fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(bytes) = self.conversations.get(id.as_bytes())? {
            let mut conversation: Conversation = serde_json::from_slice(&bytes)?;
            conversation.updated_at = at;
            self.conversations
                .insert(id.as_bytes(), serde_json::to_vec(&conversation)?)?;
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for SledStore {
    async fn get_user(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        match self.users.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_user(&self, principal: &Principal) -> Result<(), StoreError> {
        self.users
            .insert(principal.id.as_bytes(), serde_json::to_vec(principal)?)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SledStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations.insert(
            conversation.id.as_bytes(),
            serde_json::to_vec(conversation)?,
        )?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        match self.conversations.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let mut out = Vec::new();
        for item in self.conversations.iter() {
            let (_, bytes) = item?;
            let conversation: Conversation = serde_json::from_slice(&bytes)?;
            if conversation.user_id == user_id {
                out.push(conversation);
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

#[async_trait]
impl TurnStore for SledStore {
    async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        let key = Self::turn_key(turn);
        self.turns
            .insert(key.as_bytes(), serde_json::to_vec(turn)?)?;
        self.touch_conversation(&turn.conversation_id, turn.created_at)?;
        Ok(())
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Turn>, StoreError> {
        let prefix = format!("{}/", conversation_id);
        let mut out = Vec::new();
        for item in self.turns.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Sender;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn conversation(id: &str, user: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: id.to_string(),
            user_id: user.to_string(),
            title: "Test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn history_is_creation_ordered_across_interleaved_conversations() {
        let (_dir, store) = store();
        let base = Utc::now();

        let mut turns = Vec::new();
        for i in 0..4 {
            let mut t = Turn::new("c-1", Sender::User, &format!("msg {}", i));
            t.created_at = base + Duration::milliseconds(i);
            turns.push(t);
        }
        // Interleave another conversation between appends.
        store.append_turn(&turns[1]).await.unwrap();
        store
            .append_turn(&Turn::new("c-2", Sender::User, "other"))
            .await
            .unwrap();
        store.append_turn(&turns[0]).await.unwrap();
        store.append_turn(&turns[3]).await.unwrap();
        store.append_turn(&turns[2]).await.unwrap();

        let history = store.history("c-1").await.unwrap();
        let contents: Vec<_> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3"]);
    }

    #[tokio::test]
    async fn append_bumps_conversation_updated_at() {
        let (_dir, store) = store();
        let mut convo = conversation("c-1", "u-1");
        convo.updated_at = Utc::now() - Duration::hours(1);
        store.create_conversation(&convo).await.unwrap();

        let turn = Turn::new("c-1", Sender::User, "hello");
        store.append_turn(&turn).await.unwrap();

        let stored = store.get_conversation("c-1").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, turn.created_at);
    }

    #[tokio::test]
    async fn list_conversations_filters_by_owner() {
        let (_dir, store) = store();
        store
            .create_conversation(&conversation("c-1", "u-1"))
            .await
            .unwrap();
        store
            .create_conversation(&conversation("c-2", "u-2"))
            .await
            .unwrap();

        let mine = store.list_conversations("u-1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "c-1");
    }
}
