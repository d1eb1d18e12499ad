//! Conversation CRUD: create, list, fetch, and read turn history.
//!
//! Ownership is enforced the same way as the socket path: a conversation
//! that is absent or owned by someone else answers 404 without revealing
//! which of the two it was.

use super::{api_error, authenticate, ApiError};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use confab_core::{Conversation, ConversationStore, Turn, TurnStore};
use serde::Deserialize;

const MAX_TITLE_LEN: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

/// POST /api/conversations
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let title = body
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "title is required"))?;
    if title.len() > MAX_TITLE_LEN {
        return Err(api_error(StatusCode::BAD_REQUEST, "title too long"));
    }

    let now = Utc::now();
    let conversation = Conversation {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: principal.id,
        title,
        created_at: now,
        updated_at: now,
    };
    state
        .store
        .create_conversation(&conversation)
        .await
        .map_err(|e| {
            tracing::error!(target: "confab::gateway", "conversation create failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create conversation")
        })?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/conversations
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let conversations = state
        .store
        .list_conversations(&principal.id)
        .await
        .map_err(|e| {
            tracing::error!(target: "confab::gateway", "conversation list failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to list conversations")
        })?;
    Ok(Json(conversations))
}

async fn owned_conversation(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Conversation, ApiError> {
    let principal = authenticate(state, headers).await?;
    let conversation = state.store.get_conversation(id).await.map_err(|e| {
        tracing::error!(target: "confab::gateway", "conversation fetch failed: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch conversation")
    })?;
    match conversation {
        Some(c) if c.user_id == principal.id => Ok(c),
        _ => Err(api_error(StatusCode::NOT_FOUND, "Conversation not found")),
    }
}

/// GET /api/conversations/:id
pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = owned_conversation(&state, &headers, &id).await?;
    Ok(Json(conversation))
}

/// GET /api/conversations/:id/messages — oldest first.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    let conversation = owned_conversation(&state, &headers, &id).await?;
    let turns = state.store.history(&conversation.id).await.map_err(|e| {
        tracing::error!(target: "confab::gateway", "history fetch failed: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch messages")
    })?;
    Ok(Json(turns))
}
