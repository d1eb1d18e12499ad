//! HTTP handlers for the thin CRUD surface around the socket pipeline.

pub mod conversations;
pub mod users;

use crate::AppState;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use confab_core::Principal;
use serde_json::{json, Value};

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

/// Resolves the request's bearer token to a Principal or answers 401.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim);
    state
        .verifier
        .resolve(token, state.store.as_ref())
        .await
        .map_err(|e| api_error(StatusCode::UNAUTHORIZED, &e.to_string()))
}
