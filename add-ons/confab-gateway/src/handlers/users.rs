//! User-facing identity endpoint. Credential issuance lives outside the
//! gateway; this surface only resolves presented tokens.

use super::{authenticate, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use confab_core::Principal;

/// GET /api/users/profile — the principal behind the bearer token.
pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Principal>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    Ok(Json(principal))
}
