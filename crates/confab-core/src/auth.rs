//! Bearer-token verification for connections and HTTP requests.
//!
//! Tokens are HS256 JWTs carrying the principal id in `sub`. Verification
//! distinguishes four refusal reasons (missing, expired, invalid, unknown
//! principal); the reason string is safe to return to the caller, while
//! details stay in the logs.

use crate::store::UserStore;
use crate::Principal;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Connection-refusal taxonomy. The `Display` strings are the exact reasons
/// sent as the refusal payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credential")]
    MissingCredential,
    #[error("expired")]
    Expired,
    #[error("invalid")]
    Invalid,
    #[error("unknown principal")]
    UnknownPrincipal,
}

/// JWT claims. `sub` is the principal id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies bearer tokens and resolves them to known principals.
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issues a token for a principal id. Credential issuance proper lives
    /// outside the gateway; this exists for tooling and tests.
    pub fn issue(&self, principal_id: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: principal_id.to_string(),
            iat: now,
            exp: now + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| AuthError::Invalid)
    }

    /// Validates the raw token string and returns its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })
    }

    /// Full credential resolution: token → claims → stored principal.
    /// `token` is `None` when the caller presented no credential at all.
    pub async fn resolve(
        &self,
        token: Option<&str>,
        users: &dyn UserStore,
    ) -> Result<Principal, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let claims = self.verify(token)?;
        match users.get_user(&claims.sub).await {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => Err(AuthError::UnknownPrincipal),
            Err(e) => {
                tracing::error!(target: "confab::auth", "principal lookup failed: {}", e);
                Err(AuthError::UnknownPrincipal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SledStore;
    use std::sync::Arc;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-secret")
    }

    #[test]
    fn round_trip_valid_token() {
        let v = verifier();
        let token = v.issue("u-1", 3600).unwrap();
        let claims = v.verify(&token).unwrap();
        assert_eq!(claims.sub, "u-1");
    }

    #[test]
    fn expired_token_is_distinguished() {
        let v = verifier();
        let token = v.issue("u-1", -3600).unwrap();
        assert_eq!(v.verify(&token).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn malformed_token_is_invalid() {
        let v = verifier();
        assert_eq!(v.verify("not-a-jwt").unwrap_err(), AuthError::Invalid);
    }

    #[tokio::test]
    async fn resolve_distinguishes_missing_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let v = verifier();

        assert_eq!(
            v.resolve(None, store.as_ref()).await.unwrap_err(),
            AuthError::MissingCredential
        );

        let token = v.issue("ghost", 3600).unwrap();
        assert_eq!(
            v.resolve(Some(&token), store.as_ref()).await.unwrap_err(),
            AuthError::UnknownPrincipal
        );

        store
            .put_user(&Principal {
                id: "u-1".into(),
                name: "Ada".into(),
            })
            .await
            .unwrap();
        let token = v.issue("u-1", 3600).unwrap();
        let principal = v.resolve(Some(&token), store.as_ref()).await.unwrap();
        assert_eq!(principal.name, "Ada");
    }
}
