//! Identity provider collaborator.
//!
//! Every upload operation needs an authenticated principal. The provider is
//! consulted once per request by the [`Principal`] extractor; a missing or
//! rejected bearer token ends the request with 401 before any handler runs.

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{errors::AppError, state::AppState};

/// The authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
}

impl Principal {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer token to a principal, or `None` if it is not valid.
    async fn authenticate(&self, bearer_token: &str) -> Option<Principal>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 JWT identity: the `sub` claim is the owner id.
pub struct JwtIdentity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Mint a token for `owner_id` valid for `ttl`.
    pub fn issue(&self, owner_id: &str, ttl: Duration) -> jsonwebtoken::errors::Result<String> {
        let exp = chrono::Utc::now().timestamp() as usize + ttl.as_secs() as usize;
        let claims = Claims {
            sub: owner_id.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn authenticate(&self, bearer_token: &str) -> Option<Principal> {
        match decode::<Claims>(bearer_token, &self.decoding, &self.validation) {
            Ok(data) if !data.claims.sub.trim().is_empty() => Some(Principal::new(data.claims.sub)),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "rejected bearer token");
                None
            }
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app = AppState::from_ref(state);
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::unauthenticated("missing bearer token"))?;
        app.identity
            .authenticate(token)
            .await
            .ok_or_else(|| AppError::unauthenticated("invalid or expired token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn issued_token_authenticates() {
        let identity = JwtIdentity::new("secret");
        let token = identity.issue("alice", Duration::from_secs(60)).unwrap();
        assert_eq!(
            identity.authenticate(&token).await,
            Some(Principal::new("alice"))
        );
    }

    #[tokio::test]
    async fn foreign_or_garbage_tokens_are_rejected() {
        let token = JwtIdentity::new("other")
            .issue("alice", Duration::from_secs(60))
            .unwrap();
        let identity = JwtIdentity::new("secret");
        assert_eq!(identity.authenticate(&token).await, None);
        assert_eq!(identity.authenticate("not-a-jwt").await, None);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
