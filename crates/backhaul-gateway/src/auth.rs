//! Pluggable endpoint authentication.
//!
//! Every gateway endpoint runs its authenticator before doing any work;
//! the policy itself is swappable. The default accepts everything, which
//! matches deployments where the gateway sits behind an authenticating
//! front. A shared-token check is provided for direct exposure.

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;

/// Authentication failure, always surfaced as a 401 before any upgrade.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Header-based authentication hook checked at every endpoint.
#[async_trait]
pub trait Authenticate: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError>;
}

/// Accepts every caller.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticate for AllowAll {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Shared-token check on the `Authorization: Bearer <token>` header.
#[derive(Debug)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticate for BearerToken {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let value = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;

        let token = value
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidCredentials)?;

        if token == self.token {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_allow_all_accepts_empty_headers() {
        assert!(AllowAll.authenticate(&HeaderMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let auth = BearerToken::new("secret");

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(auth.authenticate(&headers).await.is_ok());

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AuthError::InvalidCredentials)
        ));

        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(AuthError::MissingCredentials)
        ));
    }
}
