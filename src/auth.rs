use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials available: {0}")]
    Missing(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Supplies a bearer token on demand.
///
/// Implementations own refresh-on-expiry; callers just ask for a token
/// immediately before each connection or request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

/// Token provider backed by a fixed string, for service-account tokens
/// handed in via the environment and for tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::Missing("empty static token".to_string()));
        }
        Ok(self.token.clone())
    }
}
