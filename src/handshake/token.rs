//! Bearer token source

use crate::tunnel::TunnelError;
use async_trait::async_trait;

/// Supplies an OAuth access token for each handshake.
///
/// Called once per carrier; implementations should refresh as needed
/// rather than rely on the session caching anything.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, TunnelError>;
}

/// Always hands out the same token
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, TunnelError> {
        if self.0.is_empty() {
            return Err(TunnelError::Token("empty access token".to_string()));
        }
        Ok(self.0.clone())
    }
}
