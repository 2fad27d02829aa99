use std::sync::Arc;

use async_trait::async_trait;
use axum_extra::headers::{authorization::Bearer, Authorization};

use crate::errors::AppError;

/// Maps a presented credential onto the identity the connection acts as.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, AppError>;
}

/// Accepts exactly one server key, issued to one agent identity.
#[derive(Debug, Clone)]
pub struct StaticTokenValidator {
    server_key: Arc<str>,
    agent_id: Arc<str>,
}

impl StaticTokenValidator {
    pub fn new(server_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            server_key: Arc::from(server_key.into()),
            agent_id: Arc::from(agent_id.into()),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, AppError> {
        if token.is_empty() {
            return Err(AppError::unauthorized("missing_token", "missing server key"));
        }

        if token != self.server_key.as_ref() {
            return Err(AppError::unauthorized("invalid_token", "invalid server key"));
        }

        Ok(self.agent_id.to_string())
    }
}

/// Picks the credential a socket presented. The `token` query parameter wins
/// over the header; form decoding turns `+` into a space, so it is restored.
pub fn presented_token(
    query_token: Option<&str>,
    auth_header: Option<&Authorization<Bearer>>,
) -> Option<String> {
    query_token
        .map(|token| token.trim().replace(' ', "+"))
        .filter(|token| !token.is_empty())
        .or_else(|| auth_header.map(|auth| auth.token().to_string()))
}

pub async fn authenticate(
    validator: &dyn TokenValidator,
    token: Option<String>,
) -> Result<String, AppError> {
    let Some(token) = token else {
        return Err(AppError::unauthorized(
            "missing_token",
            "missing token query parameter or authorization header",
        ));
    };

    validator.validate(&token).await
}
