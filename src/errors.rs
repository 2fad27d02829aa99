use thiserror::Error;

use crate::relay::registry::{ConnectionId, ConnectionState};

/// Failures reported by the external collaborators (token validation).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("connection {0} is not a ready provider")]
    NotProvider(ConnectionId),
    #[error("no provider connected for operation {0}")]
    ToolNotConnected(String),
    #[error("no pending request for id {0}")]
    UnknownRequest(String),
    #[error("request id {0} is already pending")]
    DuplicateRequest(String),
}
