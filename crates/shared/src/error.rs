use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure to turn a wire frame into a typed message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("message type {0:?} is not accepted from clients")]
    UnexpectedType(crate::protocol::MessageType),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
