use cache::CacheError;
use shared::{domain::UserId, error::ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("server closed")]
    ServerClosed,
    #[error("no live connection for user {0}")]
    ConnectionNotFound(UserId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("membership lookup failed: {0}")]
    Membership(#[source] anyhow::Error),
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket write failed: {0}")]
    Write(String),
}

impl DeliveryError {
    /// Terminal conditions: the caller should fall back to offline caching
    /// rather than retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DeliveryError::ServerClosed | DeliveryError::ConnectionNotFound(_)
        )
    }
}
