use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("session {0} has no valid identity")]
    InvalidIdentity(String),
    #[error("malformed client event: {0}")]
    MalformedClientEvent(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::StoreUnavailable(_) => "store_unavailable",
            RelayError::InvalidIdentity(_) => "invalid_identity",
            RelayError::MalformedClientEvent(_) => "malformed_client_event",
            RelayError::Encode(_) => "encode",
        }
    }
}
