use shared::{domain::MemoryId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend url must start with http:// or https://: {0}")]
    InvalidUrl(String),
    #[error("transport has shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MemoryApiError {
    #[error("memory {0} not found")]
    NotFound(MemoryId),
    #[error("backend rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("unexpected response body: {0}")]
    Decode(#[source] serde_json::Error),
}
