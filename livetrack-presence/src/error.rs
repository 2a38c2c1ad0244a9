//! Error types for the presence coordinator

use thiserror::Error;

/// Presence error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Repository error: {0}")]
    Repository(#[from] livetrack_core::Error),

    #[error("This coordinator is an observer and has no tracker identity")]
    NotATracker,

    #[error("Coordinator already released")]
    Released,

    #[error("Coordinator driver stopped")]
    DriverGone,
}

/// Result type for presence operations
pub type Result<T> = std::result::Result<T, Error>;
