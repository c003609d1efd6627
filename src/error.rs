//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("queue is full")]
    QueueFull,

    #[error("queue not started")]
    QueueNotStarted,

    #[error("queue already started")]
    QueueAlreadyStarted,

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Target error: {0}")]
    Target(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    pub fn target(msg: impl Into<String>) -> Self {
        Self::Target(msg.into())
    }
}
