//! Error types for the expense assistant core

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Resolution error: {0}")]
    ResolutionError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
