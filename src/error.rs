//! Error types for the durable workflow execution engine

use thiserror::Error;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("UUID parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("Invalid duration string: {0}")]
    InvalidDuration(String),

    #[error("Unknown duration unit: {0}")]
    UnknownUnit(String),

    #[error("Sleep duration overflows the platform's safe integer range: {0}")]
    DurationOverflow(String),

    #[error("do(\"{0}\") was called without an executor function")]
    MissingExecutor(String),

    #[error("Step timed out: {0}")]
    StepTimeout(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
