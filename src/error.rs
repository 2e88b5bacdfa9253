//! Error types for the analysis engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// Tool execution failed. Recovered locally: surfaced to the model
    /// as a structured error payload so it can retry or work around it.
    #[error("Tool error ({tool}): {message}")]
    ToolExecution { tool: String, message: String },

    /// Even adaptive summarization could not fit the stage input.
    /// Fatal for the run; the stage is identified for the caller.
    #[error("Token budget exceeded in stage {stage}: {message}")]
    BudgetExceeded { stage: String, message: String },

    /// A value violated a declared schema invariant. Always names the
    /// offending field; recovered via fallback extraction or field
    /// omission, never silent coercion.
    #[error("Schema violation on field '{field}': {message}")]
    SchemaValidation { field: String, message: String },

    /// Provider transport failed after bounded retries.
    #[error("Provider transport error: {0}")]
    ProviderTransport(String),

    /// Model output was unparseable where a parseable shape was required.
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    /// Agentic loop hit its iteration cap without a final answer.
    #[error("Iteration limit exhausted: {0}")]
    IterationsExhausted(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Run cancelled during stage {0}")]
    Cancelled(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the error aborts the whole run rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExceeded { .. }
                | EngineError::ProviderTransport(_)
                | EngineError::IterationsExhausted(_)
                | EngineError::Cancelled(_)
        )
    }
}
