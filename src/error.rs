//! Error Handling Infrastructure
//!
//! This module defines the error type shared by the library components.
//! All errors are structured and map to stable error codes.
//!
//! Validation problems and execution failures are *not* errors: they travel as
//! data (`ValidationResult`, `ExecutionResult`) so the orchestrator can act on
//! them. `AgentError` covers everything that prevents a component from producing
//! such a value in the first place.
//!
//! # Error Categories
//! - `Connection`: metadata or execution connection could not be established
//! - `NotInitialized`: the schema catalog was read before its first refresh
//! - `Translation`: the model output contained no usable single statement
//! - `TranslationTimeout`: the text-generation call exceeded its timeout
//! - `Generation`: the text-generation capability itself failed
//! - `Cancelled`: the request was cancelled at a suspension point
//! - `InvalidInput`: malformed input or missing required parameters
//! - `Engine`: engine-specific introspection errors
//! - `Config`: configuration file or connection registry errors

use thiserror::Error;

/// Main error type for sqlagent operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Database connection failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Schema catalog has never been refreshed
    #[error("Schema catalog not initialized")]
    NotInitialized,

    /// No parseable statement could be extracted from the model output
    #[error("Translation failed: {0}")]
    Translation(String),

    /// Text generation exceeded its timeout
    #[error("Translation timed out after {0}ms")]
    TranslationTimeout(u64),

    /// Text-generation capability failed (transport, provider error, ...)
    #[error("Text generation failed: {0}")]
    Generation(String),

    /// Request cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific database error
    #[error("Engine error ({engine}): {detail}")]
    Engine { engine: String, detail: String },

    /// Configuration error (file not found, invalid JSON, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Convert error to error code string for JSON output
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_FAILED",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Translation(_) => "TRANSLATION_FAILED",
            Self::TranslationTimeout(_) => "TRANSLATION_TIMEOUT",
            Self::Generation(_) => "GENERATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Engine { .. } => "ENGINE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message (no credentials or connection strings)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether the orchestrator may retry translation after this error
    #[must_use]
    pub const fn is_repairable(&self) -> bool {
        matches!(self, Self::Translation(_))
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a translation error
    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation(message.into())
    }

    /// Create a text-generation error
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Engine { engine: engine.into(), detail: detail.into() }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for sqlagent operations
pub type Result<T> = std::result::Result<T, AgentError>;
