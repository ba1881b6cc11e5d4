//! Error types for gpuadmit

use thiserror::Error;

/// Main error type for gpuadmit
#[derive(Error, Debug)]
pub enum AdmitError {
    /// Input rejected at the call boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Category is not present in the priority table
    #[error("Unknown job category: {0}")]
    UnknownCategory(String),

    /// Task id is not known to the registry
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Settings could not be written; nothing was applied
    #[error("Failed to persist {}: {reason}", fields.join(", "))]
    Persistence { fields: Vec<String>, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// GPU error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuadmit operations
pub type AdmitResult<T> = Result<T, AdmitError>;

impl AdmitError {
    /// Whether the error was caused by the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AdmitError::Validation(_) | AdmitError::UnknownCategory(_)
        )
    }
}

impl From<serde_json::Error> for AdmitError {
    fn from(err: serde_json::Error) -> Self {
        AdmitError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AdmitError {
    fn from(err: toml::de::Error) -> Self {
        AdmitError::Config(err.to_string())
    }
}
