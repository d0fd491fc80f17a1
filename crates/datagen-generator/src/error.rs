use thiserror::Error;

/// Errors raised while generating or rendering a batch.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The field asks for a generator type this implementation does not know.
    #[error("unsupported field type '{field_type}' for field '{field}'")]
    UnsupportedType { field: String, field_type: String },

    /// The field's options are missing or inconsistent.
    #[error("invalid options for field '{field}': {reason}")]
    InvalidOptions { field: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generation failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, GenerateError>;
