use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatagenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown export format: {0}")]
    UnknownExportFormat(String),
}

impl DatagenError {
    /// Short error code string for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            DatagenError::Config(_) => "CONFIG_ERROR",
            DatagenError::UnknownExportFormat(_) => "UNKNOWN_EXPORT_FORMAT",
        }
    }
}

pub type Result<T> = std::result::Result<T, DatagenError>;
