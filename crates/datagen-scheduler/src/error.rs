use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialisation of stored task configuration failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP client for webhook delivery could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Storage sink I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cron expression does not parse or never fires.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The timezone is not a known IANA name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Rejected task or sink configuration.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// The task exists but belongs to another owner.
    #[error("Permission denied for task {id}")]
    PermissionDenied { id: String },

    /// The operation needs a schedulable task.
    #[error("Task {id} is not active (status: {status})")]
    TaskInactive { id: String, status: String },
}

impl SchedulerError {
    /// Short error code string for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Http(_) => "HTTP_ERROR",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::InvalidCron { .. } => "INVALID_CRON",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SchedulerError::TaskInactive { .. } => "TASK_INACTIVE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
