use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lease service error: {0}")]
    Lease(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonitorError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
