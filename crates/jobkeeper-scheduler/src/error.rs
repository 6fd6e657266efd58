use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The backing store is unavailable or misbehaved.
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job description broke one or more rules. Every violation is listed.
    #[error("Invalid job: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A non-terminal job with the same ID is already scheduled.
    #[error("Job already scheduled: {id}")]
    JobExists { id: String },

    #[error("Job {id} cannot be changed while {status}")]
    InvalidTransition { id: String, status: JobStatus },
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) | SchedulerError::Repository(_) => "REPOSITORY_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobExists { .. } => "JOB_EXISTS",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Why a recipient call did not succeed. Always recoverable: it only spends
/// the job's retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("recipient answered {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The call was torn down before it produced a result.
    #[error("execution interrupted: {0}")]
    Interrupted(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}
