use thiserror::Error;

use crate::models::SubjectId;

/// Failures raised by the voting engine.
///
/// Only `Configuration` stops a session; the others are scoped to a single
/// observation, window or subject record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid descriptor: expected {expected} dimensions, got {actual}")]
    InvalidDescriptor { expected: usize, actual: usize },

    #[error("no frame acquired during window {window}")]
    AcquisitionGap { window: usize },

    #[error("write conflict for subject {subject_id}: {message}")]
    WriteConflict { subject_id: SubjectId, message: String },

    #[error("write failed for subject {subject_id}: {message}")]
    WriteFailure { subject_id: SubjectId, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not load subjects for cohort {cohort}: {message}")]
    DirectoryUnavailable { cohort: String, message: String },
}

/// Failures reported by store implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A record with the same key already exists.
    #[error("duplicate key: {0}")]
    Conflict(String),

    /// The backing store could not be reached; the write may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) => StoreError::Rejected(db.message().to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
