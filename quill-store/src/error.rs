//! Store error types

use quill_core::domain::job::{JobStatus, ParseLabelError};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    NotFound(Uuid),

    /// A guarded status update found the job in an unexpected state
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// The lease lapsed and the job now belongs to another claim (or to none)
    #[error("job {0} is no longer held by this claim")]
    ClaimLost(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a label this build does not understand
    #[error("corrupt job row: {0}")]
    CorruptRow(#[from] ParseLabelError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the caller no longer owns the job it tried to write
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, Self::ClaimLost(_) | Self::InvalidTransition { .. })
    }

    /// Whether repeating the same write may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
