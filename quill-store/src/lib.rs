//! Quill Store
//!
//! Durable job state for the Quill pipeline.
//!
//! - Repository: the [`JobStore`] trait with PostgreSQL and in-memory backends
//! - Checkpoint: step-level progress records embedded in each job
//! - Guard: the account-wide rate limit circuit breaker, persisted in the store

pub mod checkpoint;
pub mod db;
pub mod error;
pub mod guard;
pub mod repository;

pub use checkpoint::CheckpointManager;
pub use error::{Result, StoreError};
pub use guard::{GuardDecision, RateLimitGuard};
pub use repository::{InMemoryJobStore, JobStore, PgJobStore};
