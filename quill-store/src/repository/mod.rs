//! Repository Module
//!
//! Data access layer for jobs and the shared dispatch session.
//!
//! The [`JobStore`] is the single shared mutable resource of the pipeline.
//! Every status-changing write is one conditional statement guarded by the
//! status the caller expects, so concurrent dispatchers never both win.
//!
//! A claim hands out a [`Claim`] token and a lease. Dispatcher writes to a
//! running job are fenced on that token, and a lease that is not renewed
//! lapses so the job can be recovered by any dispatcher.

mod memory;
mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quill_core::domain::job::{Claim, Job, JobKind, PauseReason};
use quill_core::domain::session::SessionState;
use quill_core::dto::job::{JobCounts, JobFilter, JobPage, Pagination, StatusOverride};
use uuid::Uuid;

use crate::error::Result;

/// How many times a claim re-selects after losing a race before giving up
/// for this tick
pub const CLAIM_RETRIES: usize = 5;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new pending job
    async fn enqueue(&self, kind: JobKind, target_id: &str) -> Result<Job>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// Atomically takes ownership of the oldest eligible job
    ///
    /// Eligible jobs are pending ones whose `resume_at` has passed (or is
    /// unset) and rate-limit pauses whose deadline has passed. Returns the job
    /// already moved to `running` under a fresh claim token, leased for
    /// `lease`, or `None` when nothing is eligible.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>>;

    /// Extends the lease of a held job to `lease` from now
    async fn renew_lease(&self, claim: Claim, lease: Duration) -> Result<()>;

    /// running -> completed, dropping the checkpoint in the same write
    async fn mark_completed(&self, claim: Claim) -> Result<()>;

    /// running -> paused; the checkpoint is left untouched
    async fn mark_paused(
        &self,
        claim: Claim,
        error: &str,
        reason: PauseReason,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// running -> failed, counting the final attempt
    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<()>;

    /// running -> pending, counting the attempt; claimable again at `resume_at`
    async fn requeue(
        &self,
        claim: Claim,
        error: &str,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Raw checkpoint text of a job
    async fn load_checkpoint(&self, id: Uuid) -> Result<Option<String>>;

    /// Replaces (or clears, with `None`) the raw checkpoint text of a held job
    async fn store_checkpoint(&self, claim: Claim, checkpoint: Option<&str>) -> Result<()>;

    async fn list(&self, filter: &JobFilter, pagination: Pagination) -> Result<JobPage>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Administrative override, outside the dispatcher's transition rules
    ///
    /// Drops any claim on the job. Completed jobs cannot be overridden.
    async fn override_status(&self, id: Uuid, update: &StatusOverride) -> Result<Job>;

    /// Returns running jobs whose lease has lapsed to `pending` without
    /// consuming an attempt; their checkpoint is kept
    async fn requeue_expired(&self) -> Result<u64>;

    async fn session(&self) -> Result<SessionState>;

    /// Counts one provider request, starting a new session window when the
    /// previous one has reset
    async fn record_request(&self) -> Result<SessionState>;

    /// Suspends dispatch until `until`; never shortens an existing suspension
    async fn set_rate_limited_until(&self, until: DateTime<Utc>) -> Result<SessionState>;
}
