//! In-memory job store
//!
//! Keeps the same conditional-update discipline as the PostgreSQL store: a
//! claim selects a candidate and then updates it only if its status is still
//! the one observed, re-selecting when another claimer got there first.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quill_core::clock::{Clock, SystemClock};
use quill_core::domain::job::{Claim, Job, JobKind, JobStatus, PauseReason};
use quill_core::domain::session::SessionState;
use quill_core::dto::job::{JobCounts, JobFilter, JobPage, Pagination, StatusOverride};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use super::{CLAIM_RETRIES, JobStore};
use crate::error::{Result, StoreError};

#[derive(Default)]
struct State {
    /// Insertion order doubles as FIFO order
    jobs: Vec<Job>,
    session: SessionState,
}

impl State {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    /// Looks up a job `claim` still holds, about to move to `to`
    fn transition(&mut self, claim: Claim, to: JobStatus) -> Result<&mut Job> {
        let job = self.job_mut(claim.job_id)?;
        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                job_id: claim.job_id,
                from: job.status,
                to,
            });
        }
        if job.claim_token != Some(claim.token) {
            return Err(StoreError::ClaimLost(claim.job_id));
        }
        Ok(job)
    }

    /// Looks up a running job `claim` still holds
    fn held_job(&mut self, claim: Claim) -> Result<&mut Job> {
        let job = self.job_mut(claim.job_id)?;
        if job.status != JobStatus::Running || job.claim_token != Some(claim.token) {
            return Err(StoreError::ClaimLost(claim.job_id));
        }
        Ok(job)
    }
}

/// Releases a job from whatever claim holds it
fn release(job: &mut Job) {
    job.claim_token = None;
    job.lease_expires_at = None;
}

/// Job store held in process memory
///
/// Cloning shares the underlying state, so several dispatchers in one
/// process can poll the same store.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Candidate selection half of a claim
    fn select_candidate(&self, now: DateTime<Utc>) -> Option<(Uuid, JobStatus)> {
        self.state()
            .jobs
            .iter()
            .find(|job| job.is_claimable(now))
            .map(|job| (job.id, job.status))
    }

    /// Conditional update half of a claim
    fn try_claim(
        &self,
        id: Uuid,
        observed: JobStatus,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Option<Job> {
        let mut state = self.state();
        let job = state.jobs.iter_mut().find(|job| job.id == id)?;
        if job.status != observed
            || !job.is_claimable(now)
            || !job.status.can_transition_to(JobStatus::Running)
        {
            return None;
        }

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.pause_reason = None;
        job.resume_at = None;
        job.claim_token = Some(Uuid::new_v4());
        job.lease_expires_at = Some(now + lease);
        Some(job.clone())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, kind: JobKind, target_id: &str) -> Result<Job> {
        let job = Job::new(kind, target_id, self.clock.now());
        self.state().jobs.push(job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        for _ in 0..CLAIM_RETRIES {
            let now = self.clock.now();
            let Some((id, observed)) = self.select_candidate(now) else {
                return Ok(None);
            };

            // Let racing claimers interleave between select and update
            tokio::task::yield_now().await;

            match self.try_claim(id, observed, now, lease) {
                Some(job) => return Ok(Some(job)),
                None => debug!("Lost claim race for job {}, selecting again", id),
            }
        }

        Ok(None)
    }

    async fn renew_lease(&self, claim: Claim, lease: Duration) -> Result<()> {
        let now = self.clock.now();
        self.state().held_job(claim)?.lease_expires_at = Some(now + lease);
        Ok(())
    }

    async fn mark_completed(&self, claim: Claim) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        let job = state.transition(claim, JobStatus::Completed)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.checkpoint = None;
        job.error = None;
        job.pause_reason = None;
        job.resume_at = None;
        release(job);
        Ok(())
    }

    async fn mark_paused(
        &self,
        claim: Claim,
        error: &str,
        reason: PauseReason,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state.transition(claim, JobStatus::Paused)?;
        job.status = JobStatus::Paused;
        job.error = Some(error.to_string());
        job.pause_reason = Some(reason);
        job.resume_at = resume_at;
        release(job);
        Ok(())
    }

    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        let job = state.transition(claim, JobStatus::Failed)?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.attempts += 1;
        job.completed_at = Some(now);
        release(job);
        Ok(())
    }

    async fn requeue(
        &self,
        claim: Claim,
        error: &str,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state();
        let job = state.transition(claim, JobStatus::Pending)?;
        job.status = JobStatus::Pending;
        job.error = Some(error.to_string());
        job.attempts += 1;
        job.resume_at = resume_at;
        job.started_at = None;
        release(job);
        Ok(())
    }

    async fn load_checkpoint(&self, id: Uuid) -> Result<Option<String>> {
        Ok(self.state().job_mut(id)?.checkpoint.clone())
    }

    async fn store_checkpoint(&self, claim: Claim, checkpoint: Option<&str>) -> Result<()> {
        self.state().held_job(claim)?.checkpoint = checkpoint.map(str::to_string);
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, pagination: Pagination) -> Result<JobPage> {
        let state = self.state();
        let matching: Vec<&Job> = state
            .jobs
            .iter()
            .rev()
            .filter(|job| filter.matches(job))
            .collect();

        let jobs = matching
            .iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .map(|job| (*job).clone())
            .collect();

        Ok(JobPage {
            jobs,
            total: matching.len() as u64,
            limit: pagination.limit,
            offset: pagination.offset,
        })
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in &self.state().jobs {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn override_status(&self, id: Uuid, update: &StatusOverride) -> Result<Job> {
        let now = self.clock.now();
        let mut state = self.state();
        let job = state.job_mut(id)?;
        let status = update.status.status();
        if job.status == JobStatus::Completed {
            return Err(StoreError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        if let Some(error) = &update.error {
            job.error = Some(error.clone());
        }
        job.pause_reason = update.status.pause_reason();
        job.resume_at = update.resume_at;
        job.completed_at = (status == JobStatus::Failed).then_some(now);
        job.started_at = None;
        release(job);
        Ok(job.clone())
    }

    async fn requeue_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut recovered = 0;
        for job in self.state().jobs.iter_mut() {
            if job.is_lease_expired(now) {
                job.status = JobStatus::Pending;
                job.started_at = None;
                release(job);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn session(&self) -> Result<SessionState> {
        Ok(self.state().session.clone())
    }

    async fn record_request(&self) -> Result<SessionState> {
        let now = self.clock.now();
        let mut state = self.state();
        let session = &mut state.session;

        if session.session_reset_time.is_some_and(|reset| reset <= now) {
            session.requests_this_session = 1;
            session.session_reset_time = None;
        } else {
            session.requests_this_session += 1;
        }
        Ok(session.clone())
    }

    async fn set_rate_limited_until(&self, until: DateTime<Utc>) -> Result<SessionState> {
        let mut state = self.state();
        let session = &mut state.session;

        session.rate_limited_until = Some(session.rate_limited_until.map_or(until, |u| u.max(until)));
        session.session_reset_time = Some(session.session_reset_time.map_or(until, |r| r.max(until)));
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::clock::ManualClock;
    use quill_core::dto::job::OverrideStatus;

    fn lease() -> Duration {
        Duration::minutes(5)
    }

    fn store_with_clock() -> (InMemoryJobStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryJobStore::with_clock(Arc::new(clock.clone())), clock)
    }

    async fn claim(store: &InMemoryJobStore) -> Claim {
        store.claim_next(lease()).await.unwrap().unwrap().claim().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_job() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(JobKind::ChapterGeneration, "chapter-1").await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.checkpoint.is_none());
        assert!(job.claim().is_none());
        assert_eq!(store.find_by_id(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_leased() {
        let (store, clock) = store_with_clock();
        let first = store.enqueue(JobKind::ChapterGeneration, "a").await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = store.enqueue(JobKind::ChapterGeneration, "b").await.unwrap();

        let claimed = store.claim_next(lease()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(claimed.claim_token.is_some());
        assert_eq!(claimed.lease_expires_at, Some(clock.now() + lease()));

        let claimed = store.claim_next(lease()).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next(lease()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_exactly_one_winner() {
        for _ in 0..20 {
            let store = InMemoryJobStore::new();
            store.enqueue(JobKind::EditorialAnalysis, "book").await.unwrap();

            let a = tokio::spawn({
                let store = store.clone();
                async move { store.claim_next(lease()).await.unwrap() }
            });
            let b = tokio::spawn({
                let store = store.clone();
                async move { store.claim_next(lease()).await.unwrap() }
            });

            let results = [a.await.unwrap(), b.await.unwrap()];
            assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_guarded_updates_reject_jobs_not_running() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(JobKind::MultiPassEditing, "x").await.unwrap();
        let unclaimed = Claim {
            job_id: job.id,
            token: Uuid::new_v4(),
        };

        let err = store.mark_completed(unclaimed).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
                ..
            }
        ));
        let err = store
            .mark_paused(unclaimed, "limited", PauseReason::RateLimit, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Paused,
                ..
            }
        ));
        assert!(matches!(
            store.requeue(unclaimed, "boom", None).await.unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
        assert!(matches!(
            store.mark_failed(unclaimed, "boom").await.unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
        assert!(
            store
                .mark_completed(Claim {
                    job_id: Uuid::new_v4(),
                    token: Uuid::new_v4(),
                })
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(
            store.find_by_id(job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_paused_job_cannot_be_completed_or_requeued() {
        let store = InMemoryJobStore::new();
        store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;
        store
            .mark_paused(held, "limited", PauseReason::RateLimit, None)
            .await
            .unwrap();

        for err in [
            store.mark_completed(held).await.unwrap_err(),
            store.requeue(held, "again", None).await.unwrap_err(),
            store.mark_failed(held, "again").await.unwrap_err(),
        ] {
            assert!(matches!(
                err,
                StoreError::InvalidTransition {
                    from: JobStatus::Paused,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_writes_are_fenced_on_the_claim_token() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;
        let forged = Claim {
            job_id: job.id,
            token: Uuid::new_v4(),
        };

        assert!(matches!(
            store.mark_completed(forged).await.unwrap_err(),
            StoreError::ClaimLost(_)
        ));
        assert!(matches!(
            store.store_checkpoint(forged, Some("{}")).await.unwrap_err(),
            StoreError::ClaimLost(_)
        ));
        assert!(matches!(
            store.renew_lease(forged, lease()).await.unwrap_err(),
            StoreError::ClaimLost(_)
        ));

        store.store_checkpoint(held, Some("{}")).await.unwrap();
        store.mark_completed(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_lapsed_holder_cannot_finalize_new_claim() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let first = claim(&store).await;
        store.store_checkpoint(first, Some("{\"a\":1}")).await.unwrap();

        clock.advance(lease() + Duration::minutes(1));
        assert_eq!(store.requeue_expired().await.unwrap(), 1);
        let second = claim(&store).await;
        assert_ne!(first.token, second.token);

        assert!(store.mark_completed(first).await.unwrap_err().is_claim_lost());
        assert!(
            store
                .store_checkpoint(first, Some("stale"))
                .await
                .unwrap_err()
                .is_claim_lost()
        );

        let current = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.claim(), Some(second));
        assert_eq!(current.checkpoint.as_deref(), Some("{\"a\":1}"));
        assert_eq!(current.attempts, 0);

        store.mark_completed(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_renewed_lease_is_not_recovered() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;

        clock.advance(Duration::minutes(4));
        store.renew_lease(held, lease()).await.unwrap();
        clock.advance(Duration::minutes(4));

        assert_eq!(store.requeue_expired().await.unwrap(), 0);
        let current = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.lease_expires_at, Some(clock.now() + Duration::minutes(1)));
    }

    #[tokio::test]
    async fn test_completion_drops_checkpoint() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;
        store.store_checkpoint(held, Some("{}")).await.unwrap();

        store.mark_completed(held).await.unwrap();

        let done = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.checkpoint.is_none());
        assert!(done.claim().is_none());
        assert!(done.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_requeue_counts_attempt_and_honours_resume_at() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;

        let retry_at = clock.now() + Duration::seconds(30);
        store.requeue(held, "timeout", Some(retry_at)).await.unwrap();

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error.as_deref(), Some("timeout"));
        assert!(stored.claim().is_none());

        assert!(store.claim_next(lease()).await.unwrap().is_none());
        clock.advance(Duration::seconds(30));
        assert_eq!(store.claim_next(lease()).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_rate_limit_pause_is_claimable_after_deadline() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;

        let deadline = clock.now() + Duration::minutes(10);
        store
            .mark_paused(held, "rate limited", PauseReason::RateLimit, Some(deadline))
            .await
            .unwrap();
        assert!(store.claim_next(lease()).await.unwrap().is_none());

        clock.set(deadline);
        let claimed = store.claim_next(lease()).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 0);
        assert!(claimed.pause_reason.is_none());
        assert_ne!(claimed.claim(), Some(held));
    }

    #[tokio::test]
    async fn test_admin_pause_waits_for_override() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();

        let paused = store
            .override_status(
                job.id,
                &StatusOverride {
                    status: OverrideStatus::Paused,
                    error: Some("held by editor".into()),
                    resume_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(paused.pause_reason, Some(PauseReason::Admin));

        clock.advance(Duration::days(1));
        assert!(store.claim_next(lease()).await.unwrap().is_none());

        store
            .override_status(
                job.id,
                &StatusOverride {
                    status: OverrideStatus::Pending,
                    error: None,
                    resume_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.claim_next(lease()).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_override_drops_claim_and_refuses_completed_jobs() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(JobKind::ChapterGeneration, "c").await.unwrap();
        let held = claim(&store).await;
        let fail = StatusOverride {
            status: OverrideStatus::Failed,
            error: Some("cancelled by operator".into()),
            resume_at: None,
        };

        let failed = store.override_status(job.id, &fail).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.claim().is_none());
        assert!(store.mark_completed(held).await.unwrap_err().is_claim_lost());

        let done = store.enqueue(JobKind::ChapterGeneration, "d").await.unwrap();
        let held = claim(&store).await;
        store.mark_completed(held).await.unwrap();
        let err = store.override_status(done.id, &fail).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates_newest_first() {
        let (store, clock) = store_with_clock();
        for i in 0..5 {
            store.enqueue(JobKind::ChapterGeneration, "book-1").await.unwrap();
            clock.advance(Duration::seconds(i + 1));
        }
        let other = store.enqueue(JobKind::EditorialAnalysis, "book-2").await.unwrap();

        let filter = JobFilter {
            target_id: Some("book-1".into()),
            ..Default::default()
        };
        let page = store.list(&filter, Pagination::new(Some(2), Some(1))).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs[0].created_at > page.jobs[1].created_at);

        let all = store.list(&JobFilter::default(), Pagination::default()).await.unwrap();
        assert_eq!(all.jobs[0].id, other.id);
    }

    #[tokio::test]
    async fn test_counts_per_status() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(JobKind::ChapterGeneration, "x").await.unwrap();
        }
        let held = claim(&store).await;
        store.mark_completed(held).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total, 3);
    }

    #[tokio::test]
    async fn test_requeue_expired_keeps_attempts_and_checkpoint() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(JobKind::ChapterGeneration, "x").await.unwrap();
        let held = claim(&store).await;
        store.store_checkpoint(held, Some("{}")).await.unwrap();

        assert_eq!(store.requeue_expired().await.unwrap(), 0);
        clock.advance(lease());
        assert_eq!(store.requeue_expired().await.unwrap(), 1);

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.checkpoint.as_deref(), Some("{}"));
        assert!(stored.claim().is_none());
    }

    #[tokio::test]
    async fn test_session_window_resets_request_count() {
        let (store, clock) = store_with_clock();
        store.record_request().await.unwrap();
        store.record_request().await.unwrap();

        let reset = clock.now() + Duration::minutes(5);
        store.set_rate_limited_until(reset).await.unwrap();
        // An earlier deadline never shortens the suspension
        let session = store
            .set_rate_limited_until(clock.now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(session.rate_limited_until, Some(reset));
        assert_eq!(session.requests_this_session, 2);

        clock.set(reset);
        let session = store.record_request().await.unwrap();
        assert_eq!(session.requests_this_session, 1);
        assert_eq!(session.session_reset_time, None);
    }
}
