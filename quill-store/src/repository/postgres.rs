//! PostgreSQL job store

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quill_core::clock::{Clock, SystemClock};
use quill_core::domain::job::{Claim, Job, JobKind, JobStatus, PauseReason};
use quill_core::domain::session::SessionState;
use quill_core::dto::job::{JobCounts, JobFilter, JobPage, Pagination, StatusOverride};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{CLAIM_RETRIES, JobStore};
use crate::error::{Result, StoreError};

const JOB_COLUMNS: &str = "id, kind, target_id, status, attempts, error, checkpoint, \
                           pause_reason, resume_at, created_at, started_at, completed_at, \
                           claim_token, lease_expires_at";

/// Job store backed by PostgreSQL
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Explains why a fenced update touched no row
    async fn transition_error(&self, claim: Claim, to: JobStatus) -> StoreError {
        match self.find_by_id(claim.job_id).await {
            Ok(Some(job)) if !job.status.can_transition_to(to) => StoreError::InvalidTransition {
                job_id: claim.job_id,
                from: job.status,
                to,
            },
            Ok(Some(_)) => StoreError::ClaimLost(claim.job_id),
            Ok(None) => StoreError::NotFound(claim.job_id),
            Err(e) => e,
        }
    }

    async fn fetch_session(&self) -> Result<SessionState> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT requests_this_session, session_reset_time, rate_limited_until
            FROM dispatch_session
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into).unwrap_or_default())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, kind: JobKind, target_id: &str) -> Result<Job> {
        let job = Job::new(kind, target_id, self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, target_id, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            "#,
        )
        .bind(job.id)
        .bind(kind.as_str())
        .bind(&job.target_id)
        .bind(JobStatus::Pending.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let row =
            sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Job::try_from).transpose()
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        for _ in 0..CLAIM_RETRIES {
            let now = self.clock.now();

            let candidate = sqlx::query_as::<_, (Uuid, String)>(
                r#"
                SELECT id, status
                FROM jobs
                WHERE (status = 'pending' AND (resume_at IS NULL OR resume_at <= $1))
                   OR (status = 'paused' AND pause_reason = 'rate_limit' AND resume_at <= $1)
                ORDER BY created_at ASC
                LIMIT 1
                "#,
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, observed)) = candidate else {
                return Ok(None);
            };

            // Succeeds only if nobody moved the job since we looked at it
            let claimed = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                UPDATE jobs
                SET status = 'running', started_at = $2, pause_reason = NULL, resume_at = NULL,
                    claim_token = $4, lease_expires_at = $5
                WHERE id = $1 AND status = $3
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(now)
            .bind(&observed)
            .bind(Uuid::new_v4())
            .bind(now + lease)
            .fetch_optional(&self.pool)
            .await?;

            match claimed {
                Some(row) => return Job::try_from(row).map(Some),
                None => debug!("Lost claim race for job {}, selecting again", id),
            }
        }

        Ok(None)
    }

    async fn renew_lease(&self, claim: Claim, lease: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(self.clock.now() + lease)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(StoreError::ClaimLost(claim.job_id));
        }
        Ok(())
    }

    async fn mark_completed(&self, claim: Claim) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = $3, checkpoint = NULL, error = NULL,
                pause_reason = NULL, resume_at = NULL, claim_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.transition_error(claim, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_paused(
        &self,
        claim: Claim,
        error: &str,
        reason: PauseReason,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'paused', error = $3, pause_reason = $4, resume_at = $5,
                claim_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(error)
        .bind(reason.as_str())
        .bind(resume_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.transition_error(claim, JobStatus::Paused).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = $3, attempts = attempts + 1, completed_at = $4,
                claim_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(error)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.transition_error(claim, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn requeue(
        &self,
        claim: Claim,
        error: &str,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', error = $3, attempts = attempts + 1,
                resume_at = $4, started_at = NULL, claim_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(error)
        .bind(resume_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(self.transition_error(claim, JobStatus::Pending).await);
        }
        Ok(())
    }

    async fn load_checkpoint(&self, id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (Option<String>,)>("SELECT checkpoint FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(checkpoint,)| checkpoint)
            .ok_or(StoreError::NotFound(id))
    }

    async fn store_checkpoint(&self, claim: Claim, checkpoint: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET checkpoint = $3
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(checkpoint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return match self.find_by_id(claim.job_id).await? {
                Some(_) => Err(StoreError::ClaimLost(claim.job_id)),
                None => Err(StoreError::NotFound(claim.job_id)),
            };
        }
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, pagination: Pagination) -> Result<JobPage> {
        let mut count_query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs WHERE TRUE");
        push_filter(&mut count_query, filter);
        let (total,): (i64,) = count_query.build_query_as().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(pagination.offset));

        let rows: Vec<JobRow> = query.build_query_as().fetch_all(&self.pool).await?;
        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
            limit: pagination.limit,
            offset: pagination.offset,
        })
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count);
        }
        Ok(counts)
    }

    async fn override_status(&self, id: Uuid, update: &StatusOverride) -> Result<Job> {
        let status = update.status.status();
        let completed_at = (status == JobStatus::Failed).then(|| self.clock.now());

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = $2, error = COALESCE($3, error), pause_reason = $4,
                resume_at = $5, completed_at = $6, started_at = NULL,
                claim_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status <> 'completed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(update.error.as_deref())
        .bind(update.status.pause_reason().map(|r| r.as_str()))
        .bind(update.resume_at)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Job::try_from(row);
        }
        match self.find_by_id(id).await? {
            Some(job) => Err(StoreError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: status,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn requeue_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', started_at = NULL, claim_token = NULL, lease_expires_at = NULL
            WHERE status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            "#,
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn session(&self) -> Result<SessionState> {
        self.fetch_session().await
    }

    async fn record_request(&self) -> Result<SessionState> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE dispatch_session
            SET requests_this_session = CASE
                    WHEN session_reset_time IS NOT NULL AND session_reset_time <= $1 THEN 1
                    ELSE requests_this_session + 1
                END,
                session_reset_time = CASE
                    WHEN session_reset_time IS NOT NULL AND session_reset_time <= $1 THEN NULL
                    ELSE session_reset_time
                END
            WHERE id = 1
            RETURNING requests_this_session, session_reset_time, rate_limited_until
            "#,
        )
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into).unwrap_or_default())
    }

    async fn set_rate_limited_until(&self, until: DateTime<Utc>) -> Result<SessionState> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE dispatch_session
            SET rate_limited_until = GREATEST(COALESCE(rate_limited_until, $1), $1),
                session_reset_time = GREATEST(COALESCE(session_reset_time, $1), $1)
            WHERE id = 1
            RETURNING requests_this_session, session_reset_time, rate_limited_until
            "#,
        )
        .bind(until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into).unwrap_or_default())
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(kind) = filter.kind {
        query.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(target_id) = &filter.target_id {
        query.push(" AND target_id = ").push_bind(target_id.clone());
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    target_id: String,
    status: String,
    attempts: i32,
    error: Option<String>,
    checkpoint: Option<String>,
    pause_reason: Option<String>,
    resume_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    claim_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            kind: row.kind.parse()?,
            target_id: row.target_id,
            status: row.status.parse()?,
            attempts: row.attempts,
            error: row.error,
            checkpoint: row.checkpoint,
            pause_reason: row.pause_reason.map(|r| r.parse()).transpose()?,
            resume_at: row.resume_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            claim_token: row.claim_token,
            lease_expires_at: row.lease_expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    requests_this_session: i64,
    session_reset_time: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
}

impl From<SessionRow> for SessionState {
    fn from(row: SessionRow) -> Self {
        SessionState {
            requests_this_session: row.requests_this_session,
            session_reset_time: row.session_reset_time,
            rate_limited_until: row.rate_limited_until,
        }
    }
}
