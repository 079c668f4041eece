//! Dispatcher
//!
//! Cooperative polling loop. Each tick consults the rate limit guard, claims
//! at most one job, runs its handler from the job's last checkpoint and
//! applies the resulting status transition.
//!
//! Correctness across several dispatchers rests only on the store: the claim
//! is atomic, and every write to a running job is fenced on the claim token.
//! While a handler runs, the dispatcher renews the claim's lease; a job whose
//! lease lapses (its dispatcher crashed or could not finalize it) is returned
//! to `pending` by the next tick of any dispatcher.

use chrono::{DateTime, Utc};
use quill_core::clock::{Clock, SystemClock};
use quill_core::domain::job::{Claim, Job, PauseReason};
use quill_store::{CheckpointManager, GuardDecision, JobStore, RateLimitGuard, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::handler::{HandlerError, HandlerRegistry, StepContext};

/// Tunables for one dispatcher
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Sleep between polls when nothing is claimable
    pub poll_interval: Duration,
    /// Attempts a job gets before it is left failed
    pub max_attempts: i32,
    pub retry_policy: RetryPolicy,
    /// Wait applied when a provider rejection carries no reset time
    pub rate_limit_wait: chrono::Duration,
    /// Upper bound on one sleep while dispatch is suspended
    pub max_suspend_sleep: Duration,
    /// How long a claim stays valid without a heartbeat
    pub lease: chrono::Duration,
    /// Retries of a finalizing write that hit a database error
    pub finalize_retries: u32,
    /// First delay between finalize retries; doubles each time
    pub finalize_retry_delay: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            retry_policy: RetryPolicy::default(),
            rate_limit_wait: chrono::Duration::minutes(60),
            max_suspend_sleep: Duration::from_secs(60),
            lease: chrono::Duration::minutes(5),
            finalize_retries: 3,
            finalize_retry_delay: Duration::from_millis(200),
        }
    }
}

impl DispatchSettings {
    /// Lease renewal period: three heartbeats per lease
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3)
            .to_std()
            .ok()
            .filter(|period| !period.is_zero())
            .unwrap_or(Duration::from_secs(1))
    }
}

/// What happened to a claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Paused { resume_at: DateTime<Utc> },
    Requeued { resume_at: Option<DateTime<Utc>> },
    Failed,
    /// The claim was lost (lease lapsed or an operator override) before the
    /// job could be finalized; the job was left as the store has it
    Abandoned,
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Dispatch is globally suspended by a provider rate limit
    Suspended { until: DateTime<Utc> },
    /// Nothing claimable
    Idle,
    Finished { job_id: Uuid, outcome: JobOutcome },
}

pub struct Dispatcher {
    id: String,
    store: Arc<dyn JobStore>,
    checkpoints: CheckpointManager,
    guard: RateLimitGuard,
    registry: HandlerRegistry,
    settings: DispatchSettings,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        settings: DispatchSettings,
    ) -> Self {
        Self::with_clock(id, store, registry, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        settings: DispatchSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let checkpoints = CheckpointManager::with_clock(store.clone(), clock.clone());
        let guard = RateLimitGuard::with_clock(store.clone(), clock.clone())
            .with_default_wait(settings.rate_limit_wait);

        Self {
            id: id.into(),
            store,
            checkpoints,
            guard,
            registry,
            settings,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Polls until `shutdown` flips to true
    ///
    /// A job already claimed is always finalized before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Dispatcher {} started (poll interval: {:?}, max attempts: {}, retry: {}, lease: {}s)",
            self.id,
            self.settings.poll_interval,
            self.settings.max_attempts,
            self.settings.retry_policy,
            self.settings.lease.num_seconds()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.tick().await {
                Ok(TickOutcome::Finished { .. }) => continue,
                Ok(TickOutcome::Idle) => self.settings.poll_interval,
                Ok(TickOutcome::Suspended { until }) => self.suspended_wait(until),
                Err(e) => {
                    error!("Dispatcher {} poll failed: {}", self.id, e);
                    self.settings.poll_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Dispatcher {} stopped", self.id);
    }

    /// One poll: recover lapsed claims, then claim, execute and finalize at
    /// most one job
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        let recovered = self.store.requeue_expired().await?;
        if recovered > 0 {
            warn!(
                "Dispatcher {} requeued {} job(s) whose lease lapsed",
                self.id, recovered
            );
        }

        if let GuardDecision::Suspended { until } = self.guard.check().await? {
            debug!("Dispatch suspended until {}", until);
            return Ok(TickOutcome::Suspended { until });
        }

        let Some(job) = self.store.claim_next(self.settings.lease).await? else {
            debug!("No claimable jobs");
            return Ok(TickOutcome::Idle);
        };
        let claim = job.claim().ok_or(StoreError::ClaimLost(job.id))?;

        info!(
            "Dispatcher {} claimed job {} ({} for {}, attempt {})",
            self.id,
            job.id,
            job.kind,
            job.target_id,
            job.attempts + 1
        );

        let job_id = job.id;
        let outcome = self.process(job, claim).await?;
        Ok(TickOutcome::Finished { job_id, outcome })
    }

    async fn process(&self, job: Job, claim: Claim) -> Result<JobOutcome, StoreError> {
        let Some(handler) = self.registry.get(job.kind) else {
            let err = HandlerError::Permanent(format!(
                "no handler registered for job kind '{}'",
                job.kind
            ));
            return self.finalize(&job, claim, Err(err)).await;
        };

        let resume = self.checkpoints.restore_from_checkpoint(&job);
        let mut ctx = StepContext::new(
            job.clone(),
            claim,
            resume,
            self.checkpoints.clone(),
            self.guard.clone(),
        );

        // A panicking handler must not take the dispatcher down with it
        let mut task = tokio::spawn(async move { handler.execute(&mut ctx).await });

        let period = self.settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = heartbeat.tick() => {
                    match self.store.renew_lease(claim, self.settings.lease).await {
                        Ok(()) => debug!("Renewed lease on job {}", job.id),
                        Err(e) if e.is_claim_lost() => {
                            warn!(
                                "Job {} was taken from dispatcher {}, abandoning it",
                                job.id, self.id
                            );
                            task.abort();
                            return Ok(JobOutcome::Abandoned);
                        }
                        Err(e) => warn!("Failed to renew lease on job {}: {}", job.id, e),
                    }
                }
            }
        };

        let result = joined
            .unwrap_or_else(|e| Err(HandlerError::Transient(format!("handler panicked: {}", e))));

        self.finalize(&job, claim, result).await
    }

    async fn finalize(
        &self,
        job: &Job,
        claim: Claim,
        result: Result<(), HandlerError>,
    ) -> Result<JobOutcome, StoreError> {
        match self.apply(job, claim, result).await {
            Err(e) if e.is_claim_lost() => {
                warn!(
                    "Job {} changed hands before dispatcher {} could finalize it: {}",
                    job.id, self.id, e
                );
                Ok(JobOutcome::Abandoned)
            }
            other => other,
        }
    }

    async fn apply(
        &self,
        job: &Job,
        claim: Claim,
        result: Result<(), HandlerError>,
    ) -> Result<JobOutcome, StoreError> {
        match result {
            Ok(()) => {
                self.persist("complete", job.id, || self.store.mark_completed(claim))
                    .await?;
                info!("Job {} completed", job.id);
                Ok(JobOutcome::Completed)
            }
            Err(HandlerError::RateLimited { message, resets_at }) => {
                let until = self
                    .persist("suspend dispatch for", job.id, || self.guard.trip(resets_at))
                    .await?;
                self.persist("pause", job.id, || {
                    self.store
                        .mark_paused(claim, &message, PauseReason::RateLimit, Some(until))
                })
                .await?;
                warn!("Job {} paused by rate limit until {}", job.id, until);
                Ok(JobOutcome::Paused { resume_at: until })
            }
            Err(err) => {
                let message = err.message();
                let failures = job.attempts + 1;

                if err.is_retryable() && failures < self.settings.max_attempts {
                    let delay = self.settings.retry_policy.delay(failures);
                    let resume_at = (delay > chrono::Duration::zero())
                        .then(|| self.clock.now() + delay);
                    self.persist("requeue", job.id, || {
                        self.store.requeue(claim, &message, resume_at)
                    })
                    .await?;
                    warn!(
                        "Job {} failed (attempt {}/{}), retrying{}: {}",
                        job.id,
                        failures,
                        self.settings.max_attempts,
                        resume_at
                            .map(|at| format!(" at {}", at))
                            .unwrap_or_default(),
                        message
                    );
                    Ok(JobOutcome::Requeued { resume_at })
                } else {
                    self.persist("fail", job.id, || self.store.mark_failed(claim, &message))
                        .await?;
                    error!(
                        "Job {} failed after {} attempt(s): {}",
                        job.id, failures, message
                    );
                    Ok(JobOutcome::Failed)
                }
            }
        }
    }

    /// Runs a finalizing write, retrying database errors with backoff
    ///
    /// When retries run out the error is returned and the claim is left to
    /// lapse, after which any dispatcher requeues the job.
    async fn persist<T, F, Fut>(
        &self,
        action: &str,
        job_id: Uuid,
        mut write: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.settings.finalize_retry_delay;
        let mut retries = 0;

        loop {
            match write().await {
                Err(e) if e.is_retryable() && retries < self.settings.finalize_retries => {
                    retries += 1;
                    warn!(
                        "Failed to {} job {} (retry {}/{} in {:?}): {}",
                        action, job_id, retries, self.settings.finalize_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    /// How long to sleep while suspended, bounded so shutdown and clock
    /// skew stay responsive
    fn suspended_wait(&self, until: DateTime<Utc>) -> Duration {
        (until - self.clock.now())
            .to_std()
            .unwrap_or(self.settings.poll_interval)
            .clamp(Duration::from_millis(100), self.settings.max_suspend_sleep)
    }
}
