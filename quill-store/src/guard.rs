//! Rate limit guard
//!
//! Account-wide circuit breaker for provider quota rejections. The "rate
//! limited until T" state lives in the store's session row, so every
//! dispatcher polling the store observes the same suspension.

use chrono::{DateTime, Duration, Utc};
use quill_core::clock::{Clock, SystemClock};
use quill_core::domain::session::{SessionState, SessionStats};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::repository::JobStore;

/// Wait applied when the provider gives no reset time, in seconds
pub const DEFAULT_RATE_LIMIT_WAIT_SECS: i64 = 60 * 60;

/// Whether dispatch may claim work right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Open,
    Suspended { until: DateTime<Utc> },
}

#[derive(Clone)]
pub struct RateLimitGuard {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    default_wait: Duration,
}

impl RateLimitGuard {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_wait: Duration::seconds(DEFAULT_RATE_LIMIT_WAIT_SECS),
        }
    }

    /// Overrides the fallback wait used when no reset time is known
    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Consulted before every claim
    pub async fn check(&self) -> Result<GuardDecision> {
        let now = self.clock.now();
        let session = self.store.session().await?;

        Ok(match session.rate_limited_until {
            Some(until) if until > now => GuardDecision::Suspended { until },
            _ => GuardDecision::Open,
        })
    }

    /// Effective resume time for a rejection carrying `resets_at`
    ///
    /// Unknown or already-elapsed reset times fall back to the default wait.
    pub fn resume_time(&self, resets_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        match resets_at {
            Some(at) if at > now => at,
            _ => now + self.default_wait,
        }
    }

    /// Suspends dispatch for every dispatcher until the provider quota resets
    ///
    /// Returns the instant dispatch resumes.
    pub async fn trip(&self, resets_at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let until = self.resume_time(resets_at);
        let session = self.store.set_rate_limited_until(until).await?;
        let effective = session.rate_limited_until.unwrap_or(until);

        warn!(
            "Provider rate limit hit after {} request(s) this session, dispatch suspended until {}",
            session.requests_this_session, effective
        );
        Ok(effective)
    }

    /// Counts one provider request against the current session
    pub async fn record_request(&self) -> Result<SessionState> {
        let session = self.store.record_request().await?;
        debug!(
            "Provider requests this session: {}",
            session.requests_this_session
        );
        Ok(session)
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let session = self.store.session().await?;
        Ok(session.stats(self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobStore;
    use quill_core::clock::ManualClock;

    fn guard() -> (RateLimitGuard, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        (
            RateLimitGuard::with_clock(store, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_open_until_tripped() {
        let (guard, clock) = guard();
        assert_eq!(guard.check().await.unwrap(), GuardDecision::Open);

        let reset = clock.now() + Duration::minutes(20);
        assert_eq!(guard.trip(Some(reset)).await.unwrap(), reset);
        assert_eq!(
            guard.check().await.unwrap(),
            GuardDecision::Suspended { until: reset }
        );

        clock.set(reset);
        assert_eq!(guard.check().await.unwrap(), GuardDecision::Open);
    }

    #[tokio::test]
    async fn test_unknown_reset_uses_default_wait() {
        let (guard, clock) = guard();
        let guard = guard.with_default_wait(Duration::minutes(5));

        let until = guard.trip(None).await.unwrap();
        assert_eq!(until, clock.now() + Duration::minutes(5));

        // A reset time already in the past is as good as unknown
        let stale = clock.now() - Duration::minutes(1);
        assert_eq!(guard.resume_time(Some(stale)), clock.now() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_stats_report_requests_and_suspension() {
        let (guard, clock) = guard();
        guard.record_request().await.unwrap();
        guard.record_request().await.unwrap();

        let reset = clock.now() + Duration::minutes(3);
        guard.trip(Some(reset)).await.unwrap();

        let stats = guard.stats().await.unwrap();
        assert_eq!(stats.requests_this_session, 2);
        assert!(stats.is_rate_limited);
        assert_eq!(stats.session_reset_time, Some(reset));

        clock.advance(Duration::minutes(3));
        assert!(!guard.stats().await.unwrap().is_rate_limited);
    }
}
