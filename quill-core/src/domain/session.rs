//! Dispatch session types
//!
//! The session row is the account-wide view of provider quota usage. It is
//! shared by every dispatcher through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted session/rate-limit state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub requests_this_session: i64,
    /// When the provider's quota window resets
    pub session_reset_time: Option<DateTime<Utc>>,
    /// Dispatch is suspended until this instant
    pub rate_limited_until: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    /// Snapshot for the operations interface
    pub fn stats(&self, now: DateTime<Utc>) -> SessionStats {
        SessionStats {
            requests_this_session: self.requests_this_session,
            session_reset_time: self.session_reset_time,
            is_rate_limited: self.is_rate_limited(now),
            rate_limited_until: self.rate_limited_until.filter(|until| *until > now),
        }
    }
}

/// Session statistics as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub requests_this_session: i64,
    pub session_reset_time: Option<DateTime<Utc>>,
    pub is_rate_limited: bool,
    pub rate_limited_until: Option<DateTime<Utc>>,
}
