//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a stored label does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseLabelError {
    pub what: &'static str,
    pub value: String,
}

/// A unit of background work for one stage of the content pipeline
///
/// Structure shared between the store (persists), the dispatcher (executes)
/// and the operations API (reports).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    /// Opaque reference to the entity being processed (a chapter, a book...)
    pub target_id: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub error: Option<String>,
    /// Raw checkpoint text as stored; parsed by the checkpoint manager
    pub checkpoint: Option<String>,
    pub pause_reason: Option<PauseReason>,
    /// Estimated resume time while paused, earliest retry time while pending
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Fencing token of the claim currently holding the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<Uuid>,
    /// Instant the current claim lapses unless its holder renews it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Ownership of a running job, issued by a successful claim
///
/// Every dispatcher write to the job is fenced on the token: once the lease
/// lapses and another dispatcher claims the job, the old holder's writes are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    pub job_id: Uuid,
    pub token: Uuid,
}

impl Job {
    /// Creates a fresh pending job
    pub fn new(kind: JobKind, target_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target_id: target_id.into(),
            status: JobStatus::Pending,
            attempts: 0,
            error: None,
            checkpoint: None,
            pause_reason: None,
            resume_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            claim_token: None,
            lease_expires_at: None,
        }
    }

    /// The claim holding this job, if it is running
    pub fn claim(&self) -> Option<Claim> {
        self.claim_token.map(|token| Claim {
            job_id: self.id,
            token,
        })
    }

    /// Whether a running job's lease has lapsed at `now`
    ///
    /// A running job without a lease (written before leases existed) counts
    /// as lapsed.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_none_or(|at| at <= now)
    }

    /// Whether a dispatcher may claim this job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let due = self.resume_at.is_none_or(|at| at <= now);
        match self.status {
            JobStatus::Pending => due,
            // Administrative pauses wait for an explicit override
            JobStatus::Paused => {
                self.pause_reason == Some(PauseReason::RateLimit) && self.resume_at.is_some() && due
            }
            _ => false,
        }
    }
}

/// The fixed set of job kinds driven by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ChapterGeneration,
    MultiPassEditing,
    EditorialAnalysis,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::ChapterGeneration,
        JobKind::MultiPassEditing,
        JobKind::EditorialAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ChapterGeneration => "chapter_generation",
            JobKind::MultiPassEditing => "multi_pass_editing",
            JobKind::EditorialAnalysis => "editorial_analysis",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseLabelError {
                what: "job kind",
                value: s.to_string(),
            })
    }
}

/// Job lifecycle status
///
/// Allowed transitions:
/// pending -> running; running -> completed | paused | pending | failed;
/// paused -> running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Paused,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Paused,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the dispatcher may move a job from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Paused)
                | (Running, Pending)
                | (Running, Failed)
                | (Paused, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| ParseLabelError {
                what: "job status",
                value: s.to_string(),
            })
    }
}

/// Why a job sits in `paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Provider quota rejection; resumes automatically at `resume_at`
    RateLimit,
    /// Forced by an operator; resumes only through another override
    Admin,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::RateLimit => "rate_limit",
            PauseReason::Admin => "admin",
        }
    }
}

impl FromStr for PauseReason {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(PauseReason::RateLimit),
            "admin" => Ok(PauseReason::Admin),
            _ => Err(ParseLabelError {
                what: "pause reason",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trips_through_labels() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(JobKind::ChapterGeneration.to_string(), "chapter_generation");
        assert_eq!(
            "editorial_analysis".parse::<JobKind>().unwrap(),
            JobKind::EditorialAnalysis
        );
        assert!("export".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_only_documented_transitions_are_allowed() {
        use JobStatus::*;
        let allowed = [
            (Pending, Running),
            (Running, Completed),
            (Running, Paused),
            (Running, Pending),
            (Running, Failed),
            (Paused, Running),
        ];

        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::ChapterGeneration, "chapter-1", now);
        assert!(job.is_claimable(now));

        job.resume_at = Some(now + Duration::seconds(30));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::seconds(30)));

        job.status = JobStatus::Paused;
        job.pause_reason = Some(PauseReason::RateLimit);
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::minutes(1)));

        job.pause_reason = Some(PauseReason::Admin);
        assert!(!job.is_claimable(now + Duration::minutes(1)));

        job.status = JobStatus::Running;
        assert!(!job.is_claimable(now + Duration::minutes(1)));
    }

    #[test]
    fn test_lease_expiry_and_claim() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::EditorialAnalysis, "book-1", now);
        assert!(job.claim().is_none());
        assert!(!job.is_lease_expired(now));

        job.status = JobStatus::Running;
        assert!(job.is_lease_expired(now));

        let token = Uuid::new_v4();
        job.claim_token = Some(token);
        job.lease_expires_at = Some(now + Duration::minutes(5));
        assert_eq!(
            job.claim(),
            Some(Claim {
                job_id: job.id,
                token
            })
        );
        assert!(!job.is_lease_expired(now + Duration::minutes(4)));
        assert!(job.is_lease_expired(now + Duration::minutes(5)));
    }
}
