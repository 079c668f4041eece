//! Job DTOs for the producer and operational query interfaces

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobKind, JobStatus, PauseReason};

/// Request to enqueue a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueJob {
    pub kind: JobKind,
    pub target_id: String,
}

/// Filter for job listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Owning entity
    pub target_id: Option<String>,
    pub kind: Option<JobKind>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.kind.is_none_or(|k| k == job.kind)
            && self.target_id.as_deref().is_none_or(|t| t == job.target_id)
    }
}

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    /// Builds a pagination window, clamping the limit to `1..=MAX_LIMIT`
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of a job listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Total matching jobs, ignoring pagination
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Aggregate job counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub paused: i64,
    pub failed: i64,
    pub total: i64,
}

impl JobCounts {
    /// Adds `count` jobs in `status`
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Paused => self.paused += count,
            JobStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

/// Administrative status override
///
/// Bypasses the dispatcher's transition rules; used by operators to release
/// or retire stuck jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOverride {
    pub status: OverrideStatus,
    /// Replaces the job's error text when present
    pub error: Option<String>,
    /// Resume time for a forced pause
    pub resume_at: Option<DateTime<Utc>>,
}

/// Statuses an operator may force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    Pending,
    Paused,
    Failed,
}

impl OverrideStatus {
    pub fn status(&self) -> JobStatus {
        match self {
            OverrideStatus::Pending => JobStatus::Pending,
            OverrideStatus::Paused => JobStatus::Paused,
            OverrideStatus::Failed => JobStatus::Failed,
        }
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        match self {
            OverrideStatus::Paused => Some(PauseReason::Admin),
            _ => None,
        }
    }
}
