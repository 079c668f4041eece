//! Step handler layer
//!
//! A step handler runs one kind of job. Handlers are registered per
//! [`JobKind`] in a [`HandlerRegistry`] and invoked by the dispatcher with a
//! [`StepContext`] describing where the job left off.
//!
//! Handlers are responsible for checkpointing at every point of resumable
//! progress through the context.

mod registry;
mod remote;

pub use registry::HandlerRegistry;
pub use remote::{RemoteStepHandler, pipeline_steps};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quill_core::domain::checkpoint::{CheckpointData, ResumePoint};
use quill_core::domain::job::{Claim, Job};
use quill_store::{CheckpointManager, RateLimitGuard, StoreError};
use thiserror::Error;

/// Execution unit for one job kind
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs (or resumes) the job described by `ctx`
    async fn execute(&self, ctx: &mut StepContext) -> Result<(), HandlerError>;
}

/// Ways a handler can fail
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Network or provider hiccup; retried while attempts remain
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider quota rejection; pauses the job and suspends all dispatch
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Best-known quota reset, if the provider reported one
        resets_at: Option<DateTime<Utc>>,
    },

    /// Retrying cannot help
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// A checkpoint write did not reach the store
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] StoreError),
}

impl HandlerError {
    /// Human-readable text retained on the job
    pub fn message(&self) -> String {
        match self {
            HandlerError::Transient(msg) | HandlerError::Permanent(msg) => msg.clone(),
            HandlerError::RateLimited { message, .. } => message.clone(),
            HandlerError::Checkpoint(e) => format!("checkpoint write failed: {}", e),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }
}

/// Everything a handler needs to run or resume a claimed job
pub struct StepContext {
    pub job: Job,
    claim: Claim,
    resume: Option<ResumePoint>,
    checkpoints: CheckpointManager,
    guard: RateLimitGuard,
}

impl StepContext {
    pub fn new(
        job: Job,
        claim: Claim,
        resume: Option<ResumePoint>,
        checkpoints: CheckpointManager,
        guard: RateLimitGuard,
    ) -> Self {
        Self {
            job,
            claim,
            resume,
            checkpoints,
            guard,
        }
    }

    /// Step recorded by the last checkpoint, if resuming
    pub fn resume_from_step(&self) -> Option<&str> {
        self.resume.as_ref().map(|r| r.resume_from_step.as_str())
    }

    /// Payload of the last checkpoint, if resuming
    pub fn checkpoint_data(&self) -> Option<&CheckpointData> {
        self.resume.as_ref().map(|r| &r.data)
    }

    /// Payload to build on: the last checkpoint's, or an empty one
    pub fn data_or_empty(&self) -> CheckpointData {
        self.checkpoint_data()
            .cloned()
            .unwrap_or_else(|| CheckpointData::empty(self.job.kind))
    }

    pub fn completed_steps(&self) -> &[String] {
        self.resume
            .as_ref()
            .map(|r| r.completed_steps.as_slice())
            .unwrap_or_default()
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps().iter().any(|s| s == step)
    }

    /// Durably records `step` with its payload
    pub async fn save_checkpoint(
        &mut self,
        step: &str,
        data: CheckpointData,
    ) -> Result<(), HandlerError> {
        let checkpoint = self
            .checkpoints
            .save_checkpoint(self.claim, step, data)
            .await?;
        self.resume = Some(checkpoint.into());
        Ok(())
    }

    /// Marks `step` done; a no-op before the first checkpoint
    pub async fn mark_step_completed(&mut self, step: &str) -> Result<(), HandlerError> {
        self.checkpoints
            .mark_step_completed(self.claim, step)
            .await?;
        if let Some(resume) = self.resume.as_mut() {
            if !resume.completed_steps.iter().any(|s| s == step) {
                resume.completed_steps.push(step.to_string());
            }
        }
        Ok(())
    }

    /// Counts one provider request against the shared session
    pub async fn record_request(&self) -> Result<(), HandlerError> {
        self.guard.record_request().await?;
        Ok(())
    }
}
