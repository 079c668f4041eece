//! Checkpoint manager
//!
//! Step-level progress records that let a job resume mid-pipeline after a
//! crash, a retry or a rate-limit pause.
//!
//! Reads never fail: missing, unreadable or malformed state is logged and
//! reported as "no checkpoint". Writes propagate storage errors, so a step
//! never believes itself recorded when it is not. Writes also require the
//! [`Claim`] holding the job; a dispatcher whose lease lapsed gets
//! [`StoreError::ClaimLost`](crate::StoreError::ClaimLost).

use quill_core::clock::{Clock, SystemClock};
use quill_core::domain::checkpoint::{Checkpoint, CheckpointData, ResumePoint};
use quill_core::domain::job::{Claim, Job};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::repository::JobStore;

#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records `step` as the latest step with its payload
    ///
    /// Completed steps already on record are carried over unchanged.
    pub async fn save_checkpoint(
        &self,
        claim: Claim,
        step: &str,
        data: CheckpointData,
    ) -> Result<Checkpoint> {
        let job_id = claim.job_id;
        let raw = self.store.load_checkpoint(job_id).await?;
        let completed_steps = raw
            .as_deref()
            .and_then(|raw| parse_logged(job_id, raw))
            .map(|existing| existing.completed_steps)
            .unwrap_or_default();

        let checkpoint = Checkpoint {
            job_id,
            step: step.to_string(),
            data,
            completed_steps,
            timestamp: self.clock.now(),
        };

        let json = checkpoint.to_json()?;
        self.store.store_checkpoint(claim, Some(json.as_str())).await?;

        debug!("Checkpoint saved for job {} at step '{}'", job_id, step);
        Ok(checkpoint)
    }

    /// Current checkpoint of a job, if one can be read
    pub async fn get_checkpoint(&self, job_id: Uuid) -> Option<Checkpoint> {
        match self.store.load_checkpoint(job_id).await {
            Ok(Some(raw)) => parse_logged(job_id, &raw),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load checkpoint for job {}: {}", job_id, e);
                None
            }
        }
    }

    /// Drops the checkpoint of a held job
    ///
    /// Completion already drops it in the same write that marks the job
    /// completed; this is for a handler discarding progress it cannot use.
    pub async fn clear_checkpoint(&self, claim: Claim) -> Result<()> {
        self.store.store_checkpoint(claim, None).await?;
        debug!("Checkpoint cleared for job {}", claim.job_id);
        Ok(())
    }

    /// Adds `step` to the completed steps of an existing checkpoint
    ///
    /// Does nothing when the job has no checkpoint yet or the step is already
    /// recorded.
    pub async fn mark_step_completed(&self, claim: Claim, step: &str) -> Result<()> {
        let job_id = claim.job_id;
        let Some(raw) = self.store.load_checkpoint(job_id).await? else {
            debug!(
                "No checkpoint for job {}, not marking step '{}'",
                job_id, step
            );
            return Ok(());
        };
        let Some(mut checkpoint) = parse_logged(job_id, &raw) else {
            return Ok(());
        };

        if checkpoint.record_completed_step(step) {
            let json = checkpoint.to_json()?;
            self.store.store_checkpoint(claim, Some(json.as_str())).await?;
            debug!("Job {} completed step '{}'", job_id, step);
        }
        Ok(())
    }

    pub async fn is_step_completed(&self, job_id: Uuid, step: &str) -> bool {
        self.get_checkpoint(job_id)
            .await
            .is_some_and(|checkpoint| checkpoint.is_step_completed(step))
    }

    pub async fn get_completed_steps(&self, job_id: Uuid) -> Vec<String> {
        self.get_checkpoint(job_id)
            .await
            .map(|checkpoint| checkpoint.completed_steps)
            .unwrap_or_default()
    }

    /// Resume point carried by a claimed job's checkpoint text
    pub fn restore_from_checkpoint(&self, job: &Job) -> Option<ResumePoint> {
        let checkpoint = parse_logged(job.id, job.checkpoint.as_deref()?)?;
        debug!(
            "Job {} resumes from step '{}' ({} step(s) completed)",
            job.id,
            checkpoint.step,
            checkpoint.completed_steps.len()
        );
        Some(checkpoint.into())
    }
}

/// Parses stored checkpoint text, degrading corruption to `None`
fn parse_logged(job_id: Uuid, raw: &str) -> Option<Checkpoint> {
    match Checkpoint::parse(raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!("Ignoring malformed checkpoint for job {}: {}", job_id, e);
            None
        }
    }
}
