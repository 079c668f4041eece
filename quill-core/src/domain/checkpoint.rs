//! Checkpoint domain types
//!
//! A checkpoint is the step-level progress record embedded in a job. It is
//! stored as JSON text in the job row:
//!
//! ```json
//! {"jobId": "...", "step": "context_assembled",
//!  "data": {"kind": "chapter_generation", "tokens": 5000},
//!  "completedSteps": ["started", "status_updated"], "timestamp": "..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::job::JobKind;

/// Durable progress record for a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: Uuid,
    /// Label of the most recently recorded step
    pub step: String,
    pub data: CheckpointData,
    /// Ordered, duplicate-free
    #[serde(default)]
    pub completed_steps: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Parses stored checkpoint text
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serializes the checkpoint for storage
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Appends `step` unless it is already recorded
    ///
    /// Returns whether the list changed.
    pub fn record_completed_step(&mut self, step: &str) -> bool {
        if self.is_step_completed(step) {
            return false;
        }
        self.completed_steps.push(step.to_string());
        true
    }
}

/// Where a resumed job picks up
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub resume_from_step: String,
    pub data: CheckpointData,
    pub completed_steps: Vec<String>,
}

impl From<Checkpoint> for ResumePoint {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            resume_from_step: checkpoint.step,
            data: checkpoint.data,
            completed_steps: checkpoint.completed_steps,
        }
    }
}

/// Per-kind checkpoint payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointData {
    ChapterGeneration(ChapterProgress),
    MultiPassEditing(EditingProgress),
    EditorialAnalysis(AnalysisProgress),
}

impl CheckpointData {
    /// Empty payload for a job kind
    pub fn empty(kind: JobKind) -> Self {
        match kind {
            JobKind::ChapterGeneration => Self::ChapterGeneration(ChapterProgress::default()),
            JobKind::MultiPassEditing => Self::MultiPassEditing(EditingProgress::default()),
            JobKind::EditorialAnalysis => Self::EditorialAnalysis(AnalysisProgress::default()),
        }
    }

    /// Builds the payload for `kind` from an untyped JSON object
    ///
    /// Used at the collaborator boundary, where step results arrive as JSON.
    pub fn from_value(kind: JobKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            JobKind::ChapterGeneration => Self::ChapterGeneration(serde_json::from_value(value)?),
            JobKind::MultiPassEditing => Self::MultiPassEditing(serde_json::from_value(value)?),
            JobKind::EditorialAnalysis => Self::EditorialAnalysis(serde_json::from_value(value)?),
        })
    }

    /// The payload without its kind tag
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::ChapterGeneration(p) => serde_json::to_value(p),
            Self::MultiPassEditing(p) => serde_json::to_value(p),
            Self::EditorialAnalysis(p) => serde_json::to_value(p),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::ChapterGeneration(_) => JobKind::ChapterGeneration,
            Self::MultiPassEditing(_) => JobKind::MultiPassEditing,
            Self::EditorialAnalysis(_) => JobKind::EditorialAnalysis,
        }
    }
}

/// Chapter generation progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterProgress {
    /// Size of the assembled context, in tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
}

/// Multi-pass editing progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditingProgress {
    /// Passes finished so far
    pub passes_completed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_text: Option<String>,
}

/// Editorial board analysis progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisProgress {
    /// Reviewer name -> verdict
    pub reviews: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}
