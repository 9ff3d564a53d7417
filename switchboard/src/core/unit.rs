//! Work units and their per-stage outputs.

use super::OutputStatus;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of a work unit.
pub type UnitId = Uuid;

/// Identifier of a run.
pub type RunId = Uuid;

/// An error recorded against a unit or one of its stage outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The stage that produced the error.
    pub stage: String,
    /// The error message.
    pub message: String,
}

impl ErrorRecord {
    /// Creates a new error record.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Output of one stage for one unit.
///
/// `status` stays `None` when only an error has been recorded and the
/// stage has not yet reached a decision (a retry is pending).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage status for this unit.
    pub status: Option<OutputStatus>,
    /// Data returned by the processor.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the status was written.
    pub timestamp: Option<Timestamp>,
    /// Last error seen on this stage.
    pub error: Option<ErrorRecord>,
}

impl StageOutput {
    /// A completed output carrying processor data.
    #[must_use]
    pub fn complete(data: serde_json::Value) -> Self {
        Self {
            status: Some(OutputStatus::Complete),
            data,
            timestamp: Some(now_utc()),
            error: None,
        }
    }

    /// A handshake output awaiting its reply.
    #[must_use]
    pub fn waiting(data: serde_json::Value) -> Self {
        Self {
            status: Some(OutputStatus::Waiting),
            data,
            timestamp: Some(now_utc()),
            error: None,
        }
    }

    /// A failed output.
    #[must_use]
    pub fn failed(error: Option<ErrorRecord>) -> Self {
        Self {
            status: Some(OutputStatus::Failed),
            data: serde_json::Value::Null,
            timestamp: Some(now_utc()),
            error,
        }
    }

    /// Returns true if the stage completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == Some(OutputStatus::Complete)
    }
}

/// The atomic item of work flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unit identity.
    pub id: UnitId,
    /// The run that owns this unit.
    pub run_id: RunId,
    /// Arbitrary payload produced by the source.
    pub data: serde_json::Value,
    /// Queue priority (lower runs first).
    pub priority: Option<i32>,
    /// Per-stage outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, StageOutput>,
    /// Per-stage retry counts.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Set by a handler to short-circuit the unit to ground.
    #[serde(default)]
    pub marked_complete: bool,
    /// Set by a cooperative abort.
    #[serde(default)]
    pub aborted: bool,
    /// Last error recorded on the unit.
    pub error: Option<ErrorRecord>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl WorkUnit {
    /// Creates a new unit for a run.
    #[must_use]
    pub fn new(run_id: RunId, data: serde_json::Value) -> Self {
        let now = now_utc();
        Self {
            id: generate_id(),
            run_id,
            data,
            priority: None,
            outputs: BTreeMap::new(),
            retry_counts: BTreeMap::new(),
            marked_complete: false,
            aborted: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }

    /// Returns a stage's output, if any.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&StageOutput> {
        self.outputs.get(stage)
    }

    /// Returns a stage's output status, if any.
    #[must_use]
    pub fn output_status(&self, stage: &str) -> Option<OutputStatus> {
        self.outputs.get(stage).and_then(|output| output.status)
    }

    /// Returns true if the stage shows COMPLETE for this unit.
    #[must_use]
    pub fn is_stage_complete(&self, stage: &str) -> bool {
        self.output_status(stage) == Some(OutputStatus::Complete)
    }

    /// Returns how many times the stage has been retried for this unit.
    #[must_use]
    pub fn retry_count(&self, stage: &str) -> u32 {
        self.retry_counts.get(stage).copied().unwrap_or(0)
    }
}
