//! Runs: one execution of a pipeline or of a whole orchestrator.

use super::{RunId, RunStatus, SourceStatus};
use crate::progress::ProgressSummary;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Whether a run is an orchestrator root or a pipeline child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// An orchestrator run (or a standalone pipeline run with no parent).
    Root,
    /// A pipeline run under a root.
    Child,
}

/// How a retry was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// Scheduled by the orchestrator after a failed run.
    #[default]
    Auto,
    /// Requested by an operator.
    Manual,
}

impl fmt::Display for RetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// One entry of a run's retry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// When the retry was recorded.
    pub at: Timestamp,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Auto or manual.
    pub kind: RetryKind,
}

/// Options carried from discharge to every unit of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Queue priority for the run's units (lower runs first).
    pub priority: Option<i32>,
}

/// The source's progress on a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    /// Source status.
    pub status: SourceStatus,
    /// Units generated.
    pub total_units: usize,
    /// Generator error, if it failed.
    pub error: Option<String>,
}

/// One execution instance of a pipeline or orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identity.
    pub id: RunId,
    /// Name of the pipeline or orchestrator that owns the run.
    pub board_name: String,
    /// Root run for child runs; `None` for roots.
    pub parent_id: Option<RunId>,
    /// Root or child.
    pub kind: RunKind,
    /// The discharge payload.
    pub payload: serde_json::Value,
    /// Discharge options.
    #[serde(default)]
    pub options: RunOptions,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Retries applied to this run.
    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,
    /// Child pipelines already dispatched under this run (roots only).
    #[serde(default)]
    pub discharged_children: BTreeSet<String>,
    /// Source progress (children and standalone runs).
    #[serde(default)]
    pub source: SourceState,
    /// Counter summary cached when the run finished.
    pub stats: Option<ProgressSummary>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl Run {
    /// Creates a root run.
    #[must_use]
    pub fn root(board_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::build(board_name.into(), None, RunKind::Root, payload)
    }

    /// Creates a child run under `parent_id`.
    #[must_use]
    pub fn child(
        board_name: impl Into<String>,
        parent_id: RunId,
        payload: serde_json::Value,
    ) -> Self {
        Self::build(board_name.into(), Some(parent_id), RunKind::Child, payload)
    }

    fn build(
        board_name: String,
        parent_id: Option<RunId>,
        kind: RunKind,
        payload: serde_json::Value,
    ) -> Self {
        let now = now_utc();
        Self {
            id: generate_id(),
            board_name,
            parent_id,
            kind,
            payload,
            options: RunOptions::default(),
            status: RunStatus::Waiting,
            retry_history: Vec::new(),
            discharged_children: BTreeSet::new(),
            source: SourceState::default(),
            stats: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the initial status.
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true for root runs.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Number of retries recorded.
    #[must_use]
    pub fn retry_count(&self) -> usize {
        self.retry_history.len()
    }
}
