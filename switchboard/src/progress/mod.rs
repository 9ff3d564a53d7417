//! Per-run, per-status membership counters.
//!
//! Every completion decision in the engine reads one of these counters:
//! stages record `pushed`/`consumed`/`complete`/`failed` against their own
//! namespace, pipelines record `complete`/`failed`/`skipped`/`aborted`
//! against theirs, and `CheckRunDone` reads the pipeline summary.

mod memory;
mod summary;

pub use memory::{InMemoryCounterProvider, InMemoryProgressCounter};
pub use summary::ProgressSummary;

use crate::core::{RunId, UnitId};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A membership status tracked by a [`ProgressCounter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterStatus {
    /// The unit is (again) in progress.
    Active,
    /// The unit finished.
    Complete,
    /// A handler short-circuited the unit.
    MarkedComplete,
    /// The unit failed (provisional until the run is finalised).
    Failed,
    /// The unit observed an abort.
    Aborted,
    /// The unit will never reach this counter.
    Skipped,
    /// The unit was enqueued to a stage.
    Pushed,
    /// A stage worker picked the unit up.
    Consumed,
    /// Any other status.
    Custom(String),
}

impl CounterStatus {
    /// The key segment this status is stored under.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::MarkedComplete => "markedComplete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
            Self::Pushed => "pushed",
            Self::Consumed => "consumed",
            Self::Custom(name) => name,
        }
    }

    /// True for statuses that clear a unit's provisional failure.
    #[must_use]
    pub fn clears_failure(&self) -> bool {
        matches!(self, Self::Active | Self::Complete | Self::MarkedComplete)
    }
}

impl From<&str> for CounterStatus {
    fn from(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "complete" => Self::Complete,
            "markedComplete" => Self::MarkedComplete,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            "skipped" => Self::Skipped,
            "pushed" => Self::Pushed,
            "consumed" => Self::Consumed,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for CounterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run membership counters under one namespace.
#[async_trait]
pub trait ProgressCounter: Send + Sync {
    /// The namespace this counter writes under.
    fn prefix(&self) -> &str;

    /// Sets the expected unit total for a run.
    async fn init(&self, run_id: RunId, total: usize) -> Result<()>;

    /// Adds a unit to a status set.
    async fn update(&self, run_id: RunId, unit_id: UnitId, status: CounterStatus) -> Result<()>;

    /// Returns the members of a status set.
    async fn members(&self, run_id: RunId, status: &CounterStatus) -> Result<HashSet<UnitId>>;

    /// Removes a unit from a status set. Returns true if it was present.
    async fn remove_member(
        &self,
        run_id: RunId,
        status: &CounterStatus,
        unit_id: UnitId,
    ) -> Result<bool>;

    /// Reads the run's summary.
    async fn summary(&self, run_id: RunId) -> Result<ProgressSummary>;
}

/// Opens namespaced counters.
pub trait CounterProvider: Send + Sync {
    /// Opens the counter for `prefix`, reporting `custom_statuses` in summaries.
    fn open(&self, prefix: &str, custom_statuses: &[&str]) -> Arc<dyn ProgressCounter>;

    /// Drops expired counter keys. Returns how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Counter namespace for a pipeline.
#[must_use]
pub fn pipeline_prefix(namespace: &str, pipeline: &str) -> String {
    format!("cb:{namespace}:{pipeline}")
}

/// Counter namespace for a stage.
#[must_use]
pub fn stage_prefix(namespace: &str, pipeline: &str, stage: &str) -> String {
    format!("r:{namespace}:{pipeline}:{stage}")
}
