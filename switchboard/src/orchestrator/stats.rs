//! Read models over orchestrator runs.

use crate::core::{Run, RunStatus};
use crate::pipeline::StageSummary;
use crate::progress::ProgressSummary;
use serde::{Deserialize, Serialize};

/// Progress of a root run across its pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Sum of child complete ratios, each weighted by `1 / pipeline count`.
    pub complete_ratio: f64,
    /// Lowest complete ratio among finished children; 1 when none has
    /// finished yet, 0 when nothing was dispatched.
    pub integrity_ratio: f64,
}

impl AggregateStats {
    /// Aggregates child runs of an orchestrator with `pipeline_count` pipelines.
    ///
    /// Each child is paired with its summary: the cached stats when it
    /// finished, the live counter summary otherwise.
    #[must_use]
    pub fn from_children(pipeline_count: usize, children: &[(Run, ProgressSummary)]) -> Self {
        if children.is_empty() {
            return Self::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let weight = 1.0 / pipeline_count.max(1) as f64;

        let mut stats = Self {
            complete_ratio: 0.0,
            integrity_ratio: 1.0,
        };
        for (run, summary) in children {
            stats.complete_ratio += summary.complete_ratio * weight;
            let finished = matches!(run.status, RunStatus::Complete | RunStatus::Failed);
            if finished && summary.complete_ratio < stats.integrity_ratio {
                stats.integrity_ratio = summary.complete_ratio;
            }
        }
        stats
    }
}

/// A root run with its aggregated progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOverview {
    /// The root run.
    pub run: Run,
    /// Progress across its children.
    pub stats: AggregateStats,
}

/// A child run with its pipeline summary and, optionally, per-stage summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRun {
    /// The child run.
    pub run: Run,
    /// Pipeline-level progress.
    pub summary: ProgressSummary,
    /// Per-stage progress, in registration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageSummary>>,
}

/// A pipeline not yet dispatched under a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPipeline {
    /// Pipeline name.
    pub name: String,
    /// Its declared dependencies.
    pub depends_on: Vec<String>,
}
