//! Status and kind enums for stages, runs and sources.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Processes a unit and completes in one step.
    #[default]
    Normal,
    /// Sends a request, then completes when an external reply arrives.
    Handshake,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Handshake => write!(f, "handshake"),
        }
    }
}

/// Status of one stage's output on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// Handshake request sent, reply pending.
    Waiting,
    /// Stage finished successfully.
    Complete,
    /// Stage exhausted its retries or timed out.
    Failed,
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up by the source.
    #[default]
    Waiting,
    /// Units are flowing.
    Active,
    /// Finished at or above the completion threshold.
    Complete,
    /// Finished below the completion threshold.
    Failed,
    /// Aborted by an operator.
    Aborted,
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    /// Returns true while the run may still produce a done event.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Status of a pipeline source on one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Not yet consumed.
    #[default]
    Waiting,
    /// Generating units.
    Active,
    /// Units generated and stored.
    Complete,
    /// The generator failed.
    Failed,
}
