//! Error types for the switchboard engine.
//!
//! Configuration problems are fatal and surface before anything starts.
//! Everything else happens per unit or per run and is recorded rather than
//! crashing a worker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for switchboard operations.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// A pipeline or orchestrator definition is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The orchestrator's pipeline dependency graph contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A unit, run, stage, pipeline or reply lookup missed.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// A stage or reply handler failed. Retried by the stage retry policy.
    #[error("Stage '{stage}' processing failed: {message}")]
    Processing {
        /// The stage whose handler failed.
        stage: String,
        /// The handler's error message.
        message: String,
    },

    /// A handshake stage never received its reply.
    #[error("Handshake reply timeout {timeout_ms} ms on stage '{stage}'")]
    HandshakeTimeout {
        /// The handshake stage.
        stage: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// The queue collaborator failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The lock collaborator failed.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A component was used before it was started or after it was closed.
    #[error("'{0}' is not running")]
    NotStarted(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchboardError {
    /// Creates a processing error from a handler failure.
    #[must_use]
    pub fn processing(stage: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Processing {
            stage: stage.into(),
            message: format!("{error:#}"),
        }
    }

    /// Returns true if the stage retry policy may re-enqueue after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Processing { .. })
    }

    /// Returns true for lookup misses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for SwitchboardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONFIG-NO-GROUND").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info, pre-filled with the default hint for the code.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = ContractSuggestions::get(&code).map(ToString::to_string);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline or orchestrator definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages (or pipelines) involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Shorthand for a message plus a coded contract error.
    #[must_use]
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(message.clone()).with_error_info(ContractErrorInfo::new(code, message))
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline dependencies: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of pipelines forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::PIPELINE_CYCLE,
            format!("Pipeline dependencies form a cycle: {}", cycle_path.join(" -> ")),
        );

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for ConfigurationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// What kind of record a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundKind {
    /// A work unit.
    Unit,
    /// A pipeline or orchestrator run.
    Run,
    /// A stage of a pipeline.
    Stage,
    /// A pipeline registered with an orchestrator.
    Pipeline,
    /// A handshake reply.
    Reply,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "Unit"),
            Self::Run => write!(f, "Run"),
            Self::Stage => write!(f, "Stage"),
            Self::Pipeline => write!(f, "Pipeline"),
            Self::Reply => write!(f, "Reply"),
        }
    }
}

/// Error raised when a runtime lookup misses.
#[derive(Debug, Clone, Error)]
#[error("{kind} '{id}' is not found")]
pub struct NotFoundError {
    /// What was looked up.
    pub kind: NotFoundKind,
    /// The identifier or name that missed.
    pub id: String,
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(kind: NotFoundKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    /// A missing work unit.
    #[must_use]
    pub fn unit(id: impl ToString) -> Self {
        Self::new(NotFoundKind::Unit, id)
    }

    /// A missing run.
    #[must_use]
    pub fn run(id: impl ToString) -> Self {
        Self::new(NotFoundKind::Run, id)
    }

    /// A missing stage.
    #[must_use]
    pub fn stage(name: impl ToString) -> Self {
        Self::new(NotFoundKind::Stage, name)
    }

    /// A missing pipeline.
    #[must_use]
    pub fn pipeline(name: impl ToString) -> Self {
        Self::new(NotFoundKind::Pipeline, name)
    }

    /// A missing reply.
    #[must_use]
    pub fn reply(id: impl ToString) -> Self {
        Self::new(NotFoundKind::Reply, id)
    }
}

/// Contract error codes.
pub mod codes {
    /// A `next` or `dependencies` entry names an undefined stage.
    pub const UNDEFINED_STAGE: &str = "CONFIG-UNDEFINED-STAGE";
    /// No stage routes to ground.
    pub const NO_GROUND: &str = "CONFIG-NO-GROUND";
    /// The pipeline has no source.
    pub const NO_SOURCE: &str = "CONFIG-NO-SOURCE";
    /// The pipeline has no stages.
    pub const NO_STAGES: &str = "CONFIG-NO-STAGES";
    /// A name cannot be used as a queue namespace.
    pub const INVALID_NAME: &str = "CONFIG-INVALID-NAME";
    /// Two stages or pipelines share a name.
    pub const DUPLICATE: &str = "CONFIG-DUPLICATE";
    /// A handshake stage lacks a reply processor.
    pub const MISSING_REPLY_HANDLER: &str = "CONFIG-MISSING-REPLY-HANDLER";
    /// A pipeline depends on a pipeline that is not registered.
    pub const UNKNOWN_PIPELINE: &str = "CONFIG-UNKNOWN-PIPELINE";
    /// Pipeline dependencies form a cycle.
    pub const PIPELINE_CYCLE: &str = "CONFIG-PIPELINE-CYCLE";
}

/// Provides default suggestions for configuration error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            codes::UNDEFINED_STAGE => Some(
                "Check `next` and `dependencies` for typos; every referenced stage must be added to the pipeline.",
            ),
            codes::NO_GROUND => Some("Route at least one stage to ground with `Next::Ground`."),
            codes::NO_SOURCE => Some("Attach a source with `PipelineBuilder::source` before building."),
            codes::NO_STAGES => Some("Add at least one stage to the pipeline before building."),
            codes::INVALID_NAME => Some(
                "Names become queue namespaces: use letters, digits, '_', '-' or '.', starting with a letter or digit.",
            ),
            codes::DUPLICATE => Some("Rename one of the entries so every name is unique."),
            codes::MISSING_REPLY_HANDLER => {
                Some("Handshake stages need a reply processor to complete the second phase.")
            }
            codes::UNKNOWN_PIPELINE => {
                Some("Register every pipeline named in `depends_on` with the same orchestrator.")
            }
            codes::PIPELINE_CYCLE => Some(
                "Remove one of the pipeline dependencies in the cycle to break it.",
            ),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = SwitchboardError> = std::result::Result<T, E>;
