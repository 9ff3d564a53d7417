//! # Switchboard
//!
//! A distributed, queue-backed workflow engine.
//!
//! Switchboard moves work units through pipelines of stages, each stage
//! consuming its own job queue, and runs whole DAGs of pipelines under an
//! orchestrator. It provides:
//!
//! - **Stage DAGs**: fan-out, fan-in gated on declared dependencies, ground
//! - **Handshake stages**: park a unit until an external reply arrives, with a
//!   lock-guarded timeout sweep
//! - **Progress counters**: set-based per-run counts behind every completion
//!   decision, with a completion threshold per pipeline
//! - **Orchestration**: cross-pipeline dependencies, exactly-once dispatch,
//!   automatic and manual retry, cooperative abort
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchboard::prelude::*;
//!
//! let orders = Pipeline::builder("orders")
//!     .source(Source::passthrough("fetch"))
//!     .stage(StageDefinition::new("fetch", FetchProcessor).next("store"))
//!     .stage(StageDefinition::new("store", StoreProcessor).to_ground())
//!     .build()?;
//!
//! let orchestrator = Orchestrator::builder("main").pipeline(orders).build()?;
//! let running = orchestrator.start(&Connections::in_memory(EngineConfig::default()));
//! let root = running.discharge(json!({"market": "TH"}), RunOptions::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod connections;
pub mod core;
pub mod errors;
pub mod events;
pub mod lock;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, WorkerGroup};
    pub use crate::config::EngineConfig;
    pub use crate::connections::Connections;
    pub use crate::core::{
        OutputStatus, Reply, RetryKind, Run, RunId, RunOptions, RunStatus, StageKind, UnitId,
        WorkUnit,
    };
    pub use crate::errors::{
        ConfigurationError, ContractErrorInfo, CycleDetectedError, NotFoundError,
        SwitchboardError,
    };
    pub use crate::events::{Notification, NotificationKind, Notifier};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{
        AggregateStats, Orchestrator, OrchestratorBuilder, RunOverview, RunningOrchestrator,
    };
    pub use crate::pipeline::{Pipeline, PipelineBuilder, RunningPipeline, Source, UnitGenerator};
    pub use crate::progress::{CounterStatus, ProgressCounter, ProgressSummary};
    pub use crate::retry::RetryPolicy;
    pub use crate::stages::{
        CompletionMarker, FnProcessor, FnReplyProcessor, Next, ReplyProcessor, StageDefinition,
        StageProcessor,
    };
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn test_prelude_builds_an_orchestrator() {
        let pipeline = Pipeline::builder("orders")
            .source(Source::passthrough("fetch"))
            .stage(StageDefinition::new("fetch", crate::testing::RecordingProcessor::new()).to_ground())
            .build()
            .unwrap();
        let orchestrator = Orchestrator::builder("main").pipeline(pipeline).build().unwrap();
        assert_eq!(orchestrator.pipelines().len(), 1);
    }
}
