//! Orchestrators: a DAG of pipelines run under one root run.
//!
//! This module provides:
//! - The orchestrator definition with dependency and cycle validation
//! - The running orchestrator: dependency-gated dispatch, done handling,
//!   automatic and manual retry, abort and handshake delivery
//! - Read models aggregating progress across child runs

mod builder;
mod integration_tests;
mod runtime;
mod stats;

pub use builder::{Orchestrator, OrchestratorBuilder};
pub use runtime::{CleanReport, RunningOrchestrator};
pub use stats::{AggregateStats, PendingPipeline, RunOverview, SubRun};
