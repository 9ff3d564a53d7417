//! Pipelines: one source feeding a DAG of stages.
//!
//! This module provides:
//! - The pipeline definition and its validating builder
//! - Sources and unit generators
//! - The running pipeline: dependency-gated dispatch, grounding and run completion

mod builder;
mod runtime;
mod source;

pub use builder::{Pipeline, PipelineBuilder};
pub use runtime::{RunningPipeline, StageSummary};
pub use source::{FnGenerator, PassthroughGenerator, Source, UnitGenerator};
