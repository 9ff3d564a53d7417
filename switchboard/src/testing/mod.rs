//! Testing utilities for switchboard pipelines and orchestrators.
//!
//! This module provides:
//! - Mock processors
//! - Run and unit assertions
//! - An in-memory harness with polling helpers

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_counts, assert_run_status, assert_stage_complete, assert_stage_status};
pub use fixtures::TestHarness;
pub use mocks::{
    EchoReplyProcessor, FailingProcessor, FlakyProcessor, MarkingProcessor, RecordingProcessor,
};
