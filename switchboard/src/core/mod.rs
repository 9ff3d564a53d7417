//! Core domain model types for switchboard.
//!
//! This module contains the records that flow through the engine:
//! - Work units and their per-stage outputs
//! - Runs with retry history and dispatch bookkeeping
//! - Handshake replies
//! - Status and kind enums

mod reply;
mod run;
mod status;
mod unit;

pub use reply::{Reply, ReplyId};
pub use run::{RetryKind, RetryRecord, Run, RunKind, RunOptions, SourceState};
pub use status::{OutputStatus, RunStatus, SourceStatus, StageKind};
pub use unit::{ErrorRecord, RunId, StageOutput, UnitId, WorkUnit};
