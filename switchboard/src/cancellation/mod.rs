//! Shutdown plumbing for worker loops.
//!
//! Unit-level abort is cooperative and lives on the unit record; this module
//! only stops the engine's own background tasks.

mod token;
mod worker_group;

pub use token::CancellationToken;
pub use worker_group::WorkerGroup;
