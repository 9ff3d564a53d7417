//! Persistence collaborator for units, runs and replies.
//!
//! Every method is a single atomic operation against the backing store.
//! Callers never read-then-write for decisions that must hold under
//! concurrency: `add_discharged_child`, `compare_and_set_run_status`,
//! `set_output_unless_complete` and `fail_if_waiting` exist for that.

mod memory;

pub use memory::InMemoryStore;

use crate::core::{
    ErrorRecord, Reply, ReplyId, RetryKind, RetryRecord, Run, RunId, RunStatus, StageOutput,
    UnitId, WorkUnit,
};
use crate::errors::Result;
use crate::utils::Timestamp;
use async_trait::async_trait;

/// A mutation applied to a run inside the store's critical section.
pub type RunUpdate = Box<dyn FnOnce(&mut Run) + Send>;

/// Storage for runs, units and replies.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a new run.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Loads a run.
    async fn get_run(&self, id: RunId) -> Result<Run>;

    /// Applies `update` atomically and returns the updated run.
    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<Run>;

    /// Sets `new` if the current status is one of `expected`. Returns whether it was set.
    async fn compare_and_set_run_status(
        &self,
        id: RunId,
        expected: &[RunStatus],
        new: RunStatus,
    ) -> Result<bool>;

    /// Adds `child` to the root's dispatched set. Returns true only for the first add.
    async fn add_discharged_child(&self, root_id: RunId, child: &str) -> Result<bool>;

    /// Appends a retry record and returns it.
    async fn push_retry(&self, id: RunId, kind: RetryKind) -> Result<RetryRecord>;

    /// Child runs of a root.
    async fn find_children(&self, parent_id: RunId) -> Result<Vec<Run>>;

    /// Root runs owned by `board_name`, newest first.
    async fn find_runs(&self, board_name: &str) -> Result<Vec<Run>>;

    /// Persists new units.
    async fn insert_units(&self, units: &[WorkUnit]) -> Result<()>;

    /// Loads a unit.
    async fn get_unit(&self, id: UnitId) -> Result<WorkUnit>;

    /// Units of a run, oldest first.
    async fn find_units(&self, run_id: RunId) -> Result<Vec<WorkUnit>>;

    /// Overwrites a stage output.
    async fn set_output(&self, id: UnitId, stage: &str, output: StageOutput) -> Result<()>;

    /// Writes a stage output unless the stage already shows COMPLETE.
    /// Returns whether it was written.
    async fn set_output_unless_complete(
        &self,
        id: UnitId,
        stage: &str,
        output: StageOutput,
    ) -> Result<bool>;

    /// Records an error on the stage output and on the unit, keeping the output status.
    async fn record_failure(&self, id: UnitId, stage: &str, error: ErrorRecord) -> Result<()>;

    /// Increments the stage retry count and returns the new value.
    async fn increment_retry(&self, id: UnitId, stage: &str) -> Result<u32>;

    /// Clears every stage retry count on the given units.
    async fn clear_retries(&self, ids: &[UnitId]) -> Result<()>;

    /// Sets the unit's `marked_complete` flag.
    async fn mark_complete(&self, id: UnitId) -> Result<()>;

    /// Sets `aborted` on every unit of the run. Returns how many were flagged.
    async fn abort_units(&self, run_id: RunId) -> Result<usize>;

    /// Units of `board_name` runs owned by `namespace` whose `stage` output is
    /// WAITING since before `older_than`. A child run is owned by its root's
    /// board; a run without a parent is owned by its own board.
    async fn find_waiting(
        &self,
        namespace: &str,
        board_name: &str,
        stage: &str,
        older_than: Timestamp,
    ) -> Result<Vec<WorkUnit>>;

    /// Force-fails a WAITING stage output. Returns false if it was no longer WAITING.
    async fn fail_if_waiting(&self, id: UnitId, stage: &str, error: ErrorRecord) -> Result<bool>;

    /// Deletes units created before `before`. Returns how many were removed.
    async fn purge_units(&self, before: Timestamp) -> Result<usize>;

    /// Persists a handshake reply.
    async fn insert_reply(&self, reply: &Reply) -> Result<()>;

    /// Loads a handshake reply.
    async fn get_reply(&self, id: ReplyId) -> Result<Reply>;
}
