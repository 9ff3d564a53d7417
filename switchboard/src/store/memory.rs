//! In-memory store. Each operation runs under a single lock acquisition.

use super::{RunUpdate, Store};
use crate::core::{
    ErrorRecord, OutputStatus, Reply, ReplyId, RetryKind, RetryRecord, Run, RunId, RunStatus,
    StageOutput, UnitId, WorkUnit,
};
use crate::errors::{NotFoundError, Result};
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A [`Store`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: RwLock<HashMap<RunId, Run>>,
    units: RwLock<HashMap<UnitId, WorkUnit>>,
    replies: RwLock<HashMap<ReplyId, Reply>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.read().len()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    fn with_run<T>(&self, id: RunId, f: impl FnOnce(&mut Run) -> T) -> Result<T> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&id).ok_or_else(|| NotFoundError::run(id))?;
        let result = f(run);
        run.updated_at = now_utc();
        Ok(result)
    }

    fn with_unit<T>(&self, id: UnitId, f: impl FnOnce(&mut WorkUnit) -> T) -> Result<T> {
        let mut units = self.units.write();
        let unit = units.get_mut(&id).ok_or_else(|| NotFoundError::unit(id))?;
        let result = f(unit);
        unit.updated_at = now_utc();
        Ok(result)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.runs.write().insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        self.runs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::run(id).into())
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<Run> {
        self.with_run(id, |run| {
            update(run);
            run.clone()
        })
    }

    async fn compare_and_set_run_status(
        &self,
        id: RunId,
        expected: &[RunStatus],
        new: RunStatus,
    ) -> Result<bool> {
        self.with_run(id, |run| {
            if expected.contains(&run.status) {
                run.status = new;
                true
            } else {
                false
            }
        })
    }

    async fn add_discharged_child(&self, root_id: RunId, child: &str) -> Result<bool> {
        self.with_run(root_id, |run| run.discharged_children.insert(child.to_string()))
    }

    async fn push_retry(&self, id: RunId, kind: RetryKind) -> Result<RetryRecord> {
        self.with_run(id, |run| {
            let record = RetryRecord {
                at: now_utc(),
                attempt: u32::try_from(run.retry_history.len() + 1).unwrap_or(u32::MAX),
                kind,
            };
            run.retry_history.push(record.clone());
            record
        })
    }

    async fn find_children(&self, parent_id: RunId) -> Result<Vec<Run>> {
        let mut children: Vec<Run> = self
            .runs
            .read()
            .values()
            .filter(|run| run.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|run| run.created_at);
        Ok(children)
    }

    async fn find_runs(&self, board_name: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .filter(|run| run.is_root() && run.board_name == board_name)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn insert_units(&self, units: &[WorkUnit]) -> Result<()> {
        let mut stored = self.units.write();
        for unit in units {
            stored.insert(unit.id, unit.clone());
        }
        Ok(())
    }

    async fn get_unit(&self, id: UnitId) -> Result<WorkUnit> {
        self.units
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::unit(id).into())
    }

    async fn find_units(&self, run_id: RunId) -> Result<Vec<WorkUnit>> {
        let mut units: Vec<WorkUnit> = self
            .units
            .read()
            .values()
            .filter(|unit| unit.run_id == run_id)
            .cloned()
            .collect();
        units.sort_by_key(|unit| unit.created_at);
        Ok(units)
    }

    async fn set_output(&self, id: UnitId, stage: &str, output: StageOutput) -> Result<()> {
        self.with_unit(id, |unit| {
            unit.outputs.insert(stage.to_string(), output);
        })
    }

    async fn set_output_unless_complete(
        &self,
        id: UnitId,
        stage: &str,
        output: StageOutput,
    ) -> Result<bool> {
        self.with_unit(id, |unit| {
            if unit.is_stage_complete(stage) {
                false
            } else {
                unit.outputs.insert(stage.to_string(), output);
                true
            }
        })
    }

    async fn record_failure(&self, id: UnitId, stage: &str, error: ErrorRecord) -> Result<()> {
        self.with_unit(id, |unit| {
            unit.outputs.entry(stage.to_string()).or_default().error = Some(error.clone());
            unit.error = Some(error);
        })
    }

    async fn increment_retry(&self, id: UnitId, stage: &str) -> Result<u32> {
        self.with_unit(id, |unit| {
            let count = unit.retry_counts.entry(stage.to_string()).or_insert(0);
            *count += 1;
            *count
        })
    }

    async fn clear_retries(&self, ids: &[UnitId]) -> Result<()> {
        let mut units = self.units.write();
        let now = now_utc();
        for id in ids {
            if let Some(unit) = units.get_mut(id) {
                unit.retry_counts.clear();
                unit.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_complete(&self, id: UnitId) -> Result<()> {
        self.with_unit(id, |unit| unit.marked_complete = true)
    }

    async fn abort_units(&self, run_id: RunId) -> Result<usize> {
        let mut units = self.units.write();
        let now = now_utc();
        let mut flagged = 0;
        for unit in units.values_mut().filter(|unit| unit.run_id == run_id) {
            unit.aborted = true;
            unit.updated_at = now;
            flagged += 1;
        }
        Ok(flagged)
    }

    async fn find_waiting(
        &self,
        namespace: &str,
        board_name: &str,
        stage: &str,
        older_than: Timestamp,
    ) -> Result<Vec<WorkUnit>> {
        let runs = self.runs.read();
        let owned = |run: &Run| match run.parent_id {
            Some(parent) => runs
                .get(&parent)
                .is_some_and(|root| root.board_name == namespace),
            None => run.board_name == namespace,
        };
        let run_ids: Vec<RunId> = runs
            .values()
            .filter(|run| run.board_name == board_name && owned(run))
            .map(|run| run.id)
            .collect();
        drop(runs);

        let units = self.units.read();
        Ok(units
            .values()
            .filter(|unit| run_ids.contains(&unit.run_id))
            .filter(|unit| {
                unit.output(stage).is_some_and(|output| {
                    output.status == Some(OutputStatus::Waiting)
                        && output.timestamp.is_some_and(|at| at < older_than)
                })
            })
            .cloned()
            .collect())
    }

    async fn fail_if_waiting(&self, id: UnitId, stage: &str, error: ErrorRecord) -> Result<bool> {
        self.with_unit(id, |unit| {
            if unit.output_status(stage) != Some(OutputStatus::Waiting) {
                return false;
            }
            unit.outputs
                .insert(stage.to_string(), StageOutput::failed(Some(error.clone())));
            unit.error = Some(error);
            true
        })
    }

    async fn purge_units(&self, before: Timestamp) -> Result<usize> {
        let mut units = self.units.write();
        let count = units.len();
        units.retain(|_, unit| unit.created_at >= before);
        Ok(count - units.len())
    }

    async fn insert_reply(&self, reply: &Reply) -> Result<()> {
        self.replies.write().insert(reply.id, reply.clone());
        Ok(())
    }

    async fn get_reply(&self, id: ReplyId) -> Result<Reply> {
        self.replies
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| NotFoundError::reply(id).into())
    }
}
