//! Test assertions for runs, units and summaries.

use crate::core::{OutputStatus, Run, RunStatus, WorkUnit};
use crate::progress::ProgressSummary;

/// Asserts that the run has the expected status.
pub fn assert_run_status(run: &Run, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {}, got {}",
        run.id, expected, run.status
    );
}

/// Asserts that the stage shows COMPLETE on the unit.
pub fn assert_stage_complete(unit: &WorkUnit, stage: &str) {
    assert!(
        unit.is_stage_complete(stage),
        "Expected stage '{}' complete on unit {}, got {:?}",
        stage,
        unit.id,
        unit.output_status(stage)
    );
}

/// Asserts the stage output status on the unit.
pub fn assert_stage_status(unit: &WorkUnit, stage: &str, expected: Option<OutputStatus>) {
    assert_eq!(
        unit.output_status(stage),
        expected,
        "Unexpected status for stage '{}' on unit {}",
        stage,
        unit.id
    );
}

/// Asserts the summary's complete and failed counts.
pub fn assert_counts(summary: &ProgressSummary, complete: usize, failed: usize) {
    assert_eq!(
        (summary.complete, summary.failed),
        (complete, failed),
        "Expected complete={complete} failed={failed}, got {summary:?}"
    );
}
