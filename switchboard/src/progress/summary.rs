//! Counter summaries backing every completion decision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated counts for one run under one counter namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Units expected.
    pub total: usize,
    /// Units that reached ground complete.
    pub complete: usize,
    /// Units short-circuited by a handler.
    pub marked_complete: usize,
    /// Units currently failed.
    pub failed: usize,
    /// Units that observed an abort.
    pub aborted: usize,
    /// Units skipped past this counter.
    pub skipped: usize,
    /// True once every unit is complete, failed or skipped.
    pub is_all_done: bool,
    /// `complete / (total - skipped)`, 0 when nothing is countable.
    pub complete_ratio: f64,
    /// `total - skipped - failed`.
    pub probable_complete: i64,
    /// Custom status counts.
    #[serde(default)]
    pub custom: BTreeMap<String, usize>,
}

impl ProgressSummary {
    /// Builds a summary from raw counts, deriving the ratio and done flags.
    #[must_use]
    pub fn from_counts(
        total: usize,
        complete: usize,
        marked_complete: usize,
        failed: usize,
        aborted: usize,
        skipped: usize,
    ) -> Self {
        let countable = to_i64(total) - to_i64(skipped);
        #[allow(clippy::cast_precision_loss)]
        let complete_ratio = if countable > 0 {
            complete as f64 / countable as f64
        } else {
            0.0
        };

        Self {
            total,
            complete,
            marked_complete,
            failed,
            aborted,
            skipped,
            is_all_done: total > 0 && total == complete + failed + skipped,
            complete_ratio,
            probable_complete: to_i64(total) - to_i64(skipped) - to_i64(failed),
            custom: BTreeMap::new(),
        }
    }

    /// Adds a custom status count.
    #[must_use]
    pub fn with_custom(mut self, status: impl Into<String>, count: usize) -> Self {
        self.custom.insert(status.into(), count);
        self
    }

    /// Returns a custom status count (0 if not tracked).
    #[must_use]
    pub fn custom_count(&self, status: &str) -> usize {
        self.custom.get(status).copied().unwrap_or(0)
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_excludes_skipped() {
        let summary = ProgressSummary::from_counts(10, 2, 1, 1, 0, 1);

        assert!((summary.complete_ratio - 2.0 / 9.0).abs() < 1e-9);
        assert!(!summary.is_all_done);
        assert_eq!(summary.probable_complete, 8);
    }

    #[test]
    fn test_ratio_zero_when_everything_skipped() {
        let summary = ProgressSummary::from_counts(4, 0, 0, 0, 0, 4);
        assert!(summary.complete_ratio.abs() < f64::EPSILON);
        assert!(summary.is_all_done);
    }

    #[test]
    fn test_empty_run_is_never_done() {
        let summary = ProgressSummary::from_counts(0, 0, 0, 0, 0, 0);
        assert!(!summary.is_all_done);
        assert!(summary.complete_ratio.abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_done_mixes_failed_and_skipped() {
        let summary = ProgressSummary::from_counts(5, 3, 0, 1, 0, 1);
        assert!(summary.is_all_done);
        assert!((summary.complete_ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_custom_counts() {
        let summary = ProgressSummary::from_counts(1, 0, 0, 0, 0, 0).with_custom("pushed", 1);
        assert_eq!(summary.custom_count("pushed"), 1);
        assert_eq!(summary.custom_count("consumed"), 0);
    }
}
