//! Test fixtures: in-memory connections and polling helpers.

use crate::config::EngineConfig;
use crate::connections::Connections;
use crate::core::{Run, RunId, RunStatus, UnitId, WorkUnit};
use crate::errors::{Result, SwitchboardError};
use crate::events::{CollectingNotifier, Notifier};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// In-memory connections with a collecting notifier and fast timings.
pub struct TestHarness {
    /// The connections to start pipelines and orchestrators with.
    pub conn: Connections,
    /// Every notification sent on `conn`.
    pub notifier: Arc<CollectingNotifier>,
    /// How long the `wait_*` helpers poll before giving up.
    pub timeout: Duration,
}

impl TestHarness {
    /// A harness with [`TestHarness::fast_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::fast_config())
    }

    /// A harness with an explicit config.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let notifier = Arc::new(CollectingNotifier::new());
        let shared: Arc<dyn Notifier> = notifier.clone();
        let conn = Connections::in_memory(config).with_notifier(shared);
        Self {
            conn,
            notifier,
            timeout: Duration::from_secs(5),
        }
    }

    /// Defaults with no retry delays and short sweep and orchestrator-retry intervals.
    #[must_use]
    pub fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_default_stage_retry(2, Duration::ZERO)
            .with_orchestrator_retry(0, Duration::from_millis(10))
            .with_sweep_interval(Duration::from_millis(20))
    }

    /// Polls until `check` returns `Some`, or fails after `self.timeout`.
    pub async fn wait_for<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SwitchboardError::Internal(format!(
                    "timed out waiting for {what}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits until the run reaches a terminal status.
    pub async fn wait_for_run(&self, run_id: RunId) -> Result<Run> {
        let store = Arc::clone(&self.conn.store);
        self.wait_for("run to finish", || {
            let store = Arc::clone(&store);
            async move {
                let run = store.get_run(run_id).await?;
                Ok::<_, SwitchboardError>(run.status.is_terminal().then_some(run))
            }
        })
        .await
    }

    /// Waits until the run shows `status`.
    pub async fn wait_for_status(&self, run_id: RunId, status: RunStatus) -> Result<Run> {
        let store = Arc::clone(&self.conn.store);
        self.wait_for(&format!("run status {status}"), || {
            let store = Arc::clone(&store);
            async move {
                let run = store.get_run(run_id).await?;
                Ok::<_, SwitchboardError>((run.status == status).then_some(run))
            }
        })
        .await
    }

    /// Waits until `predicate` holds for the stored unit.
    pub async fn wait_for_unit(
        &self,
        unit_id: UnitId,
        predicate: impl Fn(&WorkUnit) -> bool,
    ) -> Result<WorkUnit> {
        let store = Arc::clone(&self.conn.store);
        let predicate = &predicate;
        self.wait_for("unit condition", || {
            let store = Arc::clone(&store);
            async move {
                let unit = store.get_unit(unit_id).await?;
                Ok::<_, SwitchboardError>(predicate(&unit).then_some(unit))
            }
        })
        .await
    }

    /// Waits until the run has generated its units and returns them.
    pub async fn wait_for_units(&self, run_id: RunId, count: usize) -> Result<Vec<WorkUnit>> {
        let store = Arc::clone(&self.conn.store);
        self.wait_for("units to be generated", || {
            let store = Arc::clone(&store);
            async move {
                let run = store.get_run(run_id).await?;
                if run.source.total_units < count {
                    return Ok::<_, SwitchboardError>(None);
                }
                let units = store.find_units(run_id).await?;
                Ok::<_, SwitchboardError>((units.len() >= count).then_some(units))
            }
        })
        .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotificationKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_collects_what_connections_send() {
        let harness = TestHarness::new();
        harness
            .conn
            .notifier
            .send(
                NotificationKind::Start,
                crate::events::Notification::new("orders", json!({}), RunStatus::Active),
            )
            .await
            .unwrap();

        assert_eq!(harness.notifier.of_kind(NotificationKind::Start).len(), 1);
    }
}
