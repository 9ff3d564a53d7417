//! Handshake reply timeouts.
//!
//! Every replica runs a sweeper per handshake stage; the stage lock makes sure
//! only one of them scans at a time, and `fail_if_waiting` makes sure a unit
//! whose reply lands mid-sweep is never failed.

use super::runtime::{StageListener, StageRuntime};
use crate::cancellation::CancellationToken;
use crate::core::ErrorRecord;
use crate::errors::{Result, SwitchboardError};
use crate::progress::CounterStatus;
use crate::utils::before_now;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

impl StageRuntime {
    /// Fails every unit that has been WAITING on this stage for longer than
    /// the timeout. Returns how many units were failed; 0 when another
    /// replica holds the sweep lock.
    pub async fn sweep_timeouts(&self, listener: &dyn StageListener) -> Result<usize> {
        let Some(lease) = self
            .locks()
            .try_lock(self.lock_resource(), self.sweep_lock_ttl())
            .await?
        else {
            debug!(stage = %self.name(), "Sweep lock held elsewhere");
            return Ok(0);
        };

        let outcome = self.sweep_locked(listener).await;
        if let Err(err) = lease.unlock().await {
            warn!(stage = %self.name(), error = %err, "Could not release sweep lock");
        }
        outcome
    }

    async fn sweep_locked(&self, listener: &dyn StageListener) -> Result<usize> {
        let timeout = self.timeout();
        let error = SwitchboardError::HandshakeTimeout {
            stage: self.name().to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let stale = self
            .store()
            .find_waiting(
                self.namespace(),
                self.pipeline(),
                self.name(),
                before_now(timeout),
            )
            .await?;

        let mut failed = 0;
        for unit in stale {
            let record = ErrorRecord::new(self.name(), error.to_string());
            if !self.store().fail_if_waiting(unit.id, self.name(), record).await? {
                continue;
            }
            self.counter()
                .update(unit.run_id, unit.id, CounterStatus::Failed)
                .await?;
            self.notify_failed(unit.run_id, unit.id, &error, listener).await;
            failed += 1;
        }

        if failed > 0 {
            info!(stage = %self.name(), failed, "Handshake timeouts swept");
        }
        Ok(failed)
    }
}

/// Sweeps `stage` every `period` until `shutdown` is cancelled.
pub(crate) async fn run_sweeper(
    stage: Arc<StageRuntime>,
    listener: Arc<dyn StageListener>,
    period: Duration,
    shutdown: Arc<CancellationToken>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = stage.sweep_timeouts(listener.as_ref()).await {
            warn!(stage = %stage.name(), error = %err, "Timeout sweep failed");
        }
    }
    debug!(stage = %stage.name(), "Sweeper stopped");
}
