//! In-memory counters with per-run expiry.
//!
//! A run's total and all of its status sets live in one entry, so a write to
//! any of them keeps the whole counter alive.

use super::{CounterProvider, CounterStatus, ProgressCounter, ProgressSummary};
use crate::core::{RunId, UnitId};
use crate::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    total: usize,
    sets: HashMap<String, HashSet<UnitId>>,
    expires_at: Instant,
}

impl Entry {
    fn new(expires_at: Instant) -> Self {
        Self {
            total: 0,
            sets: HashMap::new(),
            expires_at,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn count(&self, status: &str) -> usize {
        self.sets.get(status).map_or(0, HashSet::len)
    }
}

#[derive(Debug)]
struct Keyspace {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl Keyspace {
    /// Runs `write` on the live entry for `key`, creating it if absent or
    /// expired, and pushes the expiry out by the ttl.
    fn write<R>(&self, key: String, write: impl FnOnce(&mut Entry) -> R) -> R {
        let now = Instant::now();
        let deadline = now + self.ttl;
        let mut entry = self.entries.entry(key).or_insert_with(|| Entry::new(deadline));
        if !entry.is_live(now) {
            *entry = Entry::new(deadline);
        }
        entry.expires_at = deadline;
        write(&mut *entry)
    }

    /// Like [`Keyspace::write`] but leaves a missing or expired key alone.
    fn touch<R>(&self, key: &str, default: R, write: impl FnOnce(&mut Entry) -> R) -> R {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = now + self.ttl;
                write(&mut *entry)
            }
            _ => default,
        }
    }

    fn read<R>(&self, key: &str, default: R, read: impl FnOnce(&Entry) -> R) -> R {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => read(&*entry),
            _ => default,
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Provider of [`InMemoryProgressCounter`]s sharing one keyspace.
#[derive(Debug, Clone)]
pub struct InMemoryCounterProvider {
    keyspace: Arc<Keyspace>,
}

impl InMemoryCounterProvider {
    /// Creates a provider whose keys expire `ttl` after their last write.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            keyspace: Arc::new(Keyspace {
                entries: DashMap::new(),
                ttl,
            }),
        }
    }

    /// Number of live and expired run counters currently held.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keyspace.entries.len()
    }
}

impl Default for InMemoryCounterProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 24 * 60 * 60))
    }
}

impl CounterProvider for InMemoryCounterProvider {
    fn open(&self, prefix: &str, custom_statuses: &[&str]) -> Arc<dyn ProgressCounter> {
        Arc::new(InMemoryProgressCounter {
            prefix: prefix.to_string(),
            custom_statuses: custom_statuses.iter().map(ToString::to_string).collect(),
            keyspace: Arc::clone(&self.keyspace),
        })
    }

    fn purge_expired(&self) -> usize {
        self.keyspace.purge_expired()
    }
}

/// A counter namespace backed by the provider's keyspace.
#[derive(Debug)]
pub struct InMemoryProgressCounter {
    prefix: String,
    custom_statuses: Vec<String>,
    keyspace: Arc<Keyspace>,
}

impl InMemoryProgressCounter {
    fn key(&self, run_id: RunId) -> String {
        format!("{}:{run_id}", self.prefix)
    }

    fn empty_summary(&self) -> ProgressSummary {
        self.custom_statuses
            .iter()
            .fold(ProgressSummary::from_counts(0, 0, 0, 0, 0, 0), |summary, custom| {
                summary.with_custom(custom.clone(), 0)
            })
    }
}

#[async_trait]
impl ProgressCounter for InMemoryProgressCounter {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn init(&self, run_id: RunId, total: usize) -> Result<()> {
        self.keyspace.write(self.key(run_id), |entry| entry.total = total);
        Ok(())
    }

    async fn update(&self, run_id: RunId, unit_id: UnitId, status: CounterStatus) -> Result<()> {
        self.keyspace.write(self.key(run_id), |entry| {
            entry
                .sets
                .entry(status.as_str().to_string())
                .or_default()
                .insert(unit_id);
            if status.clears_failure() {
                if let Some(failed) = entry.sets.get_mut(CounterStatus::Failed.as_str()) {
                    failed.remove(&unit_id);
                }
            }
        });
        Ok(())
    }

    async fn members(&self, run_id: RunId, status: &CounterStatus) -> Result<HashSet<UnitId>> {
        Ok(self.keyspace.read(&self.key(run_id), HashSet::new(), |entry| {
            entry.sets.get(status.as_str()).cloned().unwrap_or_default()
        }))
    }

    async fn remove_member(
        &self,
        run_id: RunId,
        status: &CounterStatus,
        unit_id: UnitId,
    ) -> Result<bool> {
        Ok(self.keyspace.touch(&self.key(run_id), false, |entry| {
            entry
                .sets
                .get_mut(status.as_str())
                .is_some_and(|members| members.remove(&unit_id))
        }))
    }

    async fn summary(&self, run_id: RunId) -> Result<ProgressSummary> {
        let summary = self.keyspace.read(&self.key(run_id), None, |entry| {
            let count = |status: CounterStatus| entry.count(status.as_str());
            let mut summary = ProgressSummary::from_counts(
                entry.total,
                count(CounterStatus::Complete),
                count(CounterStatus::MarkedComplete),
                count(CounterStatus::Failed),
                count(CounterStatus::Aborted),
                count(CounterStatus::Skipped),
            );
            for custom in &self.custom_statuses {
                summary = summary.with_custom(custom.clone(), entry.count(custom));
            }
            Some(summary)
        });
        Ok(summary.unwrap_or_else(|| self.empty_summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_id;

    fn counter(provider: &InMemoryCounterProvider) -> Arc<dyn ProgressCounter> {
        provider.open("cb:main:import", &["pushed", "consumed"])
    }

    #[tokio::test]
    async fn test_summary_matches_recorded_members() {
        let provider = InMemoryCounterProvider::default();
        let counter = counter(&provider);
        let run = generate_id();
        counter.init(run, 10).await.unwrap();

        let units: Vec<UnitId> = (0..5).map(|_| generate_id()).collect();
        counter.update(run, units[0], CounterStatus::Complete).await.unwrap();
        counter.update(run, units[1], CounterStatus::Complete).await.unwrap();
        counter.update(run, units[2], CounterStatus::MarkedComplete).await.unwrap();
        counter.update(run, units[3], CounterStatus::Failed).await.unwrap();
        counter.update(run, units[4], CounterStatus::Skipped).await.unwrap();

        let summary = counter.summary(run).await.unwrap();
        assert_eq!(summary.total, 10);
        assert_eq!(summary.complete, 2);
        assert_eq!(summary.marked_complete, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!((summary.complete_ratio - 0.2222).abs() < 1e-3);
        assert!(!summary.is_all_done);
    }

    #[tokio::test]
    async fn test_complete_clears_failure() {
        let provider = InMemoryCounterProvider::default();
        let counter = counter(&provider);
        let run = generate_id();
        let unit = generate_id();
        counter.init(run, 1).await.unwrap();

        counter.update(run, unit, CounterStatus::Failed).await.unwrap();
        assert_eq!(counter.summary(run).await.unwrap().failed, 1);

        counter.update(run, unit, CounterStatus::Complete).await.unwrap();
        let summary = counter.summary(run).await.unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.complete, 1);
        assert!(summary.is_all_done);
    }

    #[tokio::test]
    async fn test_active_clears_failure_but_skipped_does_not() {
        let provider = InMemoryCounterProvider::default();
        let counter = counter(&provider);
        let run = generate_id();
        let (a, b) = (generate_id(), generate_id());

        counter.update(run, a, CounterStatus::Failed).await.unwrap();
        counter.update(run, b, CounterStatus::Failed).await.unwrap();
        counter.update(run, a, CounterStatus::Active).await.unwrap();
        counter.update(run, b, CounterStatus::Skipped).await.unwrap();

        let failed = counter.members(run, &CounterStatus::Failed).await.unwrap();
        assert_eq!(failed, HashSet::from([b]));
    }

    #[tokio::test]
    async fn test_custom_statuses_reported() {
        let provider = InMemoryCounterProvider::default();
        let counter = counter(&provider);
        let run = generate_id();
        let unit = generate_id();

        counter.update(run, unit, CounterStatus::Pushed).await.unwrap();
        counter.update(run, unit, CounterStatus::Pushed).await.unwrap();
        counter.update(run, unit, CounterStatus::Consumed).await.unwrap();

        let summary = counter.summary(run).await.unwrap();
        assert_eq!(summary.custom_count("pushed"), 1);
        assert_eq!(summary.custom_count("consumed"), 1);
    }

    #[tokio::test]
    async fn test_remove_member() {
        let provider = InMemoryCounterProvider::default();
        let counter = counter(&provider);
        let run = generate_id();
        let unit = generate_id();

        counter.update(run, unit, CounterStatus::Failed).await.unwrap();
        assert!(counter.remove_member(run, &CounterStatus::Failed, unit).await.unwrap());
        assert!(!counter.remove_member(run, &CounterStatus::Failed, unit).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let provider = InMemoryCounterProvider::default();
        let pipeline = provider.open("cb:main:import", &[]);
        let stage = provider.open("r:main:import:fetch", &[]);
        let run = generate_id();

        pipeline.update(run, generate_id(), CounterStatus::Complete).await.unwrap();
        assert_eq!(stage.summary(run).await.unwrap().complete, 0);
    }

    #[tokio::test]
    async fn test_expired_keys_read_empty_and_purge() {
        let provider = InMemoryCounterProvider::new(Duration::from_millis(10));
        let counter = provider.open("cb:main:import", &[]);
        let run = generate_id();
        counter.init(run, 3).await.unwrap();
        counter.update(run, generate_id(), CounterStatus::Complete).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let summary = counter.summary(run).await.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.complete, 0);
        assert_eq!(provider.purge_expired(), 1);
        assert_eq!(provider.key_count(), 0);
    }

    #[tokio::test]
    async fn test_any_write_keeps_the_whole_run_alive() {
        let provider = InMemoryCounterProvider::new(Duration::from_millis(100));
        let counter = provider.open("cb:main:import", &[]);
        let run = generate_id();
        counter.init(run, 3).await.unwrap();
        counter.update(run, generate_id(), CounterStatus::Failed).await.unwrap();
        counter.update(run, generate_id(), CounterStatus::Complete).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        counter.update(run, generate_id(), CounterStatus::Complete).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let summary = counter.summary(run).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.complete, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_all_done);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(counter.remove_member(run, &CounterStatus::Failed, generate_id()).await.is_ok());
        assert_eq!(counter.summary(run).await.unwrap().total, 0);
    }
}
