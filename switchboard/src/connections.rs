//! The collaborator bundle injected into pipelines and orchestrators at start.

use crate::config::EngineConfig;
use crate::events::{NoOpNotifier, Notifier};
use crate::lock::{InMemoryLockProvider, LockProvider};
use crate::progress::{CounterProvider, InMemoryCounterProvider};
use crate::queue::{InMemoryQueueProvider, QueueProvider};
use crate::store::{InMemoryStore, Store};
use std::sync::Arc;

/// Store, queues, counters, locks and notifier shared by running components.
#[derive(Clone)]
pub struct Connections {
    /// Unit, run and reply persistence.
    pub store: Arc<dyn Store>,
    /// Job queues.
    pub queues: Arc<dyn QueueProvider>,
    /// Progress counters.
    pub counters: Arc<dyn CounterProvider>,
    /// Distributed locks.
    pub locks: Arc<dyn LockProvider>,
    /// Run lifecycle notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Engine tunables.
    pub config: EngineConfig,
}

impl Connections {
    /// Bundles explicit collaborators with the default config and no notifier.
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<dyn QueueProvider>,
        counters: Arc<dyn CounterProvider>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            store,
            queues,
            counters,
            locks,
            notifier: Arc::new(NoOpNotifier),
            config: EngineConfig::default(),
        }
    }

    /// Fully in-process collaborators configured by `config`.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            queues: Arc::new(InMemoryQueueProvider::new()),
            counters: Arc::new(InMemoryCounterProvider::new(config.counter_ttl)),
            locks: Arc::new(InMemoryLockProvider::new()),
            notifier: Arc::new(NoOpNotifier),
            config,
        }
    }

    /// Replaces the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replaces the config.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
