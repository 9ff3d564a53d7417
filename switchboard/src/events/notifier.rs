//! Notifier trait and in-process implementations.

use crate::core::RunStatus;
use crate::errors::Result;
use crate::progress::ProgressSummary;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// The lifecycle moment being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A run was discharged.
    Start,
    /// A run finished (complete or failed).
    Done,
    /// A run is being retried.
    Retry,
    /// A run was aborted.
    Abort,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Done => write!(f, "done"),
            Self::Retry => write!(f, "retry"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// What a notification carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Orchestrator or pipeline name.
    pub pipeline_name: String,
    /// The run's discharge payload.
    pub payload: serde_json::Value,
    /// Run status at the time of the notification.
    pub status: RunStatus,
    /// Aggregated stats, when known.
    pub stats: Option<ProgressSummary>,
}

impl Notification {
    /// Creates a notification without stats.
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>, payload: serde_json::Value, status: RunStatus) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            payload,
            status,
            stats: None,
        }
    }

    /// Attaches stats.
    #[must_use]
    pub fn with_stats(mut self, stats: Option<ProgressSummary>) -> Self {
        self.stats = stats;
        self
    }
}

/// Receives run lifecycle notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification.
    async fn send(&self, kind: NotificationKind, notification: Notification) -> Result<()>;
}

/// Sends a notification, logging instead of propagating failures.
pub async fn dispatch(notifier: &dyn Notifier, kind: NotificationKind, notification: Notification) {
    let pipeline = notification.pipeline_name.clone();
    if let Err(error) = notifier.send(kind, notification).await {
        warn!(pipeline = %pipeline, kind = %kind, error = %error, "Notification failed");
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn send(&self, _kind: NotificationKind, _notification: Notification) -> Result<()> {
        Ok(())
    }
}

/// Logs every notification at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, kind: NotificationKind, notification: Notification) -> Result<()> {
        info!(
            kind = %kind,
            pipeline = %notification.pipeline_name,
            status = %notification.status,
            complete_ratio = notification.stats.as_ref().map(|s| s.complete_ratio),
            "Run {}", kind
        );
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    sent: RwLock<Vec<(NotificationKind, Notification)>>,
}

impl CollectingNotifier {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications received so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<(NotificationKind, Notification)> {
        self.sent.read().clone()
    }

    /// Notifications of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Number of notifications received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.read().len()
    }

    /// True if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.read().is_empty()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, kind: NotificationKind, notification: Notification) -> Result<()> {
        self.sent.write().push((kind, notification));
        Ok(())
    }
}
