//! Run lifecycle notifications.
//!
//! Orchestrators and standalone pipelines report `start`, `done`, `retry`
//! and `abort` to a [`Notifier`]. Delivery is fire-and-forget: a failing
//! notifier is logged and never fails the run.

mod notifier;
#[cfg(feature = "webhook")]
mod webhook;

pub use notifier::{
    dispatch, CollectingNotifier, LoggingNotifier, NoOpNotifier, Notification, NotificationKind,
    Notifier,
};
#[cfg(test)]
pub use notifier::MockNotifier;
#[cfg(feature = "webhook")]
pub use webhook::WebhookNotifier;
