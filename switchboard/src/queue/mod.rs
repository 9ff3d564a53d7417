//! Queue collaborator: durable per-stage job queues.
//!
//! Queues carry JSON payloads. Components decode them into the typed jobs in
//! [`jobs`] and consume them with [`spawn_workers`].

pub mod jobs;
mod memory;
mod worker;

pub use jobs::{DoneJob, JobPayload, ReplyJob, RunJob, UnitJob};
pub use memory::{InMemoryQueue, InMemoryQueueProvider};
pub use worker::{spawn_workers, JobHandler, QueueEvent};

use crate::errors::Result;
use crate::utils::{generate_id, now_utc, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identity, stable across retries.
    pub id: Uuid,
    /// The queue the job was pushed to.
    pub queue: String,
    /// Encoded payload.
    pub payload: serde_json::Value,
    /// Priority (lower runs first).
    pub priority: i32,
    /// How many times the job was re-enqueued with [`Queue::retry`].
    pub attempts: u32,
    /// When the job was first pushed.
    pub enqueued_at: Timestamp,
}

impl Job {
    /// Creates a job for `queue`.
    #[must_use]
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, priority: i32) -> Self {
        Self {
            id: generate_id(),
            queue: queue.into(),
            payload,
            priority,
            attempts: 0,
            enqueued_at: now_utc(),
        }
    }
}

/// Options for [`Queue::push`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Delay before the job becomes visible.
    pub delay: Option<Duration>,
    /// Priority (lower runs first, default 0).
    pub priority: Option<i32>,
}

impl PushOptions {
    /// Sets the delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }
}

/// A named job queue shared by every worker of a stage.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Enqueues a payload.
    async fn push(&self, payload: serde_json::Value, options: PushOptions) -> Result<Uuid>;

    /// Waits for the next visible job. Returns `None` once the queue is closed.
    async fn next_job(&self) -> Option<Job>;

    /// Re-enqueues the same job after `delay`.
    async fn retry(&self, job: Job, delay: Duration) -> Result<()>;

    /// Closes the queue and wakes every waiting consumer.
    async fn close(&self);

    /// Jobs waiting or delayed.
    fn len(&self) -> usize;

    /// True when no job is waiting or delayed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens queues by name. Opening the same name twice yields the same queue.
pub trait QueueProvider: Send + Sync {
    /// Opens (or creates) the named queue.
    fn open(&self, name: &str) -> Arc<dyn Queue>;
}

/// Queue name for a stage's primary queue.
#[must_use]
pub fn stage_queue_name(namespace: &str, pipeline: &str, stage: &str) -> String {
    format!("{namespace}:{pipeline}:{stage}")
}

/// Queue name for a handshake stage's reply queue.
#[must_use]
pub fn reply_queue_name(namespace: &str, pipeline: &str, stage: &str) -> String {
    format!("{namespace}:{pipeline}:{stage}:reply")
}

/// Queue name for a pipeline's source.
#[must_use]
pub fn source_queue_name(namespace: &str, pipeline: &str) -> String {
    format!("{namespace}:{pipeline}:power_source")
}

/// Queue name for an owner's done events.
#[must_use]
pub fn done_queue_name(namespace: &str) -> String {
    format!("{namespace}:done")
}
