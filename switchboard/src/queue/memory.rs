//! In-memory priority queue with delayed jobs.

use super::{Job, PushOptions, Queue, QueueProvider};
use crate::errors::{Result, SwitchboardError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: the lowest priority value, then the oldest sequence, pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    delayed: AtomicUsize,
    notify: Notify,
}

impl Shared {
    fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SwitchboardError::Queue(format!("queue '{}' is closed", job.queue)));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { seq, job });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn enqueue_later(self: &Arc<Self>, job: Job, delay: Duration) {
        self.delayed.fetch_add(1, AtomicOrdering::SeqCst);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.delayed.fetch_sub(1, AtomicOrdering::SeqCst);
            let (queue, job_id) = (job.queue.clone(), job.id);
            if let Err(err) = shared.enqueue(job) {
                debug!(queue = %queue, job_id = %job_id, error = %err, "Delayed job dropped");
            }
        });
    }
}

/// A [`Queue`] held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    name: String,
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// True once [`Queue::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn schedule(&self, job: Job, delay: Option<Duration>) -> Result<()> {
        match delay {
            Some(delay) if !delay.is_zero() => {
                if self.is_closed() {
                    return Err(SwitchboardError::Queue(format!(
                        "queue '{}' is closed",
                        self.name
                    )));
                }
                self.shared.enqueue_later(job, delay);
                Ok(())
            }
            _ => self.shared.enqueue(job),
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, payload: serde_json::Value, options: PushOptions) -> Result<Uuid> {
        let job = Job::new(self.name.clone(), payload, options.priority.unwrap_or(0));
        let id = job.id;
        self.schedule(job, options.delay)?;
        Ok(id)
    }

    async fn next_job(&self) -> Option<Job> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.heap.pop() {
                    if !state.heap.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(entry.job);
                }
            }
            notified.await;
        }
    }

    async fn retry(&self, mut job: Job, delay: Duration) -> Result<()> {
        job.attempts += 1;
        self.schedule(job, Some(delay))
    }

    async fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.heap.clear();
        drop(state);
        self.shared.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.shared.state.lock().heap.len() + self.shared.delayed.load(AtomicOrdering::SeqCst)
    }
}

/// Provider handing out shared [`InMemoryQueue`]s.
#[derive(Debug, Default)]
pub struct InMemoryQueueProvider {
    queues: DashMap<String, InMemoryQueue>,
}

impl InMemoryQueueProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every queue opened so far.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl QueueProvider for InMemoryQueueProvider {
    fn open(&self, name: &str) -> Arc<dyn Queue> {
        let mut entry = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| InMemoryQueue::new(name));
        if entry.is_closed() {
            *entry = InMemoryQueue::new(name);
        }
        Arc::new(entry.clone())
    }
}
