//! Consume loops over a [`Queue`].

use super::{Job, Queue};
use crate::cancellation::CancellationToken;
use crate::errors::{Result, SwitchboardError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle events a worker reports for each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// A worker picked the job up.
    Active,
    /// The handler returned `Ok`.
    Completed,
    /// The handler returned an error.
    Failed,
}

/// Processes jobs from one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles one job.
    async fn handle(&self, job: &Job) -> Result<()>;

    /// Observes job lifecycle events.
    async fn on_event(&self, _event: QueueEvent, _job: &Job) {}

    /// Called after `handle` failed.
    async fn on_failed(&self, job: &Job, error: &SwitchboardError) {
        warn!(queue = %job.queue, job_id = %job.id, error = %error, "Job failed");
    }
}

/// Spawns `concurrency` workers consuming `queue` until `shutdown` is cancelled
/// or the queue is closed.
pub fn spawn_workers(
    queue: Arc<dyn Queue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    shutdown: Arc<CancellationToken>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                debug!(queue = %queue.name(), worker, "Worker started");
                loop {
                    let job = tokio::select! {
                        () = shutdown.cancelled() => break,
                        job = queue.next_job() => job,
                    };
                    let Some(job) = job else { break };

                    handler.on_event(QueueEvent::Active, &job).await;
                    match handler.handle(&job).await {
                        Ok(()) => handler.on_event(QueueEvent::Completed, &job).await,
                        Err(error) => {
                            handler.on_event(QueueEvent::Failed, &job).await;
                            handler.on_failed(&job, &error).await;
                        }
                    }
                }
                debug!(queue = %queue.name(), worker, "Worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, PushOptions};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(QueueEvent, serde_json::Value)>>,
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<()> {
            if job.payload == json!("bad") {
                return Err(SwitchboardError::Internal("bad payload".to_string()));
            }
            Ok(())
        }

        async fn on_event(&self, event: QueueEvent, job: &Job) {
            self.events.lock().push((event, job.payload.clone()));
        }

        async fn on_failed(&self, _job: &Job, error: &SwitchboardError) {
            self.failures.lock().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_workers_report_events_and_stop() {
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new("q"));
        let recorder = Arc::new(Recorder::default());
        let shutdown = Arc::new(CancellationToken::new());

        let handles = spawn_workers(
            Arc::clone(&queue),
            recorder.clone() as Arc<dyn JobHandler>,
            1,
            Arc::clone(&shutdown),
        );
        queue.push(json!("good"), PushOptions::default()).await.unwrap();
        queue.push(json!("bad"), PushOptions::default()).await.unwrap();

        for _ in 0..100 {
            if recorder.events.lock().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel("done");
        for handle in handles {
            handle.await.unwrap();
        }

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                (QueueEvent::Active, json!("good")),
                (QueueEvent::Completed, json!("good")),
                (QueueEvent::Active, json!("bad")),
                (QueueEvent::Failed, json!("bad")),
            ]
        );
        assert_eq!(recorder.failures.lock().len(), 1);
    }
}
