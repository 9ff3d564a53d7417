//! A group of background tasks sharing one shutdown token.

use super::CancellationToken;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Background tasks started by a running component.
///
/// Every task receives the group's token and must stop once it is cancelled.
pub struct WorkerGroup {
    token: Arc<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: Arc::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The group's shutdown token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Spawns a task bound to the group's token.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(Arc::clone(&self.token)));
        self.handles.lock().push(handle);
    }

    /// Adopts already spawned handles.
    pub fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.handles.lock().extend(handles);
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Cancels the token and waits for every task to finish.
    pub async fn shutdown(&self, reason: &str) {
        self.token.cancel(reason);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "Worker task ended abnormally");
            }
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("task_count", &self.task_count())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let group = WorkerGroup::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let stopped = Arc::clone(&stopped);
            group.spawn(move |token| async move {
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.task_count(), 3);

        group.shutdown("test").await;

        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert_eq!(group.task_count(), 0);
        assert_eq!(group.token().reason(), Some("test".to_string()));
    }
}
