//! A started orchestrator: cross-pipeline dispatch, done handling and retries.

use super::builder::Orchestrator;
use super::stats::{AggregateStats, PendingPipeline, RunOverview, SubRun};
use crate::cancellation::WorkerGroup;
use crate::connections::Connections;
use crate::core::{Reply, RetryKind, Run, RunId, RunOptions, RunStatus, UnitId};
use crate::errors::{NotFoundError, Result};
use crate::events::{dispatch, Notification, NotificationKind, Notifier};
use crate::pipeline::RunningPipeline;
use crate::progress::{CounterProvider, ProgressSummary};
use crate::queue::{done_queue_name, spawn_workers, DoneJob, Job, JobHandler, JobPayload, Queue};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::utils::before_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a [`RunningOrchestrator::clean`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    /// Work units purged.
    pub units: usize,
    /// Counter keys purged.
    pub counters: usize,
}

impl Orchestrator {
    /// Starts every pipeline under this orchestrator's namespace and begins
    /// consuming their done events.
    pub fn start(&self, conn: &Connections) -> Arc<RunningOrchestrator> {
        let done_queue = conn.queues.open(&done_queue_name(self.name()));
        let pipelines = self
            .pipelines()
            .iter()
            .map(|pipeline| pipeline.start_under(conn, self.name(), Arc::clone(&done_queue)))
            .collect();

        let running = Arc::new(RunningOrchestrator {
            name: self.name().to_string(),
            pipelines,
            done_queue: Arc::clone(&done_queue),
            store: Arc::clone(&conn.store),
            counters: Arc::clone(&conn.counters),
            notifier: Arc::clone(&conn.notifier),
            retry: conn.config.orchestrator_retry(),
            retention: conn.config.unit_retention,
            workers: WorkerGroup::new(),
        });

        running.workers.track(spawn_workers(
            done_queue,
            Arc::new(DoneConsumer {
                orchestrator: Arc::clone(&running),
            }),
            conn.config.stage_concurrency,
            Arc::clone(running.workers.token()),
        ));

        info!(
            orchestrator = %running.name,
            pipelines = running.pipelines.len(),
            retry_limit = running.retry.limit,
            "Orchestrator started"
        );
        running
    }
}

/// An orchestrator bound to its running pipelines and done queue.
pub struct RunningOrchestrator {
    name: String,
    pipelines: Vec<Arc<RunningPipeline>>,
    done_queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    counters: Arc<dyn CounterProvider>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    retention: Duration,
    workers: WorkerGroup,
}

impl RunningOrchestrator {
    /// The orchestrator name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Running pipelines in registration order.
    #[must_use]
    pub fn pipelines(&self) -> &[Arc<RunningPipeline>] {
        &self.pipelines
    }

    /// A running pipeline by name.
    pub fn pipeline(&self, name: &str) -> Result<&Arc<RunningPipeline>> {
        self.pipelines
            .iter()
            .find(|pipeline| pipeline.name() == name)
            .ok_or_else(|| NotFoundError::pipeline(name).into())
    }

    /// Creates a root run and dispatches every pipeline with no dependencies.
    pub async fn discharge(
        &self,
        payload: serde_json::Value,
        options: RunOptions,
    ) -> Result<Run> {
        let root = Run::root(&self.name, payload)
            .with_options(options)
            .with_status(RunStatus::Active);
        self.store.insert_run(&root).await?;
        info!(orchestrator = %self.name, run_id = %root.id, "Root run discharged");

        let notification = Notification::new(&self.name, root.payload.clone(), root.status);
        dispatch(self.notifier.as_ref(), NotificationKind::Start, notification).await;

        self.dispatch_ready(root.id).await?;
        self.store.get_run(root.id).await
    }

    /// Dispatches every pipeline whose dependencies completed under the root
    /// and which has not been dispatched yet. Returns true if anything was
    /// dispatched by this call.
    ///
    /// Concurrent callers race on the store's atomic add-to-set, so each
    /// pipeline is dispatched at most once per root.
    pub async fn dispatch_ready(&self, root_id: RunId) -> Result<bool> {
        let root = self.store.get_run(root_id).await?;
        if root.status == RunStatus::Aborted {
            return Ok(false);
        }
        let completed = self.completed_children(root_id).await?;

        let mut dispatched = false;
        for pipeline in &self.pipelines {
            let name = pipeline.name();
            if completed.contains(name) {
                continue;
            }
            let ready = pipeline
                .pipeline()
                .depends_on()
                .iter()
                .all(|dependency| completed.contains(dependency));
            if !ready || !self.store.add_discharged_child(root_id, name).await? {
                continue;
            }

            let child = pipeline
                .discharge(Some(root_id), root.payload.clone(), root.options)
                .await?;
            dispatched = true;
            debug!(orchestrator = %self.name, pipeline = %name, run_id = %child.id, "Pipeline dispatched");

            if self.store.get_run(root_id).await?.status == RunStatus::Aborted {
                pipeline.abort(child.id).await?;
                return Ok(dispatched);
            }
        }
        Ok(dispatched)
    }

    async fn completed_children(&self, root_id: RunId) -> Result<HashSet<String>> {
        Ok(self
            .store
            .find_children(root_id)
            .await?
            .into_iter()
            .filter(|child| child.status == RunStatus::Complete)
            .map(|child| child.board_name)
            .collect())
    }

    /// True while a dispatched pipeline has no finished child run yet.
    async fn has_unfinished_children(&self, root: &Run) -> Result<bool> {
        let children = self.store.find_children(root.id).await?;
        Ok(root.discharged_children.iter().any(|name| {
            !children
                .iter()
                .any(|child| &child.board_name == name && child.status.is_terminal())
        }))
    }

    /// Reacts to a child run finishing.
    pub async fn handle_done(self: &Arc<Self>, done: &DoneJob) -> Result<()> {
        let Some(root_id) = done.parent_id else {
            warn!(orchestrator = %self.name, run_id = %done.run_id, "Done event without a root run");
            return Ok(());
        };
        let root = self.store.get_run(root_id).await?;
        if root.status == RunStatus::Aborted {
            debug!(orchestrator = %self.name, run_id = %root_id, "Root aborted, done event ignored");
            return Ok(());
        }

        debug!(
            orchestrator = %self.name,
            pipeline = %done.board_name,
            run_id = %done.run_id,
            status = %done.status,
            "Child run finished"
        );
        let dispatched = match done.status {
            RunStatus::Complete => self.dispatch_ready(root_id).await?,
            _ => false,
        };
        if dispatched {
            return Ok(());
        }
        let root = self.store.get_run(root_id).await?;
        if !self.has_unfinished_children(&root).await? {
            self.finalize_root(root_id).await?;
        }
        Ok(())
    }

    /// Finishes the root: complete iff every pipeline has a complete child.
    ///
    /// Returns the final status when this call finished the root.
    pub async fn finalize_root(self: &Arc<Self>, root_id: RunId) -> Result<Option<RunStatus>> {
        let children = self.store.find_children(root_id).await?;
        let all_complete = self.pipelines.iter().all(|pipeline| {
            children
                .iter()
                .any(|child| child.board_name == pipeline.name() && child.status == RunStatus::Complete)
        });
        let status = if all_complete {
            RunStatus::Complete
        } else {
            RunStatus::Failed
        };
        if !self
            .store
            .compare_and_set_run_status(root_id, &[RunStatus::Active], status)
            .await?
        {
            return Ok(None);
        }

        let mut summaries = Vec::with_capacity(children.len());
        for child in &children {
            summaries.push(self.child_summary(child).await?);
        }
        let stats = sum_summaries(&summaries);
        let root = self
            .store
            .update_run(root_id, Box::new(move |run| run.stats = Some(stats)))
            .await?;

        info!(orchestrator = %self.name, run_id = %root_id, status = %status, "Root run finished");
        let notification =
            Notification::new(&self.name, root.payload, status).with_stats(root.stats);
        dispatch(self.notifier.as_ref(), NotificationKind::Done, notification).await;

        self.retry_if_eligible(root_id).await?;
        Ok(Some(status))
    }

    /// Schedules an automatic retry for every failed child still under the
    /// retry limit. Returns how many were scheduled.
    pub async fn retry_if_eligible(self: &Arc<Self>, root_id: RunId) -> Result<usize> {
        let children = self.store.find_children(root_id).await?;
        let mut scheduled = 0;
        for child in children.into_iter().filter(|c| c.status == RunStatus::Failed) {
            let attempt = u32::try_from(child.retry_count()).unwrap_or(u32::MAX);
            if !self.retry.should_retry(attempt) {
                continue;
            }
            let delay = self.retry.delay_for(attempt);
            info!(
                orchestrator = %self.name,
                pipeline = %child.board_name,
                run_id = %child.id,
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling automatic retry"
            );

            let orchestrator = Arc::clone(self);
            self.workers.spawn(move |shutdown| async move {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                orchestrator.auto_retry(&child).await;
            });
            scheduled += 1;
        }
        Ok(scheduled)
    }

    async fn auto_retry(&self, child: &Run) {
        let Some(root_id) = child.parent_id else {
            return;
        };
        match self.store.get_run(root_id).await {
            Ok(root) if root.status == RunStatus::Aborted => {
                debug!(orchestrator = %self.name, run_id = %root_id, "Root aborted, retry dropped");
            }
            Ok(_) => {
                if let Err(err) = self.retry(&child.board_name, child.id, RetryKind::Auto).await {
                    warn!(orchestrator = %self.name, run_id = %child.id, error = %err, "Automatic retry failed");
                }
            }
            Err(err) => {
                warn!(orchestrator = %self.name, run_id = %root_id, error = %err, "Root lookup failed before retry");
            }
        }
    }

    /// Replays a child run and puts its root back in flight.
    pub async fn retry(&self, pipeline: &str, child_id: RunId, kind: RetryKind) -> Result<Run> {
        let running = self.pipeline(pipeline)?;
        let child = self.store.get_run(child_id).await?;

        let previous = match child.parent_id {
            Some(root_id) => {
                let root = self.store.get_run(root_id).await?;
                self.store
                    .update_run(
                        root_id,
                        Box::new(|run| {
                            run.status = RunStatus::Active;
                            run.stats = None;
                        }),
                    )
                    .await?;
                Some(root)
            }
            None => None,
        };
        let child = match running.retry_run(child_id, kind).await {
            Ok(child) => child,
            Err(err) => {
                if let Some(root) = previous {
                    self.restore_root(root).await;
                }
                return Err(err);
            }
        };

        if let Some(root_id) = child.parent_id {
            let root = self.store.get_run(root_id).await?;
            let notification = Notification::new(&self.name, root.payload, root.status);
            dispatch(self.notifier.as_ref(), NotificationKind::Retry, notification).await;
        }
        info!(orchestrator = %self.name, pipeline, run_id = %child_id, kind = %kind, "Child run retried");
        Ok(child)
    }

    /// Puts a root back the way it was before a retry that never got going.
    async fn restore_root(&self, root: Run) {
        let (status, stats) = (root.status, root.stats);
        let restored = self
            .store
            .update_run(
                root.id,
                Box::new(move |run| {
                    run.status = status;
                    run.stats = stats;
                }),
            )
            .await;
        if let Err(err) = restored {
            warn!(orchestrator = %self.name, run_id = %root.id, error = %err, "Could not restore root after failed retry");
        }
    }

    /// Aborts a root run and every in-flight child. Returns false if the root
    /// had already finished.
    pub async fn abort(&self, root_id: RunId) -> Result<bool> {
        if !self
            .store
            .compare_and_set_run_status(
                root_id,
                &[RunStatus::Waiting, RunStatus::Active],
                RunStatus::Aborted,
            )
            .await?
        {
            return Ok(false);
        }
        let root = self.store.get_run(root_id).await?;
        let notification = Notification::new(&self.name, root.payload, root.status);
        dispatch(self.notifier.as_ref(), NotificationKind::Abort, notification).await;

        for child in self.store.find_children(root_id).await? {
            if child.status.is_in_flight() {
                self.pipeline(&child.board_name)?.abort(child.id).await?;
            }
        }
        info!(orchestrator = %self.name, run_id = %root_id, "Root run aborted");
        Ok(true)
    }

    /// Delivers a reply to a unit waiting on a handshake stage.
    pub async fn handshake(
        &self,
        pipeline: &str,
        unit_id: UnitId,
        stage: &str,
        payload: serde_json::Value,
    ) -> Result<Reply> {
        self.pipeline(pipeline)?
            .handshake(unit_id, stage, payload)
            .await
    }

    async fn child_summary(&self, child: &Run) -> Result<ProgressSummary> {
        match &child.stats {
            Some(stats) => Ok(stats.clone()),
            None => match self.pipeline(&child.board_name) {
                Ok(pipeline) => pipeline.summary(child.id).await,
                Err(_) => Ok(ProgressSummary::default()),
            },
        }
    }

    /// Root runs of this orchestrator, newest first, with aggregated progress.
    pub async fn find_runs(&self) -> Result<Vec<RunOverview>> {
        let roots = self.store.find_runs(&self.name).await?;
        let mut overviews = Vec::with_capacity(roots.len());
        for run in roots {
            let stats = self.aggregate_stats(run.id).await?;
            overviews.push(RunOverview { run, stats });
        }
        Ok(overviews)
    }

    /// Aggregated progress of one root run.
    pub async fn aggregate_stats(&self, root_id: RunId) -> Result<AggregateStats> {
        let mut children = Vec::new();
        for child in self.store.find_children(root_id).await? {
            let summary = self.child_summary(&child).await?;
            children.push((child, summary));
        }
        Ok(AggregateStats::from_children(self.pipelines.len(), &children))
    }

    /// Child runs of a root with their summaries.
    pub async fn sub_runs(&self, root_id: RunId, with_stage_stats: bool) -> Result<Vec<SubRun>> {
        let mut sub_runs = Vec::new();
        for run in self.store.find_children(root_id).await? {
            let summary = self.child_summary(&run).await?;
            let stages = match (with_stage_stats, self.pipeline(&run.board_name)) {
                (true, Ok(pipeline)) => Some(pipeline.stage_summaries(run.id).await?),
                _ => None,
            };
            sub_runs.push(SubRun {
                run,
                summary,
                stages,
            });
        }
        Ok(sub_runs)
    }

    /// Pipelines not yet dispatched under the root. Those waiting only on
    /// other undispatched pipelines come last.
    pub async fn pending_pipelines(&self, root_id: RunId) -> Result<Vec<PendingPipeline>> {
        let root = self.store.get_run(root_id).await?;
        let mut undispatched: HashSet<&str> = HashSet::new();
        let mut pending = VecDeque::new();
        for pipeline in &self.pipelines {
            let name = pipeline.name();
            if root.discharged_children.contains(name) {
                continue;
            }
            undispatched.insert(name);
            let depends_on = pipeline.pipeline().depends_on();
            let entry = PendingPipeline {
                name: name.to_string(),
                depends_on: depends_on.to_vec(),
            };
            if depends_on
                .iter()
                .all(|dependency| undispatched.contains(dependency.as_str()))
            {
                pending.push_back(entry);
            } else {
                pending.push_front(entry);
            }
        }
        Ok(pending.into())
    }

    /// Purges units last touched before `retention` ago and expired counters.
    pub async fn clean(&self, retention: Duration) -> Result<CleanReport> {
        let report = CleanReport {
            units: self.store.purge_units(before_now(retention)).await?,
            counters: self.counters.purge_expired(),
        };
        info!(
            orchestrator = %self.name,
            units = report.units,
            counters = report.counters,
            "Cleaned expired records"
        );
        Ok(report)
    }

    /// [`RunningOrchestrator::clean`] with the configured unit retention.
    pub async fn clean_expired(&self) -> Result<CleanReport> {
        self.clean(self.retention).await
    }

    /// Stops every pipeline and the done consumer, then closes the done queue.
    pub async fn close(&self) {
        self.workers.shutdown("orchestrator closed").await;
        for pipeline in &self.pipelines {
            pipeline.close().await;
        }
        self.done_queue.close().await;
        info!(orchestrator = %self.name, "Orchestrator closed");
    }
}

impl std::fmt::Debug for RunningOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningOrchestrator")
            .field("name", &self.name)
            .field("pipelines", &self.pipelines.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn sum_summaries(summaries: &[ProgressSummary]) -> ProgressSummary {
    let sum = |field: fn(&ProgressSummary) -> usize| summaries.iter().map(field).sum::<usize>();
    ProgressSummary::from_counts(
        sum(|s| s.total),
        sum(|s| s.complete),
        sum(|s| s.marked_complete),
        sum(|s| s.failed),
        sum(|s| s.aborted),
        sum(|s| s.skipped),
    )
}

struct DoneConsumer {
    orchestrator: Arc<RunningOrchestrator>,
}

#[async_trait]
impl JobHandler for DoneConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let done = DoneJob::from_job(job)?;
        self.orchestrator.handle_done(&done).await
    }
}
