//! A started pipeline: source consumer, stage runtimes and run completion.

use super::builder::Pipeline;
use crate::cancellation::WorkerGroup;
use crate::connections::Connections;
use crate::core::{
    Reply, RetryKind, Run, RunId, RunOptions, RunStatus, SourceState, SourceStatus, UnitId,
    WorkUnit,
};
use crate::errors::{NotFoundError, Result, SwitchboardError};
use crate::events::{dispatch, Notification, NotificationKind, Notifier};
use crate::progress::{pipeline_prefix, CounterStatus, ProgressCounter, ProgressSummary};
use crate::queue::{
    done_queue_name, source_queue_name, spawn_workers, DoneJob, Job, JobHandler, JobPayload,
    PushOptions, Queue, RunJob,
};
use crate::stages::{Next, StageListener, StageRuntime};
use crate::store::Store;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counter summary of one stage on one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// The stage.
    pub stage: String,
    /// Its counters.
    pub summary: ProgressSummary,
}

impl Pipeline {
    /// Starts the pipeline on its own: the namespace is the pipeline name and
    /// the pipeline consumes its own done events, notifying `Done` itself.
    pub fn start(&self, conn: &Connections) -> Arc<RunningPipeline> {
        let done_queue = conn.queues.open(&done_queue_name(self.name()));
        let running = RunningPipeline::open(self, conn, self.name(), Arc::clone(&done_queue), true);
        running.spawn_done_consumer(done_queue);
        running
    }

    /// Starts the pipeline under an orchestrator that owns `done_queue`.
    pub fn start_under(
        &self,
        conn: &Connections,
        namespace: &str,
        done_queue: Arc<dyn Queue>,
    ) -> Arc<RunningPipeline> {
        RunningPipeline::open(self, conn, namespace, done_queue, false)
    }
}

/// A pipeline bound to its queues, counters and workers.
pub struct RunningPipeline {
    pipeline: Pipeline,
    namespace: String,
    threshold: f64,
    stages: HashMap<String, Arc<StageRuntime>>,
    source_queue: Arc<dyn Queue>,
    done_queue: Arc<dyn Queue>,
    counter: Arc<dyn ProgressCounter>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    standalone: bool,
    workers: WorkerGroup,
}

impl RunningPipeline {
    fn open(
        pipeline: &Pipeline,
        conn: &Connections,
        namespace: &str,
        done_queue: Arc<dyn Queue>,
        standalone: bool,
    ) -> Arc<Self> {
        let name = pipeline.name();
        let stages = pipeline
            .stages()
            .iter()
            .map(|definition| {
                (
                    definition.name().to_string(),
                    StageRuntime::open(definition, namespace, name, conn),
                )
            })
            .collect();

        let running = Arc::new(Self {
            threshold: pipeline
                .completion_threshold()
                .unwrap_or(conn.config.default_completion_threshold),
            source_queue: conn.queues.open(&source_queue_name(namespace, name)),
            counter: conn.counters.open(&pipeline_prefix(namespace, name), &[]),
            store: Arc::clone(&conn.store),
            notifier: Arc::clone(&conn.notifier),
            namespace: namespace.to_string(),
            pipeline: pipeline.clone(),
            stages,
            done_queue,
            standalone,
            workers: WorkerGroup::new(),
        });

        let listener: Arc<dyn StageListener> = Arc::clone(&running) as Arc<dyn StageListener>;
        for stage in running.stages.values() {
            stage.spawn(
                &listener,
                &running.workers,
                conn.config.stage_concurrency,
                conn.config.sweep_interval,
            );
        }
        running.workers.track(spawn_workers(
            Arc::clone(&running.source_queue),
            Arc::new(SourceConsumer {
                pipeline: Arc::clone(&running),
            }),
            conn.config.source_concurrency,
            Arc::clone(running.workers.token()),
        ));

        info!(
            pipeline = %name,
            namespace = %namespace,
            stages = running.stages.len(),
            standalone,
            "Pipeline started"
        );
        running
    }

    fn spawn_done_consumer(self: &Arc<Self>, done_queue: Arc<dyn Queue>) {
        self.workers.track(spawn_workers(
            done_queue,
            Arc::new(StandaloneDoneConsumer {
                pipeline: Arc::clone(self),
            }),
            1,
            Arc::clone(self.workers.token()),
        ));
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.pipeline.name()
    }

    /// The queue namespace (orchestrator name, or the pipeline name when standalone).
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The pipeline definition.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The effective completion threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The pipeline-level counter.
    #[must_use]
    pub fn counter(&self) -> &Arc<dyn ProgressCounter> {
        &self.counter
    }

    /// A started stage by name.
    pub fn stage(&self, name: &str) -> Result<&Arc<StageRuntime>> {
        self.stages
            .get(name)
            .ok_or_else(|| NotFoundError::stage(name).into())
    }

    fn entry_stage(&self) -> Result<&Arc<StageRuntime>> {
        self.stage(self.pipeline.source().entry())
    }

    /// Creates a run and hands it to the source.
    ///
    /// `parent` is the orchestrator root; `None` makes a root run of this pipeline.
    pub async fn discharge(
        &self,
        parent: Option<RunId>,
        payload: serde_json::Value,
        options: RunOptions,
    ) -> Result<Run> {
        let run = match parent {
            Some(parent_id) => Run::child(self.name(), parent_id, payload),
            None => Run::root(self.name(), payload),
        }
        .with_options(options);
        self.store.insert_run(&run).await?;

        let job = RunJob { run_id: run.id };
        self.source_queue
            .push(
                job.to_payload()?,
                PushOptions::default().with_priority(options.priority),
            )
            .await?;

        info!(pipeline = %self.name(), run_id = %run.id, parent_id = ?parent, "Run discharged");
        if self.standalone && parent.is_none() {
            let notification = Notification::new(self.name(), run.payload.clone(), run.status);
            dispatch(self.notifier.as_ref(), NotificationKind::Start, notification).await;
        }
        Ok(run)
    }

    /// Source step: generates, stores and pushes the run's units.
    pub async fn generate_units(&self, run_id: RunId) -> Result<()> {
        if !self
            .store
            .compare_and_set_run_status(run_id, &[RunStatus::Waiting], RunStatus::Active)
            .await?
        {
            debug!(pipeline = %self.name(), run_id = %run_id, "Run no longer waiting, source skipped");
            return Ok(());
        }
        let run = self
            .store
            .update_run(
                run_id,
                Box::new(|run| {
                    run.source.status = SourceStatus::Active;
                    run.source.error = None;
                }),
            )
            .await?;

        let payloads = match self.pipeline.source().generator().generate(&run.payload).await {
            Ok(payloads) => payloads,
            Err(err) => return self.fail_source(run_id, &err).await,
        };

        let units: Vec<WorkUnit> = payloads
            .into_iter()
            .map(|data| WorkUnit::new(run_id, data).with_priority(run.options.priority))
            .collect();
        let total = units.len();
        self.store.insert_units(&units).await?;
        let run = self
            .store
            .update_run(run_id, Box::new(move |run| run.source.total_units = total))
            .await?;

        if total == 0 {
            self.set_source_status(run_id, SourceStatus::Complete).await?;
            self.finish_run(run_id, RunStatus::Complete, ProgressSummary::default())
                .await?;
            return Ok(());
        }
        if run.status == RunStatus::Aborted {
            self.store.abort_units(run_id).await?;
            debug!(pipeline = %self.name(), run_id = %run_id, "Run aborted during generation");
            return Ok(());
        }

        self.counter.init(run_id, total).await?;
        for stage in self.stages.values() {
            stage.counter().init(run_id, total).await?;
        }

        let entry = self.entry_stage()?;
        for unit in &units {
            entry.push(unit).await?;
        }
        self.set_source_status(run_id, SourceStatus::Complete).await?;
        info!(pipeline = %self.name(), run_id = %run_id, units = total, "Units generated");
        Ok(())
    }

    async fn set_source_status(&self, run_id: RunId, status: SourceStatus) -> Result<()> {
        self.store
            .update_run(run_id, Box::new(move |run| run.source.status = status))
            .await?;
        Ok(())
    }

    async fn fail_source(&self, run_id: RunId, error: &anyhow::Error) -> Result<()> {
        warn!(pipeline = %self.name(), run_id = %run_id, error = %error, "Source failed");
        let message = format!("{error:#}");
        self.store
            .update_run(
                run_id,
                Box::new(move |run| {
                    run.source.status = SourceStatus::Failed;
                    run.source.error = Some(message);
                }),
            )
            .await?;
        self.finish_run(run_id, RunStatus::Failed, ProgressSummary::default())
            .await?;
        Ok(())
    }

    /// True iff every declared dependency of `target` is COMPLETE on the unit.
    pub fn ready_to_push(&self, unit: &WorkUnit, target: &str) -> Result<bool> {
        let stage = self.stage(target)?;
        Ok(stage
            .spec()
            .dependencies
            .iter()
            .all(|dependency| unit.is_stage_complete(dependency)))
    }

    /// Dispatches a unit to `next` after a stage finished it.
    ///
    /// A marked unit skips every stage reachable from `next` and is grounded.
    /// Otherwise every target is dispatched concurrently; a target whose
    /// dependencies are not yet COMPLETE is dropped and will be offered the
    /// unit again by the dependency that finishes last.
    pub async fn check_and_push(&self, unit_id: UnitId, next: &[Next]) -> Result<()> {
        let unit = self.store.get_unit(unit_id).await?;

        if unit.marked_complete {
            for stage in self.reachable_from(next) {
                stage
                    .counter()
                    .update(unit.run_id, unit.id, CounterStatus::Skipped)
                    .await?;
            }
            return self.ground(&unit).await;
        }

        let results = join_all(next.iter().map(|target| self.dispatch_to(&unit, target))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn dispatch_to(&self, unit: &WorkUnit, target: &Next) -> Result<()> {
        match target {
            Next::Ground => self.ground(unit).await,
            Next::Stage(name) => {
                if self.ready_to_push(unit, name)? {
                    self.stage(name)?.push(unit).await
                } else {
                    debug!(pipeline = %self.name(), stage = %name, unit_id = %unit.id, "Dispatch gated");
                    Ok(())
                }
            }
        }
    }

    fn reachable_from(&self, next: &[Next]) -> Vec<&Arc<StageRuntime>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = next.iter().filter_map(Next::stage_name).collect();
        let mut reachable = Vec::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(stage) = self.stages.get(name) {
                queue.extend(stage.spec().next_stages());
                reachable.push(stage);
            }
        }
        reachable
    }

    /// Records the unit complete at the pipeline level once every stage shows
    /// COMPLETE (or the unit is marked), then checks whether the run is done.
    pub async fn ground(&self, unit: &WorkUnit) -> Result<()> {
        let finished = unit.marked_complete
            || self
                .pipeline
                .stages()
                .iter()
                .all(|stage| unit.is_stage_complete(stage.name()));
        if finished {
            self.counter
                .update(unit.run_id, unit.id, CounterStatus::Complete)
                .await?;
            if unit.marked_complete {
                self.counter
                    .update(unit.run_id, unit.id, CounterStatus::MarkedComplete)
                    .await?;
            }
            debug!(pipeline = %self.name(), unit_id = %unit.id, "Unit grounded");
        }
        self.check_run_done(unit.run_id).await?;
        Ok(())
    }

    /// Finishes the run once every unit is accounted for.
    ///
    /// Returns the final status when this call finished the run; `None` when
    /// units are still outstanding or another worker already finished it.
    pub async fn check_run_done(&self, run_id: RunId) -> Result<Option<RunStatus>> {
        let summary = self.counter.summary(run_id).await?;
        if !summary.is_all_done {
            return Ok(None);
        }
        let status = if summary.complete_ratio >= self.threshold {
            RunStatus::Complete
        } else {
            RunStatus::Failed
        };
        Ok(self
            .finish_run(run_id, status, summary)
            .await?
            .then_some(status))
    }

    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        stats: ProgressSummary,
    ) -> Result<bool> {
        if !self
            .store
            .compare_and_set_run_status(run_id, &[RunStatus::Active], status)
            .await?
        {
            return Ok(false);
        }
        let ratio = stats.complete_ratio;
        let run = self
            .store
            .update_run(run_id, Box::new(move |run| run.stats = Some(stats)))
            .await?;

        let done = DoneJob {
            run_id,
            board_name: self.name().to_string(),
            parent_id: run.parent_id,
            status,
        };
        self.done_queue
            .push(done.to_payload()?, PushOptions::default())
            .await?;
        info!(
            pipeline = %self.name(),
            run_id = %run_id,
            status = %status,
            complete_ratio = ratio,
            threshold = self.threshold,
            "Run finished"
        );
        Ok(true)
    }

    /// Aborts an in-flight run: flags it and all its units. Returns false if
    /// the run had already finished.
    pub async fn abort(&self, run_id: RunId) -> Result<bool> {
        if !self
            .store
            .compare_and_set_run_status(
                run_id,
                &[RunStatus::Waiting, RunStatus::Active],
                RunStatus::Aborted,
            )
            .await?
        {
            return Ok(false);
        }
        let flagged = self.store.abort_units(run_id).await?;
        info!(pipeline = %self.name(), run_id = %run_id, units = flagged, "Run aborted");

        let run = self.store.get_run(run_id).await?;
        if self.standalone && run.is_root() {
            let notification = Notification::new(self.name(), run.payload, run.status);
            dispatch(self.notifier.as_ref(), NotificationKind::Abort, notification).await;
        }
        Ok(true)
    }

    /// Replays a run: re-runs a failed source, or re-pushes the failed units
    /// to the entry stage with their retry counts cleared.
    pub async fn retry_run(&self, run_id: RunId, kind: RetryKind) -> Result<Run> {
        let run = self.store.get_run(run_id).await?;
        let record = self.store.push_retry(run_id, kind).await?;

        if run.source.status == SourceStatus::Failed {
            self.store
                .update_run(
                    run_id,
                    Box::new(|run| {
                        run.status = RunStatus::Waiting;
                        run.source = SourceState::default();
                        run.stats = None;
                    }),
                )
                .await?;
            self.source_queue
                .push(
                    RunJob { run_id }.to_payload()?,
                    PushOptions::default().with_priority(run.options.priority),
                )
                .await?;
        } else {
            let failed: Vec<UnitId> = self
                .counter
                .members(run_id, &CounterStatus::Failed)
                .await?
                .into_iter()
                .collect();
            self.store.clear_retries(&failed).await?;
            for unit_id in &failed {
                self.counter
                    .remove_member(run_id, &CounterStatus::Failed, *unit_id)
                    .await?;
                for stage in self.stages.values() {
                    stage
                        .counter()
                        .remove_member(run_id, &CounterStatus::Failed, *unit_id)
                        .await?;
                }
            }
            self.store
                .update_run(
                    run_id,
                    Box::new(|run| {
                        run.status = RunStatus::Active;
                        run.stats = None;
                    }),
                )
                .await?;

            let entry = self.entry_stage()?;
            for unit_id in &failed {
                let unit = self.store.get_unit(*unit_id).await?;
                entry.push(&unit).await?;
            }
            if failed.is_empty() {
                self.check_run_done(run_id).await?;
            }
        }

        info!(
            pipeline = %self.name(),
            run_id = %run_id,
            attempt = record.attempt,
            kind = %kind,
            "Run retried"
        );
        self.store.get_run(run_id).await
    }

    /// Persists a reply for a unit waiting on a handshake stage and enqueues it.
    pub async fn handshake(
        &self,
        unit_id: UnitId,
        stage: &str,
        payload: serde_json::Value,
    ) -> Result<Reply> {
        let runtime = self.stage(stage)?;
        if !runtime.spec().is_handshake() {
            return Err(NotFoundError::stage(format!("{stage}:reply")).into());
        }
        let unit = self.store.get_unit(unit_id).await?;
        let reply = Reply::new(unit_id, self.name(), stage, payload);
        self.store.insert_reply(&reply).await?;
        runtime.push_reply(&unit, reply.id).await?;
        Ok(reply)
    }

    /// The pipeline-level summary of a run.
    pub async fn summary(&self, run_id: RunId) -> Result<ProgressSummary> {
        self.counter.summary(run_id).await
    }

    /// Per-stage summaries of a run, in registration order.
    pub async fn stage_summaries(&self, run_id: RunId) -> Result<Vec<StageSummary>> {
        let mut summaries = Vec::with_capacity(self.stages.len());
        for definition in self.pipeline.stages() {
            let stage = self.stage(definition.name())?;
            summaries.push(StageSummary {
                stage: definition.name().to_string(),
                summary: stage.counter().summary(run_id).await?,
            });
        }
        Ok(summaries)
    }

    /// Stops every worker and closes the pipeline's queues.
    pub async fn close(&self) {
        self.workers.shutdown("pipeline closed").await;
        self.source_queue.close().await;
        for stage in self.stages.values() {
            stage.close().await;
        }
        if self.standalone {
            self.done_queue.close().await;
        }
        info!(pipeline = %self.name(), "Pipeline closed");
    }
}

impl std::fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("name", &self.pipeline.name())
            .field("namespace", &self.namespace)
            .field("threshold", &self.threshold)
            .field("standalone", &self.standalone)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageListener for RunningPipeline {
    async fn stage_completed(
        &self,
        _stage: &str,
        _run_id: RunId,
        unit_id: UnitId,
        next: &[Next],
    ) -> Result<()> {
        self.check_and_push(unit_id, next).await
    }

    async fn stage_failed(
        &self,
        stage: &str,
        run_id: RunId,
        unit_id: UnitId,
        error: &SwitchboardError,
    ) -> Result<()> {
        warn!(pipeline = %self.name(), stage, unit_id = %unit_id, error = %error, "Unit failed");
        self.counter
            .update(run_id, unit_id, CounterStatus::Failed)
            .await?;
        self.check_run_done(run_id).await?;
        Ok(())
    }

    async fn unit_aborted(&self, _stage: &str, run_id: RunId, unit_id: UnitId) -> Result<()> {
        self.counter
            .update(run_id, unit_id, CounterStatus::Aborted)
            .await
    }
}

struct SourceConsumer {
    pipeline: Arc<RunningPipeline>,
}

#[async_trait]
impl JobHandler for SourceConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let run_job = RunJob::from_job(job)?;
        self.pipeline.generate_units(run_job.run_id).await
    }

    async fn on_failed(&self, job: &Job, error: &SwitchboardError) {
        let run_id = match RunJob::from_job(job) {
            Ok(run_job) => run_job.run_id,
            Err(err) => {
                warn!(queue = %job.queue, job_id = %job.id, error = %err, "Undecodable source job");
                return;
            }
        };
        let error = anyhow::anyhow!("{error}");
        if let Err(err) = self.pipeline.fail_source(run_id, &error).await {
            warn!(
                pipeline = %self.pipeline.name(),
                run_id = %run_id,
                error = %err,
                "Could not mark source failed"
            );
        }
    }
}

struct StandaloneDoneConsumer {
    pipeline: Arc<RunningPipeline>,
}

#[async_trait]
impl JobHandler for StandaloneDoneConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let done = DoneJob::from_job(job)?;
        let run = self.pipeline.store.get_run(done.run_id).await?;
        let notification = Notification::new(self.pipeline.name(), run.payload, done.status)
            .with_stats(run.stats);
        dispatch(
            self.pipeline.notifier.as_ref(),
            NotificationKind::Done,
            notification,
        )
        .await;
        Ok(())
    }
}
