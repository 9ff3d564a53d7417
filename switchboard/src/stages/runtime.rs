//! A started stage: its queues, counter and consume paths.

use super::processor::{CompletionMarker, ReplyProcessor, StageProcessor};
use super::spec::{Next, StageDefinition, StageSpec};
use super::sweep::run_sweeper;
use crate::cancellation::WorkerGroup;
use crate::connections::Connections;
use crate::core::{ErrorRecord, ReplyId, RunId, StageOutput, UnitId, WorkUnit};
use crate::errors::{NotFoundError, Result, SwitchboardError};
use crate::lock::LockProvider;
use crate::progress::{stage_prefix, CounterStatus, ProgressCounter};
use crate::queue::{
    reply_queue_name, spawn_workers, stage_queue_name, Job, JobHandler, JobPayload, PushOptions,
    Queue, QueueEvent, ReplyJob, UnitJob,
};
use crate::retry::RetryPolicy;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receives a stage's per-unit outcomes. Implemented by the owning pipeline.
#[async_trait]
pub trait StageListener: Send + Sync {
    /// The stage finished the unit; dispatch to `next`.
    async fn stage_completed(
        &self,
        stage: &str,
        run_id: RunId,
        unit_id: UnitId,
        next: &[Next],
    ) -> Result<()>;

    /// The stage gave up on the unit.
    async fn stage_failed(
        &self,
        stage: &str,
        run_id: RunId,
        unit_id: UnitId,
        error: &SwitchboardError,
    ) -> Result<()>;

    /// The stage dequeued a unit of an aborted run.
    async fn unit_aborted(&self, stage: &str, run_id: RunId, unit_id: UnitId) -> Result<()>;
}

/// What the retry policy decided for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job was re-enqueued.
    Retrying {
        /// Retry count after this retry.
        attempt: u32,
        /// Delay before the job becomes visible again.
        delay: Duration,
    },
    /// No retry left; the stage output is FAILED.
    Exhausted,
}

/// A stage bound to its queues and collaborators.
pub struct StageRuntime {
    spec: StageSpec,
    namespace: String,
    pipeline: String,
    processor: Arc<dyn StageProcessor>,
    reply_processor: Option<Arc<dyn ReplyProcessor>>,
    retry: RetryPolicy,
    timeout: Duration,
    sweep_lock_ttl: Duration,
    lock_resource: String,
    queue: Arc<dyn Queue>,
    reply_queue: Option<Arc<dyn Queue>>,
    counter: Arc<dyn ProgressCounter>,
    store: Arc<dyn Store>,
    locks: Arc<dyn LockProvider>,
}

impl StageRuntime {
    /// Opens the stage's queues and counter under `namespace:pipeline`.
    pub fn open(
        definition: &StageDefinition,
        namespace: &str,
        pipeline: &str,
        conn: &Connections,
    ) -> Arc<Self> {
        let spec = definition.spec().clone();
        let name = spec.name.clone();
        let reply_queue = spec
            .is_handshake()
            .then(|| conn.queues.open(&reply_queue_name(namespace, pipeline, &name)));

        Arc::new(Self {
            retry: spec
                .retry
                .clone()
                .unwrap_or_else(|| conn.config.default_stage_retry()),
            timeout: spec.timeout.unwrap_or(conn.config.default_handshake_timeout),
            sweep_lock_ttl: conn.config.sweep_lock_ttl,
            lock_resource: format!("r:{namespace}:{pipeline}:{name}:hs:cleaner:lock"),
            queue: conn.queues.open(&stage_queue_name(namespace, pipeline, &name)),
            reply_queue,
            counter: conn.counters.open(
                &stage_prefix(namespace, pipeline, &name),
                &[CounterStatus::Pushed.as_str(), CounterStatus::Consumed.as_str()],
            ),
            processor: definition.processor(),
            reply_processor: definition.reply_processor(),
            store: Arc::clone(&conn.store),
            locks: Arc::clone(&conn.locks),
            namespace: namespace.to_string(),
            pipeline: pipeline.to_string(),
            spec,
        })
    }

    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The stage spec.
    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// The namespace the stage was opened under.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The owning pipeline's name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// The effective retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The effective handshake timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The stage's counter.
    #[must_use]
    pub fn counter(&self) -> &Arc<dyn ProgressCounter> {
        &self.counter
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }

    pub(crate) fn sweep_lock_ttl(&self) -> Duration {
        self.sweep_lock_ttl
    }

    /// Name of the distributed lock guarding this stage's timeout sweep.
    #[must_use]
    pub fn lock_resource(&self) -> &str {
        &self.lock_resource
    }

    /// Enqueues a unit, recording `pushed`.
    pub async fn push(&self, unit: &WorkUnit) -> Result<()> {
        self.counter
            .update(unit.run_id, unit.id, CounterStatus::Pushed)
            .await?;
        let job = UnitJob {
            unit_id: unit.id,
            run_id: unit.run_id,
        };
        let options = PushOptions {
            delay: self.spec.start_delay,
            priority: unit.priority,
        };
        self.queue.push(job.to_payload()?, options).await?;
        debug!(stage = %self.name(), unit_id = %unit.id, "Unit pushed");
        Ok(())
    }

    /// Enqueues a persisted reply for the unit.
    pub async fn push_reply(&self, unit: &WorkUnit, reply_id: ReplyId) -> Result<()> {
        let queue = self
            .reply_queue
            .as_ref()
            .ok_or_else(|| NotFoundError::stage(format!("{}:reply", self.name())))?;
        let job = ReplyJob {
            unit_id: unit.id,
            run_id: unit.run_id,
            reply_id,
        };
        let options = PushOptions::default().with_priority(unit.priority);
        queue.push(job.to_payload()?, options).await?;
        debug!(stage = %self.name(), unit_id = %unit.id, reply_id = %reply_id, "Reply pushed");
        Ok(())
    }

    /// The primary consume path.
    pub async fn consume(&self, job: UnitJob, listener: &dyn StageListener) -> Result<()> {
        // Always decide on the stored record, never on the queued copy.
        let unit = self.store.get_unit(job.unit_id).await?;
        if unit.aborted {
            self.record_abort(&unit, listener).await?;
            return Ok(());
        }

        let marker = CompletionMarker::new();
        let result = self.processor.process(&unit, &marker).await;
        self.apply_marker(&unit, &marker).await?;
        let data = result.map_err(|e| SwitchboardError::processing(self.name(), &e))?;

        if self.spec.is_handshake() {
            self.store
                .set_output(unit.id, self.name(), StageOutput::waiting(data))
                .await?;
            debug!(stage = %self.name(), unit_id = %unit.id, "Awaiting reply");
            if marker.is_marked() {
                self.notify_completed(&unit, listener).await;
            }
            return Ok(());
        }

        self.store
            .set_output(unit.id, self.name(), StageOutput::complete(data))
            .await?;
        self.counter
            .update(unit.run_id, unit.id, CounterStatus::Complete)
            .await?;
        self.notify_completed(&unit, listener).await;
        Ok(())
    }

    /// The reply consume path of a handshake stage.
    pub async fn consume_reply(&self, job: ReplyJob, listener: &dyn StageListener) -> Result<()> {
        let unit = self.store.get_unit(job.unit_id).await?;
        if unit.is_stage_complete(self.name()) {
            debug!(stage = %self.name(), unit_id = %unit.id, "Duplicate reply discarded");
            return Ok(());
        }
        if unit.aborted {
            self.record_abort(&unit, listener).await?;
            return Ok(());
        }

        let reply_processor = self
            .reply_processor
            .as_ref()
            .ok_or_else(|| NotFoundError::stage(format!("{}:reply", self.name())))?;
        let reply = self.store.get_reply(job.reply_id).await?;

        let marker = CompletionMarker::new();
        let result = reply_processor.on_reply(&unit, &reply, &marker).await;
        self.apply_marker(&unit, &marker).await?;
        let data = result.map_err(|e| SwitchboardError::processing(self.name(), &e))?;

        let written = self
            .store
            .set_output_unless_complete(unit.id, self.name(), StageOutput::complete(data))
            .await?;
        if !written {
            debug!(stage = %self.name(), unit_id = %unit.id, "Concurrent duplicate reply discarded");
            return Ok(());
        }

        self.counter
            .update(unit.run_id, unit.id, CounterStatus::Complete)
            .await?;
        self.notify_completed(&unit, listener).await;
        Ok(())
    }

    /// Applies the retry policy after a failed job and reports exhaustion to `listener`.
    pub async fn handle_failure(
        &self,
        queue: &dyn Queue,
        job: &Job,
        run_id: RunId,
        unit_id: UnitId,
        error: &SwitchboardError,
        listener: &dyn StageListener,
    ) {
        match self.retry_or_fail(queue, job, run_id, unit_id, error).await {
            Ok(RetryOutcome::Retrying { attempt, delay }) => {
                warn!(
                    stage = %self.name(),
                    unit_id = %unit_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying unit"
                );
            }
            Ok(RetryOutcome::Exhausted) => {
                warn!(stage = %self.name(), unit_id = %unit_id, error = %error, "Unit failed");
                self.notify_failed(run_id, unit_id, error, listener).await;
            }
            Err(retry_error) => {
                error!(
                    stage = %self.name(),
                    unit_id = %unit_id,
                    error = %error,
                    retry_error = %retry_error,
                    "Could not apply retry policy"
                );
                self.notify_failed(run_id, unit_id, error, listener).await;
            }
        }
    }

    /// Decides between re-enqueueing the job and finalizing the stage output as FAILED.
    pub async fn retry_or_fail(
        &self,
        queue: &dyn Queue,
        job: &Job,
        run_id: RunId,
        unit_id: UnitId,
        error: &SwitchboardError,
    ) -> Result<RetryOutcome> {
        let record = ErrorRecord::new(self.name(), error.to_string());
        if !error.is_retryable() {
            if !error.is_not_found() {
                self.fail_output(run_id, unit_id, record).await?;
            }
            return Ok(RetryOutcome::Exhausted);
        }

        self.store
            .record_failure(unit_id, self.name(), record.clone())
            .await?;
        let retries = self.store.get_unit(unit_id).await?.retry_count(self.name());
        if self.retry.should_retry(retries) {
            let attempt = self.store.increment_retry(unit_id, self.name()).await?;
            let delay = self.retry.delay_for(retries);
            queue.retry(job.clone(), delay).await?;
            return Ok(RetryOutcome::Retrying { attempt, delay });
        }

        self.fail_output(run_id, unit_id, record).await?;
        Ok(RetryOutcome::Exhausted)
    }

    async fn fail_output(&self, run_id: RunId, unit_id: UnitId, record: ErrorRecord) -> Result<()> {
        self.store
            .set_output(unit_id, self.name(), StageOutput::failed(Some(record)))
            .await?;
        self.counter
            .update(run_id, unit_id, CounterStatus::Failed)
            .await
    }

    async fn apply_marker(&self, unit: &WorkUnit, marker: &CompletionMarker) -> Result<()> {
        if marker.is_marked() && !unit.marked_complete {
            self.store.mark_complete(unit.id).await?;
            self.counter
                .update(unit.run_id, unit.id, CounterStatus::MarkedComplete)
                .await?;
        }
        Ok(())
    }

    async fn record_abort(&self, unit: &WorkUnit, listener: &dyn StageListener) -> Result<()> {
        debug!(stage = %self.name(), unit_id = %unit.id, "Unit aborted");
        self.counter
            .update(unit.run_id, unit.id, CounterStatus::Aborted)
            .await?;
        listener.unit_aborted(self.name(), unit.run_id, unit.id).await
    }

    async fn notify_completed(&self, unit: &WorkUnit, listener: &dyn StageListener) {
        if let Err(err) = listener
            .stage_completed(self.name(), unit.run_id, unit.id, &self.spec.next)
            .await
        {
            error!(stage = %self.name(), unit_id = %unit.id, error = %err, "Dispatch failed");
        }
    }

    pub(crate) async fn notify_failed(
        &self,
        run_id: RunId,
        unit_id: UnitId,
        error: &SwitchboardError,
        listener: &dyn StageListener,
    ) {
        if let Err(err) = listener.stage_failed(self.name(), run_id, unit_id, error).await {
            error!(stage = %self.name(), unit_id = %unit_id, error = %err, "Failure callback failed");
        }
    }

    /// Starts the consumers in `group`. Handshake stages also get reply
    /// consumers and a timeout sweeper ticking every `sweep_interval`.
    pub fn spawn(
        self: &Arc<Self>,
        listener: &Arc<dyn StageListener>,
        group: &WorkerGroup,
        concurrency: usize,
        sweep_interval: Duration,
    ) {
        let consumer = Arc::new(StageConsumer {
            stage: Arc::clone(self),
            listener: Arc::clone(listener),
        });
        group.track(spawn_workers(
            Arc::clone(&self.queue),
            consumer,
            concurrency,
            Arc::clone(group.token()),
        ));

        if let Some(reply_queue) = &self.reply_queue {
            let consumer = Arc::new(ReplyConsumer {
                stage: Arc::clone(self),
                listener: Arc::clone(listener),
            });
            group.track(spawn_workers(
                Arc::clone(reply_queue),
                consumer,
                concurrency,
                Arc::clone(group.token()),
            ));

            let stage = Arc::clone(self);
            let listener = Arc::clone(listener);
            group.spawn(move |shutdown| run_sweeper(stage, listener, sweep_interval, shutdown));
        }
    }

    /// Closes the stage's queues.
    pub async fn close(&self) {
        self.queue.close().await;
        if let Some(reply_queue) = &self.reply_queue {
            reply_queue.close().await;
        }
    }
}

impl std::fmt::Debug for StageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRuntime")
            .field("name", &self.spec.name)
            .field("pipeline", &self.pipeline)
            .field("kind", &self.spec.kind)
            .finish_non_exhaustive()
    }
}

struct StageConsumer {
    stage: Arc<StageRuntime>,
    listener: Arc<dyn StageListener>,
}

#[async_trait]
impl JobHandler for StageConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let unit_job = UnitJob::from_job(job)?;
        self.stage.consume(unit_job, self.listener.as_ref()).await
    }

    async fn on_event(&self, event: QueueEvent, job: &Job) {
        if event != QueueEvent::Active {
            return;
        }
        if let Ok(unit_job) = UnitJob::from_job(job) {
            if let Err(err) = self
                .stage
                .counter
                .update(unit_job.run_id, unit_job.unit_id, CounterStatus::Consumed)
                .await
            {
                warn!(stage = %self.stage.name(), error = %err, "Could not record consumed");
            }
        }
    }

    async fn on_failed(&self, job: &Job, error: &SwitchboardError) {
        match UnitJob::from_job(job) {
            Ok(unit_job) => {
                self.stage
                    .handle_failure(
                        self.stage.queue.as_ref(),
                        job,
                        unit_job.run_id,
                        unit_job.unit_id,
                        error,
                        self.listener.as_ref(),
                    )
                    .await;
            }
            Err(decode) => {
                error!(stage = %self.stage.name(), job_id = %job.id, error = %decode, "Undecodable job dropped");
            }
        }
    }
}

struct ReplyConsumer {
    stage: Arc<StageRuntime>,
    listener: Arc<dyn StageListener>,
}

#[async_trait]
impl JobHandler for ReplyConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let reply_job = ReplyJob::from_job(job)?;
        self.stage.consume_reply(reply_job, self.listener.as_ref()).await
    }

    async fn on_failed(&self, job: &Job, error: &SwitchboardError) {
        let Some(queue) = self.stage.reply_queue.as_ref() else {
            return;
        };
        match ReplyJob::from_job(job) {
            Ok(reply_job) => {
                self.stage
                    .handle_failure(
                        queue.as_ref(),
                        job,
                        reply_job.run_id,
                        reply_job.unit_id,
                        error,
                        self.listener.as_ref(),
                    )
                    .await;
            }
            Err(decode) => {
                error!(stage = %self.stage.name(), job_id = %job.id, error = %decode, "Undecodable reply dropped");
            }
        }
    }
}
