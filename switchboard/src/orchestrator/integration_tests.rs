//! End-to-end tests for orchestrators on in-memory connections.

#[cfg(test)]
mod tests {
    use crate::core::{OutputStatus, RetryKind, Run, RunOptions, RunStatus, WorkUnit};
    use crate::errors::SwitchboardError;
    use crate::events::NotificationKind;
    use crate::orchestrator::Orchestrator;
    use crate::pipeline::{Pipeline, Source};
    use crate::queue::{stage_queue_name, DoneJob};
    use crate::retry::RetryPolicy;
    use crate::stages::{CompletionMarker, StageDefinition, StageProcessor};
    use crate::testing::{
        assert_run_status, EchoReplyProcessor, FailingProcessor, FlakyProcessor,
        RecordingProcessor, TestHarness,
    };
    use async_trait::async_trait;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Appends the pipeline name to a shared log each time it processes a unit.
    #[derive(Clone)]
    struct OrderRecorder {
        pipeline: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StageProcessor for OrderRecorder {
        async fn process(&self, unit: &WorkUnit, _marker: &CompletionMarker) -> anyhow::Result<Value> {
            self.log.lock().push(self.pipeline.clone());
            Ok(unit.data.clone())
        }
    }

    fn single_stage(
        name: &str,
        depends_on: &[&str],
        processor: impl StageProcessor + 'static,
    ) -> Pipeline {
        depends_on
            .iter()
            .fold(Pipeline::builder(name), |builder, dep| builder.depends_on(*dep))
            .source(Source::passthrough("work"))
            .stage(
                StageDefinition::new("work", processor)
                    .with_retry(RetryPolicy::none())
                    .to_ground(),
            )
            .build()
            .unwrap()
    }

    /// cb1 first, cb2 and cb3 after cb1, cb4 after both.
    fn diamond(make: impl Fn(&str, &[&str]) -> Pipeline) -> Orchestrator {
        Orchestrator::builder("main")
            .pipeline(make("cb1", &[]))
            .pipeline(make("cb2", &["cb1"]))
            .pipeline(make("cb3", &["cb1"]))
            .pipeline(make("cb4", &["cb2", "cb3"]))
            .build()
            .unwrap()
    }

    /// cb2 after cb1, cb3 after cb1 and cb2, cb4 after cb2 and cb3.
    fn chain(make: impl Fn(&str, &[&str]) -> Pipeline) -> Orchestrator {
        Orchestrator::builder("main")
            .pipeline(make("cb1", &[]))
            .pipeline(make("cb2", &["cb1"]))
            .pipeline(make("cb3", &["cb2", "cb1"]))
            .pipeline(make("cb4", &["cb2", "cb3"]))
            .build()
            .unwrap()
    }

    /// An active root whose `finished` pipelines already have complete children.
    async fn seed_root(harness: &TestHarness, finished: &[&str]) -> (Run, Vec<Run>) {
        let root = Run::root("main", json!({})).with_status(RunStatus::Active);
        harness.conn.store.insert_run(&root).await.unwrap();
        let mut children = Vec::new();
        for name in finished {
            harness
                .conn
                .store
                .add_discharged_child(root.id, name)
                .await
                .unwrap();
            let child = Run::child(*name, root.id, json!({})).with_status(RunStatus::Complete);
            harness.conn.store.insert_run(&child).await.unwrap();
            children.push(child);
        }
        (root, children)
    }

    fn done_job(child: &Run) -> DoneJob {
        DoneJob {
            run_id: child.id,
            board_name: child.board_name.clone(),
            parent_id: child.parent_id,
            status: child.status,
        }
    }

    async fn wait_for_notifications(harness: &TestHarness, kind: NotificationKind, count: usize) {
        let notifier = Arc::clone(&harness.notifier);
        harness
            .wait_for("notifications", || {
                let notifier = Arc::clone(&notifier);
                async move {
                    Ok::<_, SwitchboardError>((notifier.of_kind(kind).len() >= count).then_some(()))
                }
            })
            .await
            .unwrap();
    }

    async fn child_of(harness: &TestHarness, root: &Run, pipeline: &str) -> Run {
        let store = Arc::clone(&harness.conn.store);
        let root_id = root.id;
        let pipeline = pipeline.to_string();
        harness
            .wait_for("child run", || {
                let store = Arc::clone(&store);
                let pipeline = pipeline.clone();
                async move {
                    let children = store.find_children(root_id).await?;
                    Ok::<_, SwitchboardError>(
                        children.into_iter().find(|child| child.board_name == pipeline),
                    )
                }
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dependencies_dispatch_in_order() {
        let harness = TestHarness::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = diamond(|name, depends_on| {
            let recorder = OrderRecorder {
                pipeline: name.to_string(),
                log: Arc::clone(&log),
            };
            single_stage(name, depends_on, recorder)
        });
        let running = orchestrator.start(&harness.conn);

        let root = running
            .discharge(json!({"market": "TH"}), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(root.status, RunStatus::Active);
        assert!(root.discharged_children.contains("cb1"));
        assert_eq!(root.discharged_children.len(), 1);

        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Complete);
        wait_for_notifications(&harness, NotificationKind::Done, 1).await;

        let log = log.lock().clone();
        let position = |name: &str| log.iter().position(|entry| entry == name).unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(position("cb1"), 0);
        assert!(position("cb2") < position("cb4"));
        assert!(position("cb3") < position("cb4"));

        let children = harness.conn.store.find_children(root.id).await.unwrap();
        assert_eq!(children.len(), 4);
        assert!(children.iter().all(|child| child.status == RunStatus::Complete));

        assert_eq!(harness.notifier.of_kind(NotificationKind::Start).len(), 1);
        let done = harness.notifier.of_kind(NotificationKind::Done);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, RunStatus::Complete);
        assert_eq!(done[0].stats.as_ref().unwrap().complete, 4);

        running.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_is_exactly_once() {
        let harness = TestHarness::new();
        let orchestrator = diamond(|name, depends_on| {
            single_stage(
                name,
                depends_on,
                RecordingProcessor::new().with_delay(Duration::from_millis(20)),
            )
        });
        let running = orchestrator.start(&harness.conn);

        let root = Run::root("main", json!({})).with_status(RunStatus::Active);
        harness.conn.store.insert_run(&root).await.unwrap();
        harness
            .conn
            .store
            .add_discharged_child(root.id, "cb1")
            .await
            .unwrap();
        let cb1 = Run::child("cb1", root.id, json!({})).with_status(RunStatus::Complete);
        harness.conn.store.insert_run(&cb1).await.unwrap();

        let results = join_all((0..8).map(|_| running.dispatch_ready(root.id))).await;
        let dispatched = results.into_iter().filter(|result| *result.as_ref().unwrap()).count();
        assert!((1..=2).contains(&dispatched));

        let children = harness.conn.store.find_children(root.id).await.unwrap();
        let count = |name: &str| children.iter().filter(|child| child.board_name == name).count();
        assert_eq!(count("cb2"), 1);
        assert_eq!(count("cb3"), 1);
        assert_eq!(count("cb4"), 0);

        running.close().await;
    }

    #[tokio::test]
    async fn test_chain_dispatches_only_unblocked_pipeline() {
        let harness = TestHarness::new();
        let orchestrator = chain(|name, depends_on| {
            single_stage(
                name,
                depends_on,
                RecordingProcessor::new().with_delay(Duration::from_millis(100)),
            )
        });
        let running = orchestrator.start(&harness.conn);
        let (root, _) = seed_root(&harness, &["cb1", "cb2"]).await;

        assert!(running.dispatch_ready(root.id).await.unwrap());

        let root = harness.conn.store.get_run(root.id).await.unwrap();
        let expected: BTreeSet<String> =
            ["cb1", "cb2", "cb3"].iter().map(ToString::to_string).collect();
        assert_eq!(root.discharged_children, expected);
        let children = harness.conn.store.find_children(root.id).await.unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|child| child.board_name != "cb4"));

        running.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_done_events_dispatch_once() {
        let harness = TestHarness::new();
        let orchestrator = diamond(|name, depends_on| {
            single_stage(
                name,
                depends_on,
                RecordingProcessor::new().with_delay(Duration::from_millis(100)),
            )
        });
        let running = orchestrator.start(&harness.conn);
        let (root, children) = seed_root(&harness, &["cb1"]).await;
        let done = done_job(&children[0]);

        let results = join_all((0..8).map(|_| running.handle_done(&done))).await;
        assert!(results.iter().all(Result::is_ok));

        let children = harness.conn.store.find_children(root.id).await.unwrap();
        let count = |name: &str| children.iter().filter(|child| child.board_name == name).count();
        assert_eq!(count("cb2"), 1);
        assert_eq!(count("cb3"), 1);
        assert_eq!(count("cb4"), 0);

        running.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_done_events_finalize_root_once() {
        let harness = TestHarness::new();
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], RecordingProcessor::new()))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);
        let (root, children) = seed_root(&harness, &["cb1"]).await;
        let done = done_job(&children[0]);

        let results = join_all((0..8).map(|_| running.handle_done(&done))).await;
        assert!(results.iter().all(Result::is_ok));

        let root = harness.conn.store.get_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Complete);
        assert_eq!(harness.notifier.of_kind(NotificationKind::Done).len(), 1);

        running.close().await;
    }

    #[tokio::test]
    async fn test_failed_pipeline_fails_root_and_blocks_dependents() {
        let harness = TestHarness::new();
        let orchestrator = diamond(|name, depends_on| {
            if name == "cb2" {
                single_stage(name, depends_on, FailingProcessor::always("upstream down"))
            } else {
                single_stage(name, depends_on, RecordingProcessor::new())
            }
        });
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({}), RunOptions::default()).await.unwrap();
        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Failed);
        wait_for_notifications(&harness, NotificationKind::Done, 1).await;

        let children = harness.conn.store.find_children(root.id).await.unwrap();
        let status = |name: &str| {
            children
                .iter()
                .find(|child| child.board_name == name)
                .map(|child| child.status)
        };
        assert_eq!(status("cb1"), Some(RunStatus::Complete));
        assert_eq!(status("cb2"), Some(RunStatus::Failed));
        assert_eq!(status("cb3"), Some(RunStatus::Complete));
        assert_eq!(status("cb4"), None);

        let pending = running.pending_pipelines(root.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "cb4");

        let overview = &running.find_runs().await.unwrap()[0];
        assert_eq!(overview.run.id, root.id);
        assert!((overview.stats.complete_ratio - 0.5).abs() < 1e-9);
        assert!(overview.stats.integrity_ratio.abs() < f64::EPSILON);

        assert_eq!(harness.notifier.of_kind(NotificationKind::Done)[0].status, RunStatus::Failed);
        assert!(harness.notifier.of_kind(NotificationKind::Retry).is_empty());
        running.close().await;
    }

    #[tokio::test]
    async fn test_failed_child_is_retried_automatically() {
        let config = TestHarness::fast_config().with_orchestrator_retry(1, Duration::from_millis(10));
        let harness = TestHarness::with_config(config);
        let flaky = FlakyProcessor::new(1);
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], flaky.clone()))
            .pipeline(single_stage("cb2", &["cb1"], RecordingProcessor::new()))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({}), RunOptions::default()).await.unwrap();
        let root = harness
            .wait_for_status(root.id, RunStatus::Complete)
            .await
            .unwrap();
        wait_for_notifications(&harness, NotificationKind::Done, 2).await;

        let done = harness.notifier.of_kind(NotificationKind::Done);
        assert_eq!(done[0].status, RunStatus::Failed);
        assert_eq!(done[1].status, RunStatus::Complete);
        assert_eq!(harness.notifier.of_kind(NotificationKind::Retry).len(), 1);

        let cb1 = child_of(&harness, &root, "cb1").await;
        assert_eq!(cb1.retry_count(), 1);
        assert_eq!(cb1.retry_history[0].kind, RetryKind::Auto);
        assert_eq!(cb1.status, RunStatus::Complete);
        assert_eq!(child_of(&harness, &root, "cb2").await.status, RunStatus::Complete);

        running.close().await;
    }

    #[tokio::test]
    async fn test_retry_limit_stops_auto_retry() {
        let config = TestHarness::fast_config().with_orchestrator_retry(1, Duration::from_millis(10));
        let harness = TestHarness::with_config(config);
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], FailingProcessor::always("still broken")))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({}), RunOptions::default()).await.unwrap();
        wait_for_notifications(&harness, NotificationKind::Done, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.notifier.of_kind(NotificationKind::Retry).len(), 1);
        assert_eq!(harness.notifier.of_kind(NotificationKind::Done).len(), 2);
        let root = harness.conn.store.get_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Failed);
        assert_eq!(child_of(&harness, &root, "cb1").await.retry_count(), 1);

        running.close().await;
    }

    #[tokio::test]
    async fn test_manual_retry_reactivates_root() {
        let harness = TestHarness::new();
        let flaky = FlakyProcessor::new(1);
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], flaky.clone()))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({}), RunOptions::default()).await.unwrap();
        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Failed);
        wait_for_notifications(&harness, NotificationKind::Done, 1).await;

        let cb1 = child_of(&harness, &root, "cb1").await;
        let retried = running.retry("cb1", cb1.id, RetryKind::Manual).await.unwrap();
        assert_eq!(retried.retry_history[0].kind, RetryKind::Manual);

        harness
            .wait_for_status(root.id, RunStatus::Complete)
            .await
            .unwrap();
        wait_for_notifications(&harness, NotificationKind::Done, 2).await;
        assert_eq!(harness.notifier.of_kind(NotificationKind::Retry).len(), 1);

        running.close().await;
    }

    #[tokio::test]
    async fn test_retry_that_cannot_start_leaves_root_finished() {
        let harness = TestHarness::new();
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], FailingProcessor::always("still broken")))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({}), RunOptions::default()).await.unwrap();
        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Failed);
        wait_for_notifications(&harness, NotificationKind::Done, 1).await;

        harness
            .conn
            .queues
            .open(&stage_queue_name("main", "cb1", "work"))
            .close()
            .await;
        let cb1 = child_of(&harness, &root, "cb1").await;
        assert!(running.retry("cb1", cb1.id, RetryKind::Manual).await.is_err());

        let root = harness.conn.store.get_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Failed);
        assert!(root.stats.is_some());
        assert!(harness.notifier.of_kind(NotificationKind::Retry).is_empty());

        running.close().await;
    }

    #[tokio::test]
    async fn test_abort_stops_dispatch() {
        let harness = TestHarness::new();
        let slow = RecordingProcessor::new().with_delay(Duration::from_millis(30));
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], slow.clone()))
            .pipeline(single_stage("cb2", &["cb1"], RecordingProcessor::new()))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let items = Value::Array((0..20).map(|i| json!({ "index": i })).collect());
        let root = running.discharge(items, RunOptions::default()).await.unwrap();
        let cb1 = child_of(&harness, &root, "cb1").await;
        harness.wait_for_units(cb1.id, 20).await.unwrap();

        assert!(running.abort(root.id).await.unwrap());
        assert!(!running.abort(root.id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let root = harness.conn.store.get_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Aborted);
        let children = harness.conn.store.find_children(root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, RunStatus::Aborted);
        assert!(slow.call_count() < 20);

        assert_eq!(harness.notifier.of_kind(NotificationKind::Abort).len(), 1);
        assert!(harness.notifier.of_kind(NotificationKind::Done).is_empty());
        running.close().await;
    }

    #[tokio::test]
    async fn test_handshake_through_orchestrator() {
        let harness = TestHarness::new();
        let orchestrator = Orchestrator::builder("main")
            .pipeline(
                Pipeline::builder("approvals")
                    .source(Source::passthrough("request"))
                    .stage(
                        StageDefinition::handshake(
                            "request",
                            RecordingProcessor::new(),
                            EchoReplyProcessor::new(),
                        )
                        .to_ground(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let root = running.discharge(json!({"id": 7}), RunOptions::default()).await.unwrap();
        let child = child_of(&harness, &root, "approvals").await;
        let units = harness.wait_for_units(child.id, 1).await.unwrap();
        harness
            .wait_for_unit(units[0].id, |unit| {
                unit.output_status("request") == Some(OutputStatus::Waiting)
            })
            .await
            .unwrap();

        let reply = running
            .handshake("approvals", units[0].id, "request", json!({"approved": true}))
            .await
            .unwrap();
        assert_eq!(reply.unit_id, units[0].id);

        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Complete);

        let err = running
            .handshake("ghost", units[0].id, "request", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        running.close().await;
    }

    #[tokio::test]
    async fn test_read_models_after_completion() {
        let harness = TestHarness::new();
        let orchestrator = Orchestrator::builder("main")
            .pipeline(single_stage("cb1", &[], RecordingProcessor::new()))
            .pipeline(single_stage("cb2", &["cb1"], RecordingProcessor::new()))
            .build()
            .unwrap();
        let running = orchestrator.start(&harness.conn);

        let items = Value::Array((0..3).map(|i| json!({ "index": i })).collect());
        let root = running.discharge(items, RunOptions::default()).await.unwrap();
        let root = harness.wait_for_run(root.id).await.unwrap();
        assert_run_status(&root, RunStatus::Complete);

        let runs = running.find_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!((runs[0].stats.complete_ratio - 1.0).abs() < 1e-9);
        assert!((runs[0].stats.integrity_ratio - 1.0).abs() < 1e-9);

        let sub_runs = running.sub_runs(root.id, true).await.unwrap();
        assert_eq!(sub_runs.len(), 2);
        assert_eq!(sub_runs[0].run.board_name, "cb1");
        assert_eq!(sub_runs[0].summary.complete, 3);
        let stages = sub_runs[0].stages.as_ref().unwrap();
        assert_eq!(stages[0].stage, "work");
        assert_eq!(stages[0].summary.complete, 3);
        assert!(running.sub_runs(root.id, false).await.unwrap()[1].stages.is_none());
        assert!(running.pending_pipelines(root.id).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = running.clean(Duration::ZERO).await.unwrap();
        assert_eq!(report.units, 6);
        running.close().await;
    }
}
