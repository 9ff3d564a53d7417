//! Mock processors for testing.

use crate::core::{Reply, UnitId, WorkUnit};
use crate::stages::{CompletionMarker, ReplyProcessor, StageProcessor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type UnitPredicate = Arc<dyn Fn(&WorkUnit) -> bool + Send + Sync>;

/// A processor that records every unit it sees and echoes the unit's data.
///
/// Clones share the recording, so keep one clone for assertions.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    calls: Arc<Mutex<Vec<UnitId>>>,
    delay: Option<Duration>,
}

impl RecordingProcessor {
    /// Creates a new recording processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` before returning.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Units seen, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<UnitId> {
        self.calls.lock().clone()
    }

    /// Number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls for one unit.
    #[must_use]
    pub fn calls_for(&self, unit_id: UnitId) -> usize {
        self.calls.lock().iter().filter(|id| **id == unit_id).count()
    }
}

#[async_trait]
impl StageProcessor for RecordingProcessor {
    async fn process(&self, unit: &WorkUnit, _marker: &CompletionMarker) -> anyhow::Result<Value> {
        self.calls.lock().push(unit.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(unit.data.clone())
    }
}

/// A processor that fails for matching units and echoes the rest.
#[derive(Clone)]
pub struct FailingProcessor {
    predicate: UnitPredicate,
    message: String,
    calls: Arc<Mutex<usize>>,
}

impl FailingProcessor {
    /// Fails every unit.
    #[must_use]
    pub fn always(message: impl Into<String>) -> Self {
        Self::when(message, |_| true)
    }

    /// Fails units for which `predicate` holds.
    pub fn when(
        message: impl Into<String>,
        predicate: impl Fn(&WorkUnit) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            predicate: Arc::new(predicate),
            message: message.into(),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Fails units whose data has `field == true`.
    #[must_use]
    pub fn on_flag(field: &str) -> Self {
        let field = field.to_string();
        Self::when(format!("{field} is set"), move |unit| {
            unit.data[field.as_str()] == json!(true)
        })
    }

    /// Number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageProcessor for FailingProcessor {
    async fn process(&self, unit: &WorkUnit, _marker: &CompletionMarker) -> anyhow::Result<Value> {
        *self.calls.lock() += 1;
        if (self.predicate)(unit) {
            anyhow::bail!("{}", self.message);
        }
        Ok(unit.data.clone())
    }
}

/// A processor that fails the first `failures` attempts of each unit.
#[derive(Clone)]
pub struct FlakyProcessor {
    failures: usize,
    attempts: Arc<Mutex<HashMap<UnitId, usize>>>,
}

impl FlakyProcessor {
    /// Creates a processor failing `failures` times per unit before succeeding.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempts seen for one unit.
    #[must_use]
    pub fn attempts_for(&self, unit_id: UnitId) -> usize {
        self.attempts.lock().get(&unit_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    async fn process(&self, unit: &WorkUnit, _marker: &CompletionMarker) -> anyhow::Result<Value> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(unit.id).or_insert(0);
            *count += 1;
            *count
        };
        if attempt <= self.failures {
            anyhow::bail!("transient failure {attempt}");
        }
        Ok(json!({ "attempt": attempt }))
    }
}

/// A processor that marks matching units complete.
#[derive(Clone)]
pub struct MarkingProcessor {
    predicate: UnitPredicate,
}

impl MarkingProcessor {
    /// Marks units for which `predicate` holds.
    pub fn when(predicate: impl Fn(&WorkUnit) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl StageProcessor for MarkingProcessor {
    async fn process(&self, unit: &WorkUnit, marker: &CompletionMarker) -> anyhow::Result<Value> {
        if (self.predicate)(unit) {
            marker.mark_complete();
        }
        Ok(unit.data.clone())
    }
}

/// A reply processor that stores the reply payload as the stage output.
#[derive(Clone, Default)]
pub struct EchoReplyProcessor {
    replies: Arc<Mutex<Vec<UnitId>>>,
}

impl EchoReplyProcessor {
    /// Creates a new echo reply processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of replies handled.
    #[must_use]
    pub fn reply_count(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl ReplyProcessor for EchoReplyProcessor {
    async fn on_reply(
        &self,
        unit: &WorkUnit,
        reply: &Reply,
        _marker: &CompletionMarker,
    ) -> anyhow::Result<Value> {
        self.replies.lock().push(unit.id);
        Ok(reply.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_id;

    #[tokio::test]
    async fn test_flaky_processor_recovers_per_unit() {
        let processor = FlakyProcessor::new(2);
        let unit = WorkUnit::new(generate_id(), json!(null));
        let marker = CompletionMarker::new();

        assert!(processor.process(&unit, &marker).await.is_err());
        assert!(processor.process(&unit, &marker).await.is_err());
        let output = processor.process(&unit, &marker).await.unwrap();
        assert_eq!(output["attempt"], json!(3));
        assert_eq!(processor.attempts_for(unit.id), 3);
    }

    #[tokio::test]
    async fn test_failing_processor_on_flag() {
        let processor = FailingProcessor::on_flag("broken");
        let marker = CompletionMarker::new();
        let good = WorkUnit::new(generate_id(), json!({"broken": false}));
        let bad = WorkUnit::new(generate_id(), json!({"broken": true}));

        assert!(processor.process(&good, &marker).await.is_ok());
        let err = processor.process(&bad, &marker).await.unwrap_err();
        assert_eq!(err.to_string(), "broken is set");
        assert_eq!(processor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_recording_clones_share_calls() {
        let processor = RecordingProcessor::new();
        let handle = processor.clone();
        let unit = WorkUnit::new(generate_id(), json!(1));

        processor.process(&unit, &CompletionMarker::new()).await.unwrap();
        assert_eq!(handle.calls_for(unit.id), 1);
    }
}
