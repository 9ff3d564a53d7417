//! Stage declarations.

use super::processor::{ReplyProcessor, StageProcessor};
use crate::core::StageKind;
use crate::errors::{codes, ConfigurationError};
use crate::retry::RetryPolicy;
use crate::utils::is_valid_name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A downstream target of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Next {
    /// Another stage of the same pipeline.
    Stage(String),
    /// The terminal sink.
    Ground,
}

impl Next {
    /// A stage target.
    #[must_use]
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    /// The stage name, if this is not ground.
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::Stage(name) => Some(name),
            Self::Ground => None,
        }
    }
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(name) => f.write_str(name),
            Self::Ground => f.write_str("ground"),
        }
    }
}

/// Declarative description of a stage.
///
/// `retry` and `timeout` fall back to the engine defaults when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, unique within its pipeline.
    pub name: String,
    /// Normal or handshake.
    #[serde(default)]
    pub kind: StageKind,
    /// Downstream targets.
    #[serde(default)]
    pub next: Vec<Next>,
    /// Stages that must be COMPLETE before a unit may enter this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Handshake reply timeout.
    #[serde(default, with = "optional_ms")]
    pub timeout: Option<Duration>,
    /// Delay applied to every push into this stage.
    #[serde(default, with = "optional_ms")]
    pub start_delay: Option<Duration>,
}

impl StageSpec {
    /// A normal stage with no targets.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Normal,
            next: Vec::new(),
            dependencies: Vec::new(),
            retry: None,
            timeout: None,
            start_delay: None,
        }
    }

    /// Stage names referenced by `next`.
    pub fn next_stages(&self) -> impl Iterator<Item = &str> {
        self.next.iter().filter_map(Next::stage_name)
    }

    /// True if one of the targets is ground.
    #[must_use]
    pub fn reaches_ground(&self) -> bool {
        self.next.contains(&Next::Ground)
    }

    /// True for handshake stages.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        self.kind == StageKind::Handshake
    }
}

mod optional_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// A stage spec together with its processors.
#[derive(Clone)]
pub struct StageDefinition {
    spec: StageSpec,
    processor: Arc<dyn StageProcessor>,
    reply_processor: Option<Arc<dyn ReplyProcessor>>,
}

impl StageDefinition {
    /// A normal stage named `name`.
    pub fn new(name: impl Into<String>, processor: impl StageProcessor + 'static) -> Self {
        Self::from_spec(StageSpec::new(name), Arc::new(processor))
    }

    /// A handshake stage named `name`.
    pub fn handshake(
        name: impl Into<String>,
        processor: impl StageProcessor + 'static,
        reply_processor: impl ReplyProcessor + 'static,
    ) -> Self {
        let mut spec = StageSpec::new(name);
        spec.kind = StageKind::Handshake;
        Self::from_spec(spec, Arc::new(processor)).with_reply_processor(Arc::new(reply_processor))
    }

    /// Wraps an existing spec.
    #[must_use]
    pub fn from_spec(spec: StageSpec, processor: Arc<dyn StageProcessor>) -> Self {
        Self {
            spec,
            processor,
            reply_processor: None,
        }
    }

    /// Sets the reply processor.
    #[must_use]
    pub fn with_reply_processor(mut self, reply_processor: Arc<dyn ReplyProcessor>) -> Self {
        self.reply_processor = Some(reply_processor);
        self
    }

    /// Adds a downstream stage.
    #[must_use]
    pub fn next(mut self, stage: impl Into<String>) -> Self {
        self.spec.next.push(Next::Stage(stage.into()));
        self
    }

    /// Routes the stage to ground.
    #[must_use]
    pub fn to_ground(mut self) -> Self {
        if !self.spec.reaches_ground() {
            self.spec.next.push(Next::Ground);
        }
        self
    }

    /// Requires `stage` to be COMPLETE before a unit may enter this stage.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.spec.dependencies.push(stage.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.spec.retry = Some(retry);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Delays every push into this stage.
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.spec.start_delay = Some(delay);
        self
    }

    /// The stage's spec.
    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) fn processor(&self) -> Arc<dyn StageProcessor> {
        Arc::clone(&self.processor)
    }

    pub(crate) fn reply_processor(&self) -> Option<Arc<dyn ReplyProcessor>> {
        self.reply_processor.clone()
    }

    /// Checks the name and the handshake wiring.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !is_valid_name(&self.spec.name) {
            return Err(ConfigurationError::coded(
                codes::INVALID_NAME,
                format!("Stage name '{}' is not a valid name", self.spec.name),
            )
            .with_stages(vec![self.spec.name.clone()]));
        }
        if self.spec.is_handshake() && self.reply_processor.is_none() {
            return Err(ConfigurationError::coded(
                codes::MISSING_REPLY_HANDLER,
                format!("Handshake stage '{}' has no reply processor", self.spec.name),
            )
            .with_stages(vec![self.spec.name.clone()]));
        }
        Ok(())
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("spec", &self.spec)
            .field("has_reply_processor", &self.reply_processor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkUnit;
    use crate::stages::CompletionMarker;
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl StageProcessor for Noop {
        async fn process(
            &self,
            _unit: &WorkUnit,
            _marker: &CompletionMarker,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(json!(null))
        }
    }

    fn noop() -> Noop {
        Noop
    }

    #[test]
    fn test_builder_methods() {
        let stage = StageDefinition::new("enrich", noop())
            .next("store")
            .to_ground()
            .to_ground()
            .depends_on("fetch")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(10)));

        let spec = stage.spec();
        assert_eq!(spec.next, vec![Next::stage("store"), Next::Ground]);
        assert_eq!(spec.next_stages().collect::<Vec<_>>(), vec!["store"]);
        assert_eq!(spec.dependencies, vec!["fetch".to_string()]);
        assert_eq!(spec.retry.as_ref().map(|r| r.limit), Some(2));
        assert!(spec.reaches_ground());
    }

    #[test]
    fn test_handshake_without_reply_processor_is_rejected() {
        let mut spec = StageSpec::new("approve");
        spec.kind = StageKind::Handshake;
        let stage = StageDefinition::from_spec(spec, Arc::new(noop()));

        let err = stage.validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_REPLY_HANDLER));
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let err = StageDefinition::new("bad name", noop()).validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_NAME));
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: StageSpec = serde_json::from_value(json!({
            "name": "approve",
            "kind": "handshake",
            "next": ["ground"],
            "timeout": 60000
        }))
        .unwrap();

        assert!(spec.is_handshake());
        assert_eq!(spec.next, vec![Next::Ground]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(60)));
        assert!(spec.retry.is_none());
    }
}
