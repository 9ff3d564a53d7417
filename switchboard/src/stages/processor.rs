//! Processing contracts implemented by pipeline authors.

use crate::core::{Reply, WorkUnit};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handed to processors so they can short-circuit a unit to ground.
///
/// The stage persists the flag and records the `markedComplete` counter as
/// soon as the processor returns, whether it succeeded or not.
#[derive(Debug, Default)]
pub struct CompletionMarker {
    marked: AtomicBool,
}

impl CompletionMarker {
    /// Creates an unmarked marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the unit complete: remaining stages are skipped and the unit is grounded.
    pub fn mark_complete(&self) {
        self.marked.store(true, Ordering::SeqCst);
    }

    /// True once `mark_complete` was called.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }
}

/// Processes a unit at one stage.
///
/// For handshake stages this is the request phase: the returned data is stored
/// with a WAITING status until the reply arrives.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Processes the unit and returns the stage output data.
    async fn process(
        &self,
        unit: &WorkUnit,
        marker: &CompletionMarker,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Completes a handshake stage once its reply arrives.
#[async_trait]
pub trait ReplyProcessor: Send + Sync {
    /// Handles the reply and returns the stage output data.
    async fn on_reply(
        &self,
        unit: &WorkUnit,
        reply: &Reply,
        marker: &CompletionMarker,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Adapts a synchronous closure into a [`StageProcessor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&WorkUnit, &CompletionMarker) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StageProcessor for FnProcessor<F>
where
    F: Fn(&WorkUnit, &CompletionMarker) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    async fn process(
        &self,
        unit: &WorkUnit,
        marker: &CompletionMarker,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(unit, marker)
    }
}

/// Adapts a synchronous closure into a [`ReplyProcessor`].
pub struct FnReplyProcessor<F> {
    f: F,
}

impl<F> FnReplyProcessor<F>
where
    F: Fn(&WorkUnit, &Reply, &CompletionMarker) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ReplyProcessor for FnReplyProcessor<F>
where
    F: Fn(&WorkUnit, &Reply, &CompletionMarker) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    async fn on_reply(
        &self,
        unit: &WorkUnit,
        reply: &Reply,
        marker: &CompletionMarker,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(unit, reply, marker)
    }
}
