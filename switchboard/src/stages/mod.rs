//! Stages: declarations, processing contracts and the running stage.
//!
//! A stage consumes units from its queue, runs the author's processor and
//! reports the outcome to its pipeline through a [`StageListener`]. Handshake
//! stages additionally wait for an external reply and sweep units whose reply
//! never arrived.

mod processor;
mod runtime;
mod spec;
mod sweep;

pub use processor::{
    CompletionMarker, FnProcessor, FnReplyProcessor, ReplyProcessor, StageProcessor,
};
pub use runtime::{RetryOutcome, StageListener, StageRuntime};
pub use spec::{Next, StageDefinition, StageSpec};
