//! Typed job payloads.

use super::Job;
use crate::core::{ReplyId, RunId, RunStatus, UnitId};
use crate::errors::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload that can be encoded into and decoded from a [`Job`].
pub trait JobPayload: Serialize + DeserializeOwned {
    /// Encodes the payload.
    fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a job's payload.
    fn from_job(job: &Job) -> Result<Self> {
        Ok(serde_json::from_value(job.payload.clone())?)
    }
}

/// A unit offered to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitJob {
    /// The unit.
    pub unit_id: UnitId,
    /// Its run.
    pub run_id: RunId,
}

/// A reply offered to a handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyJob {
    /// The unit awaiting the reply.
    pub unit_id: UnitId,
    /// Its run.
    pub run_id: RunId,
    /// The persisted reply.
    pub reply_id: ReplyId,
}

/// A run handed to a pipeline's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJob {
    /// The run to generate units for.
    pub run_id: RunId,
}

/// A finished pipeline run reported to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneJob {
    /// The finished run.
    pub run_id: RunId,
    /// The pipeline that ran it.
    pub board_name: String,
    /// Root run, if the run is a child.
    pub parent_id: Option<RunId>,
    /// Final status (complete or failed).
    pub status: RunStatus,
}

impl JobPayload for UnitJob {}
impl JobPayload for ReplyJob {}
impl JobPayload for RunJob {}
impl JobPayload for DoneJob {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_id;
    use serde_json::json;

    #[test]
    fn test_decode_from_job() {
        let unit = UnitJob {
            unit_id: generate_id(),
            run_id: generate_id(),
        };
        let job = Job::new("main:cb1:fetch", unit.to_payload().unwrap(), 0);
        assert_eq!(UnitJob::from_job(&job).unwrap(), unit);
    }

    #[test]
    fn test_decode_rejects_foreign_payload() {
        let job = Job::new("main:done", json!({"unexpected": true}), 0);
        let err = DoneJob::from_job(&job).unwrap_err();
        assert!(err.to_string().starts_with("Serialization error"));
    }
}
