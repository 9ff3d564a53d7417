//! Handshake replies delivered by external systems.

use super::UnitId;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a stored reply.
pub type ReplyId = Uuid;

/// A persisted reply to a handshake stage's request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Reply identity.
    pub id: ReplyId,
    /// The unit the reply belongs to.
    pub unit_id: UnitId,
    /// Pipeline that owns the stage.
    pub board_name: String,
    /// The handshake stage awaiting the reply.
    pub stage_name: String,
    /// Reply payload.
    pub payload: serde_json::Value,
    /// When the reply was received.
    pub created_at: Timestamp,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    pub fn new(
        unit_id: UnitId,
        board_name: impl Into<String>,
        stage_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: generate_id(),
            unit_id,
            board_name: board_name.into(),
            stage_name: stage_name.into(),
            payload,
            created_at: now_utc(),
        }
    }
}
