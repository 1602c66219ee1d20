//! Run events delivered over the streaming fabric.
//!
//! Every step of a run publishes one of these; the fabric assigns the
//! sequence number at publish time and records the event in the run's
//! replay list before broadcasting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AssistantChunk,
    AssistantMessage,
    ToolStart,
    ToolResult,
    Status,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssistantChunk => "assistant_chunk",
            Self::AssistantMessage => "assistant_message",
            Self::ToolStart => "tool_start",
            Self::ToolResult => "tool_result",
            Self::Status => "status",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

/// One event on a run's channel. Total order per run is given by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// `done` is the unique closing event of a run's stream; nothing may
    /// follow it. A terminal status event immediately precedes it.
    pub fn is_done(&self) -> bool {
        self.kind == EventKind::Done
    }

    /// Convenience payload for status events.
    pub fn status_payload(status: RunStatus, error: Option<&str>) -> serde_json::Value {
        match error {
            Some(e) => serde_json::json!({ "status": status, "error": e }),
            None => serde_json::json!({ "status": status }),
        }
    }
}
