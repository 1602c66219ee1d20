//! Agent run lifecycle — the status machine every run moves through and
//! the record mirrored to the status registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run status. Transitions form a DAG:
/// `PENDING → RUNNING → {COMPLETED | STOPPED | FAILED}`, with a direct
/// `PENDING → {STOPPED | FAILED}` edge for runs stopped or timed out while
/// queued. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Whether the transition `self → to` is allowed by the lifecycle DAG.
    pub fn can_transition(self, to: RunStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Stopped | Self::Failed) => true,
            (Self::Running, Self::Completed | Self::Stopped | Self::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent run: a single end-to-end invocation of the conversational
/// loop against one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub project_id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(thread_id: Uuid, project_id: Uuid) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            thread_id,
            project_id,
            status: RunStatus::Pending,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Enter a terminal state, stamping `ended_at`.
    pub fn finish(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}
