//! Persisted conversation entities — projects, threads, and the append-only
//! message log backing every agent run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project groups threads for one account and owns at most one sandbox.
/// Created lazily on the first run that references the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: Uuid,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            project_id: Uuid::new_v4(),
            account_id: account_id.into(),
            sandbox_ref: None,
            created_at: Utc::now(),
        }
    }
}

/// A thread is the ordered message log for one conversation. Immutable
/// except for its message list; its project binding never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub project_id: Uuid,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(project_id: Uuid, account_id: impl Into<String>) -> Self {
        Self {
            thread_id: Uuid::new_v4(),
            project_id,
            account_id: account_id.into(),
            created_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    User,
    Assistant,
    Tool,
    Status,
    Summary,
}

/// One record in a thread's append-only log.
///
/// `content` is either a plain string or a structured object; the store
/// serializes it as-is. `is_llm_message` marks records that participate in
/// the prompt built for the next LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub kind: MessageKind,
    pub content: serde_json::Value,
    pub is_llm_message: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        thread_id: Uuid,
        kind: MessageKind,
        content: serde_json::Value,
        is_llm_message: bool,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            thread_id,
            kind,
            content,
            is_llm_message,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Total-order key within a thread: `created_at` first, `message_id`
    /// as the deterministic tiebreak.
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.message_id)
    }

    /// Extract the plain text of the content, for estimation and display.
    /// Structured content falls back to its `content` field, then to the
    /// full JSON rendering.
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other
                .get("content")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| other.to_string()),
        }
    }
}
