//! LLM streaming events (provider-agnostic).

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted by an LLM provider while generating one response.
///
/// Tool call arguments arrive as raw JSON text; strict decoding is the
/// response parser's job so that malformed arguments surface as coercion
/// errors instead of being silently dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmEvent {
    /// Reasoning/thinking content, only present when requested.
    Thinking { text: String },

    /// A chunk of assistant text.
    Token { text: String },

    /// A native tool call has started.
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument text.
    ToolCallDelta { call_id: String, delta: String },

    /// A native tool call is complete; `arguments` is the raw JSON text.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// Generation finished.
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// The provider reported an error mid-stream.
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
