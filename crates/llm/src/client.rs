//! The provider-agnostic LLM client contract.

use relay_domain::chat::ChatMessage;
use relay_domain::error::Result;
use relay_domain::stream::{BoxStream, LlmEvent, Usage};
use relay_domain::tool::ToolDefinition;
use serde::{Deserialize, Serialize};

/// How strongly the model is pushed toward tool use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Reasoning effort hint for models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// A chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke (JSON convention).
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Model identifier. `None` uses the client's default.
    pub model: Option<String>,
    /// Request interleaved reasoning content when the model supports it.
    pub enable_thinking: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// A full (non-streaming) chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Trait every LLM adapter implements.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<LlmEvent>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_effort_round_trips_lowercase() {
        let v = serde_json::to_value(ReasoningEffort::High).unwrap();
        assert_eq!(v, serde_json::json!("high"));
        let back: ReasoningEffort = serde_json::from_value(serde_json::json!("low")).unwrap();
        assert_eq!(back, ReasoningEffort::Low);
    }

    #[test]
    fn tool_choice_defaults_to_auto() {
        assert_eq!(ToolChoice::default(), ToolChoice::Auto);
    }
}
