//! Context manager — keeps the LLM prompt inside a model-specific token
//! budget by collapsing old conversation history into a summary message.
//!
//! Token counts come from a character heuristic (chars / divisor,
//! default 4). The heuristic is a tunable knob, not a tokenizer.
//!
//! Compaction keeps the newest messages whose combined estimate fits
//! `target_ratio × budget` and summarizes everything older. The summary
//! is appended as a `summary` message whose `metadata.covers` records the
//! `[first … last]` ids of the range it replaces; prior summaries are
//! deleted before the new one lands, so re-summarizing the same range is
//! idempotent. A summarization failure is non-fatal: the run proceeds
//! with the unsummarized prompt.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use relay_domain::chat::ChatMessage;
use relay_domain::config::Config;
use relay_domain::error::Result;
use relay_domain::message::{Message, MessageKind};
use relay_domain::tool::ToolCall;
use relay_llm::{ChatRequest, LlmClient};
use relay_store::MessageStore;

const SUMMARIZE_PROMPT: &str = "You are a conversation summarizer. Summarize the following \
conversation history into a concise summary that preserves:\n\
1. The current goal or plan being worked on\n\
2. Key decisions made\n\
3. Open questions or threads\n\
4. Important facts learned about the user or context\n\
5. Tool state (files written, commands run, pending work)\n\n\
Be concise but preserve all actionable context. Write in present tense.\n\n\
CONVERSATION:\n";

pub struct ContextManager {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MessageStore>,
    config: Arc<Config>,
}

impl ContextManager {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn MessageStore>, config: Arc<Config>) -> Self {
        Self { llm, store, config }
    }

    /// Build the prompt for the next LLM call: system + summaries +
    /// messages outside any summary's coverage, compacting first when the
    /// estimate crosses the threshold.
    pub async fn prepare(
        &self,
        thread_id: Uuid,
        system_prompt: &str,
        model: &str,
        compaction_enabled: bool,
    ) -> Result<Vec<ChatMessage>> {
        let all = self.store.list_llm(thread_id).await?;
        let mut visible = visible_messages(&all);

        if compaction_enabled {
            let budget = self.config.token_budget(model) as f64;
            let threshold = (budget * self.config.context.threshold_ratio) as usize;
            let estimate = self.estimate(system_prompt, &visible);

            if estimate > threshold {
                match self.compact(thread_id, budget, &all, &visible).await {
                    Ok(true) => {
                        let all = self.store.list_llm(thread_id).await?;
                        visible = visible_messages(&all);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(%thread_id, error = %e, "compaction failed, continuing with full history");
                    }
                }
            }
        }

        // Prompt order: system, then summaries, then everything outside
        // their coverage.
        let mut prompt = Vec::with_capacity(visible.len() + 1);
        prompt.push(ChatMessage::system(system_prompt));
        for message in visible.iter().filter(|m| m.kind == MessageKind::Summary) {
            if let Some(chat) = to_chat_message(message) {
                prompt.push(chat);
            }
        }
        for message in visible.iter().filter(|m| m.kind != MessageKind::Summary) {
            if let Some(chat) = to_chat_message(message) {
                prompt.push(chat);
            }
        }
        Ok(prompt)
    }

    /// Conservative character-based token estimate.
    pub fn estimate(&self, system_prompt: &str, messages: &[Message]) -> usize {
        let chars: usize = system_prompt.len() + messages.iter().map(|m| m.text().len() + 16).sum::<usize>();
        chars / self.config.context.chars_per_token.max(1)
    }

    /// Summarize everything older than the newest window. Returns whether
    /// a summary was written.
    async fn compact(&self, thread_id: Uuid, budget: f64, all: &[Message], visible: &[Message]) -> Result<bool> {
        let target = (budget * self.config.context.target_ratio) as usize;

        // Walk newest → oldest, keeping whatever fits the target window.
        let non_summary: Vec<&Message> = visible.iter().filter(|m| m.kind != MessageKind::Summary).collect();
        let mut kept_tokens = 0usize;
        let mut head_start = non_summary.len();
        for (idx, message) in non_summary.iter().enumerate().rev() {
            let cost = (message.text().len() + 16) / self.config.context.chars_per_token.max(1);
            if kept_tokens + cost > target && head_start != non_summary.len() {
                break;
            }
            kept_tokens += cost;
            head_start = idx;
            if kept_tokens > target {
                break;
            }
        }

        let tail: Vec<&Message> = non_summary[..head_start].to_vec();
        if tail.is_empty() {
            return Ok(false);
        }

        // Carry prior summaries into the new one so coverage only grows.
        let prior_summary_text: String = visible
            .iter()
            .filter(|m| m.kind == MessageKind::Summary)
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n");

        let conversation = build_conversation_text(&prior_summary_text, &tail);
        let request = ChatRequest {
            messages: vec![ChatMessage::user(format!("{SUMMARIZE_PROMPT}{conversation}"))],
            temperature: Some(0.1),
            max_tokens: Some(2_000),
            ..Default::default()
        };
        let response = self.llm.chat(&request).await?;
        if response.content.trim().is_empty() {
            return Ok(false);
        }

        // The new summary supersedes everything up to the tail's end: from
        // the first non-summary message of the full log through the last
        // tail message.
        let first_covered = all
            .iter()
            .find(|m| m.kind != MessageKind::Summary)
            .map(|m| m.message_id)
            .unwrap_or_else(|| tail[0].message_id);
        let last_covered = tail.last().map(|m| m.message_id).expect("tail is non-empty");

        self.store.delete_by_kind(thread_id, MessageKind::Summary).await?;
        self.store
            .append(
                thread_id,
                MessageKind::Summary,
                serde_json::json!({ "content": response.content }),
                true,
                serde_json::json!({ "covers": [first_covered, last_covered] }),
            )
            .await?;

        tracing::info!(
            %thread_id,
            summarized = tail.len(),
            summary_chars = response.content.len(),
            "thread compacted"
        );
        Ok(true)
    }
}

/// Messages visible to the next prompt: summaries themselves, plus every
/// message not superseded by a summary's coverage.
pub fn visible_messages(all: &[Message]) -> Vec<Message> {
    let mut cutoff: Option<usize> = None;
    let positions: std::collections::HashMap<Uuid, usize> =
        all.iter().enumerate().map(|(i, m)| (m.message_id, i)).collect();

    for message in all.iter().filter(|m| m.kind == MessageKind::Summary) {
        let covered_last = message
            .metadata
            .get("covers")
            .and_then(|c| c.as_array())
            .and_then(|c| c.last())
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(pos) = covered_last.and_then(|id| positions.get(&id).copied()) {
            cutoff = Some(cutoff.map_or(pos, |c| c.max(pos)));
        }
    }

    let summary_ids: HashSet<Uuid> = all
        .iter()
        .filter(|m| m.kind == MessageKind::Summary)
        .map(|m| m.message_id)
        .collect();

    all.iter()
        .enumerate()
        .filter(|(idx, m)| {
            summary_ids.contains(&m.message_id) || cutoff.map_or(true, |c| *idx > c)
        })
        .map(|(_, m)| m.clone())
        .collect()
}

/// Convert a persisted record to its LLM-facing shape. Status records
/// never reach the prompt; unknown shapes are skipped.
fn to_chat_message(message: &Message) -> Option<ChatMessage> {
    match message.kind {
        MessageKind::System => Some(ChatMessage::system(message.text())),
        MessageKind::Summary => Some(ChatMessage::system(format!(
            "Summary of earlier conversation:\n{}",
            message.text()
        ))),
        MessageKind::User => Some(ChatMessage::user(message.text())),
        MessageKind::Assistant => {
            let text = message
                .content
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_owned();
            let calls: Vec<ToolCall> = message
                .content
                .get("tool_calls")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if calls.is_empty() {
                Some(ChatMessage::assistant(message.text()))
            } else {
                Some(ChatMessage::assistant_with_tools(&text, &calls))
            }
        }
        MessageKind::Tool => {
            let call_id = message.content.get("call_id").and_then(|v| v.as_str())?;
            let success = message
                .content
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            let body = match message.content.get("error").and_then(|v| v.as_str()) {
                Some(error) if !success => error.to_owned(),
                _ => message
                    .content
                    .get("payload")
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            };
            Some(ChatMessage::tool_result(call_id, body, !success))
        }
        MessageKind::Status => None,
    }
}

fn build_conversation_text(prior_summary: &str, tail: &[&Message]) -> String {
    let mut buf = String::new();
    if !prior_summary.is_empty() {
        buf.push_str("Earlier summary: ");
        buf.push_str(prior_summary);
        buf.push('\n');
    }
    for message in tail {
        let role = match message.kind {
            MessageKind::User => "User",
            MessageKind::Assistant => "Assistant",
            MessageKind::Tool => "Tool",
            MessageKind::System => "System",
            MessageKind::Summary | MessageKind::Status => continue,
        };
        buf.push_str(role);
        buf.push_str(": ");
        let text = message.text();
        // Clip very long entries (tool output) to keep the prompt sane.
        if text.len() > 2_000 {
            let mut end = 1_000;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            buf.push_str(&text[..end]);
            buf.push_str(" [...]");
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}
