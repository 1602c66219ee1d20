//! OpenAI-compatible chat completions adapter.
//!
//! Works with any endpoint following the OpenAI contract (OpenAI, Azure
//! front-ends, vLLM, Together, LiteLLM proxies). Configured from
//! `LLM_API_KEY` / `LLM_BASE_URL` / `LLM_DEFAULT_MODEL`.

use std::collections::BTreeMap;

use serde_json::Value;

use relay_domain::chat::{ChatContent, ChatMessage, ContentPart, Role};
use relay_domain::config::LlmConfig;
use relay_domain::error::{Error, Result};
use relay_domain::stream::{BoxStream, LlmEvent, Usage};
use relay_domain::tool::ToolDefinition;

use crate::client::{ChatRequest, ChatResponse, LlmClient, ToolChoice};

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(&cfg.api_key, &cfg.base_url, &cfg.default_model)
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match req.tool_choice {
                ToolChoice::Auto => serde_json::json!("auto"),
                ToolChoice::None => serde_json::json!("none"),
                ToolChoice::Required => serde_json::json!("required"),
            };
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(effort) = req.reasoning_effort {
            body["reasoning_effort"] = serde_json::to_value(effort).unwrap_or(Value::Null);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout(format!("LLM request: {e}"))
                } else {
                    Error::UpstreamFailure(format!("LLM request: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamFailure(format!(
                "LLM returned {status}: {}",
                truncate(&text, 500)
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        let response = self.post_chat(&body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("decoding LLM response: {e}")))?;
        parse_chat_response(&v)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<LlmEvent>>> {
        let body = self.build_body(req, true);
        let response = self.post_chat(&body).await?;

        // The chat-completions stream is line-oriented: one `data:` payload
        // per line, blank lines between events, `[DONE]` at the end. Lines
        // can split across body chunks, so a trailing partial line stays
        // buffered until the next read.
        let stream = async_stream::stream! {
            let mut response = response;
            let mut state = StreamState::default();
            let mut buffer = String::new();
            let mut finished = false;

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for payload in take_data_payloads(&mut buffer) {
                            for event in state.parse(&payload) {
                                finished |= matches!(&event, Ok(LlmEvent::Done { .. }));
                                yield event;
                            }
                        }
                    }
                    Ok(None) => {
                        // Body closed; a last payload may lack its newline.
                        if !buffer.trim().is_empty() {
                            buffer.push('\n');
                            for payload in take_data_payloads(&mut buffer) {
                                for event in state.parse(&payload) {
                                    finished |= matches!(&event, Ok(LlmEvent::Done { .. }));
                                    yield event;
                                }
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::UpstreamFailure(format!("reading LLM stream: {e}")));
                        break;
                    }
                }
            }

            // Providers that drop the connection without a finish_reason
            // still owe the run loop a terminal Done.
            if !finished {
                yield Ok(LlmEvent::Done { usage: None, finish_reason: Some("stop".into()) });
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Drain every complete line from the buffer, keeping the `data:`
/// payloads and dropping the rest of the SSE framing (`event:`, `id:`,
/// comments, blank separators). An unterminated trailing line is left in
/// place for the next chunk.
fn take_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(nl) = buffer.find('\n') {
        let line: String = buffer.drain(..=nl).collect();
        let Some(payload) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if !payload.is_empty() {
            payloads.push(payload.to_owned());
        }
    }

    payloads
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Assistant => assistant_to_wire(msg),
        Role::Tool => tool_result_to_wire(msg),
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content.text(),
        }),
    }
}

fn assistant_to_wire(msg: &ChatMessage) -> Value {
    let mut obj = serde_json::json!({ "role": "assistant" });
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        ChatContent::Text(t) => text_parts.push(t.clone()),
        ChatContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        }));
                    }
                    ContentPart::ToolResult { .. } => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_wire(msg: &ChatMessage) -> Value {
    if let ChatContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult { tool_use_id, content, .. } = part {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({ "role": "tool", "tool_call_id": "", "content": msg.content.text() })
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::UpstreamFailure("no choices in LLM response".into()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::UpstreamFailure("no message in LLM choice".into()))?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles streamed tool call fragments.
///
/// The wire format delivers tool calls as indexed deltas: a fragment with
/// an `id` opens a call at its index, subsequent fragments append argument
/// text. A call is finished when a later index opens or the choice reports
/// a finish reason; both flush [`LlmEvent::ToolCallFinished`] with the raw
/// argument text.
#[derive(Default)]
struct StreamState {
    calls: BTreeMap<u64, PendingCall>,
}

struct PendingCall {
    call_id: String,
    tool_name: String,
    arguments: String,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<LlmEvent>> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::UpstreamFailure(format!("malformed stream chunk: {e}")))],
        };

        let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                let mut events = self.flush_all();
                events.push(Ok(LlmEvent::Done { usage: Some(usage), finish_reason: None }));
                return events;
            }
            return Vec::new();
        };

        let mut events: Vec<Result<LlmEvent>> = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(LlmEvent::Thinking { text: text.to_string() }));
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(LlmEvent::Token { text: text.to_string() }));
            }
        }

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    // A new call at this index finishes any prior one there.
                    if let Some(prev) = self.calls.remove(&index) {
                        events.push(Ok(prev.into_finished()));
                    }
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    events.push(Ok(LlmEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        tool_name: name.clone(),
                    }));
                    self.calls.insert(
                        index,
                        PendingCall { call_id: id.to_string(), tool_name: name, arguments: String::new() },
                    );
                }

                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if let Some(call) = self.calls.get_mut(&index) {
                        call.arguments.push_str(args);
                        events.push(Ok(LlmEvent::ToolCallDelta {
                            call_id: call.call_id.clone(),
                            delta: args.to_string(),
                        }));
                    }
                }
            }
        }

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            events.extend(self.flush_all());
            events.push(Ok(LlmEvent::Done {
                usage: v.get("usage").and_then(parse_usage),
                finish_reason: Some(fr.to_string()),
            }));
        }

        events
    }

    /// Finish all pending calls in index order.
    fn flush_all(&mut self) -> Vec<Result<LlmEvent>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|c| Ok(c.into_finished()))
            .collect()
    }
}

impl PendingCall {
    fn into_finished(self) -> LlmEvent {
        LlmEvent::ToolCallFinished {
            call_id: self.call_id,
            tool_name: self.tool_name,
            arguments: self.arguments,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &s[..end]
    }
}
