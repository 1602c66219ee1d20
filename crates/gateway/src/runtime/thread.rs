//! Thread manager — drives the conversation loop of one agent run.
//!
//! Each iteration moves through `PROMPT_BUILD → LLM_STREAM →
//! PARSE_DISPATCH → PERSIST → DECIDE`. Cancellation is checked between
//! every pair of states and inside the stream loop; a cooperative stop
//! surfaces as [`RunOutcome::Cancelled`], every other failure propagates
//! and fails the run.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use relay_domain::cancel::CancelToken;
use relay_domain::config::Config;
use relay_domain::error::{Error, Result};
use relay_domain::event::EventKind;
use relay_domain::message::MessageKind;
use relay_domain::stream::{LlmEvent, Usage};
use relay_domain::tool::{ToolCall, ToolResult};
use relay_llm::{ChatRequest, LlmClient, ReasoningEffort, ToolChoice};
use relay_store::MessageStore;
use relay_tools::{ToolContext, ToolRegistry};

use super::context::ContextManager;
use super::dispatch::{ExecutionPolicy, ToolDispatcher};
use super::fabric::StreamingFabric;
use super::parser::{ParserEvent, ResponseParser};
use super::prompt::build_system_prompt;

/// Tool names whose successful result ends the run loop.
pub use relay_tools::builtin::control::TERMINAL_TOOLS;

/// Per-run options resolved from the request.
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub model: String,
    pub enable_thinking: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub enable_context_manager: bool,
    pub policy: ExecutionPolicy,
}

/// How a run loop ended, with the usage it accumulated.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Usage),
    Cancelled(Usage),
}

/// One parsed unit awaiting resolution, in parse order.
enum Pending {
    /// A call queued for post-stream dispatch.
    Queued(ToolCall),
    /// A call already executing (`execute_on_stream`).
    Running(ToolCall, tokio::task::JoinHandle<ToolResult>),
    /// A parser-synthesized result; no handler runs.
    Synthesized(ToolCall, ToolResult),
}

impl Pending {
    fn call(&self) -> &ToolCall {
        match self {
            Pending::Queued(c) | Pending::Running(c, _) | Pending::Synthesized(c, _) => c,
        }
    }
}

pub struct ThreadManager {
    store: Arc<dyn MessageStore>,
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<ToolDispatcher>,
    context: Arc<ContextManager>,
    fabric: Arc<StreamingFabric>,
    config: Arc<Config>,
}

impl ThreadManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        dispatcher: Arc<ToolDispatcher>,
        context: Arc<ContextManager>,
        fabric: Arc<StreamingFabric>,
        config: Arc<Config>,
    ) -> Self {
        Self { store, llm, registry, dispatcher, context, fabric, config }
    }

    /// Drive the loop until a terminal intent, a quiet iteration, the
    /// iteration cap, cancellation, or an error.
    pub async fn run(
        &self,
        run_id: Uuid,
        thread_id: Uuid,
        sandbox_id: Option<String>,
        options: &ThreadOptions,
        cancel: &CancelToken,
    ) -> Result<RunOutcome> {
        let mut total_usage = Usage::default();
        let ctx = ToolContext { sandbox_id, run_id: Some(run_id), thread_id: Some(thread_id) };
        let system_prompt = build_system_prompt(&self.registry, &options.policy);

        for iteration in 0..self.config.runtime.max_auto_continues {
            tracing::debug!(%run_id, iteration, "run loop iteration");

            // ── PROMPT_BUILD ─────────────────────────────────────────
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled(total_usage));
            }
            let messages = self
                .context
                .prepare(thread_id, &system_prompt, &options.model, options.enable_context_manager)
                .await?;

            // ── LLM_STREAM ───────────────────────────────────────────
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled(total_usage));
            }
            let request = ChatRequest {
                messages,
                tools: if options.policy.native_tool_calling {
                    self.registry.json_definitions()
                } else {
                    Vec::new()
                },
                tool_choice: ToolChoice::Auto,
                temperature: None,
                max_tokens: None,
                model: Some(options.model.clone()),
                enable_thinking: options.enable_thinking,
                reasoning_effort: options.reasoning_effort,
            };
            let stream = self.llm.chat_stream(&request).await?;

            let streamed = self
                .consume_stream(run_id, stream, options, &ctx, cancel)
                .await?;
            let StreamedTurn { text, pending, usage, cancelled } = streamed;

            if let Some(usage) = &usage {
                total_usage.add(usage);
            }
            if cancelled {
                return Ok(RunOutcome::Cancelled(total_usage));
            }

            // ── PERSIST (assistant turn) ─────────────────────────────
            let calls: Vec<ToolCall> = pending.iter().map(|p| p.call().clone()).collect();
            let assistant_content = serde_json::json!({ "content": text, "tool_calls": calls });
            self.store
                .append(thread_id, MessageKind::Assistant, assistant_content.clone(), true, Value::Null)
                .await?;
            self.fabric.publish(run_id, EventKind::AssistantMessage, assistant_content);

            // ── DECIDE (no tools → final answer) ─────────────────────
            if pending.is_empty() {
                return Ok(RunOutcome::Completed(total_usage));
            }

            // ── PARSE_DISPATCH (resolve pending calls) ───────────────
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled(total_usage));
            }
            let results = self.resolve_pending(run_id, &ctx, pending, options, cancel).await;

            // In-flight work may have finished after a stop; its results
            // are discarded rather than persisted.
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled(total_usage));
            }

            // ── PERSIST (tool results, parse order) ──────────────────
            for result in &results {
                let metadata = serde_json::json!({
                    "call_id": result.call_id,
                    "tool_name": result.tool_name,
                    "success": result.success,
                });
                self.store
                    .append(
                        thread_id,
                        MessageKind::Tool,
                        serde_json::to_value(result)?,
                        true,
                        metadata,
                    )
                    .await?;
            }

            // ── DECIDE ───────────────────────────────────────────────
            let terminal = results
                .iter()
                .any(|r| r.success && TERMINAL_TOOLS.contains(&r.tool_name.as_str()));
            if terminal {
                return Ok(RunOutcome::Completed(total_usage));
            }
        }

        tracing::warn!(
            %run_id,
            limit = self.config.runtime.max_auto_continues,
            "auto-continue limit reached"
        );
        Ok(RunOutcome::Completed(total_usage))
    }

    /// Pull the LLM stream through the parser, publishing text chunks and
    /// launching streamed tool execution as calls close.
    async fn consume_stream(
        &self,
        run_id: Uuid,
        mut stream: relay_domain::stream::BoxStream<'static, Result<LlmEvent>>,
        options: &ThreadOptions,
        ctx: &ToolContext,
        cancel: &CancelToken,
    ) -> Result<StreamedTurn> {
        let mut parser = ResponseParser::new(
            self.registry.clone(),
            options.policy.native_tool_calling,
            options.policy.xml_tool_calling,
            options.policy.max_xml_tool_calls,
        );
        let mut turn = StreamedTurn::default();
        let idle = self.config.llm.stream_idle_timeout;

        loop {
            let next = tokio::time::timeout(idle, stream.next()).await;
            let event = match next {
                Err(_) => {
                    return Err(Error::UpstreamTimeout(format!(
                        "no token from LLM for {}s",
                        idle.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(event))) => event,
            };

            if cancel.is_cancelled() {
                turn.cancelled = true;
                return Ok(turn);
            }

            match &event {
                LlmEvent::Done { usage, .. } => {
                    turn.usage = usage.clone();
                }
                LlmEvent::Error { message } => {
                    return Err(Error::UpstreamFailure(message.clone()));
                }
                _ => {}
            }

            for parsed in parser.push_event(&event) {
                self.handle_parser_event(run_id, parsed, options, ctx, cancel, &mut turn);
            }
        }

        for parsed in parser.finish() {
            self.handle_parser_event(run_id, parsed, options, ctx, cancel, &mut turn);
        }

        Ok(turn)
    }

    fn handle_parser_event(
        &self,
        run_id: Uuid,
        parsed: ParserEvent,
        options: &ThreadOptions,
        ctx: &ToolContext,
        cancel: &CancelToken,
        turn: &mut StreamedTurn,
    ) {
        match parsed {
            ParserEvent::Text { text } => {
                if text.is_empty() {
                    return;
                }
                self.fabric
                    .publish(run_id, EventKind::AssistantChunk, serde_json::json!({ "content": text }));
                turn.text.push_str(&text);
            }
            ParserEvent::Thinking { text } => {
                if options.enable_thinking {
                    self.fabric.publish(
                        run_id,
                        EventKind::AssistantChunk,
                        serde_json::json!({ "content": text, "thinking": true }),
                    );
                }
            }
            ParserEvent::Call(call) => {
                if options.policy.execute_on_stream && options.policy.execute_tools {
                    let handle = self.dispatcher.spawn(run_id, ctx, &call, cancel);
                    turn.pending.push(Pending::Running(call, handle));
                } else {
                    turn.pending.push(Pending::Queued(call));
                }
            }
            ParserEvent::Synthetic(result) => {
                // The occurrence was a call attempt; keep the correlation
                // visible by recording a pseudo-call with its id.
                let call = ToolCall::xml(&result.call_id, &result.tool_name, serde_json::json!({}));
                self.dispatcher.report_synthetic(run_id, &call, &result);
                turn.pending.push(Pending::Synthesized(call, result));
            }
        }
    }

    /// Resolve every pending unit into a result, preserving parse order.
    async fn resolve_pending(
        &self,
        run_id: Uuid,
        ctx: &ToolContext,
        pending: Vec<Pending>,
        options: &ThreadOptions,
        cancel: &CancelToken,
    ) -> Vec<ToolResult> {
        // Streamed executions are awaited in parse order; queued calls are
        // dispatched as one batch under the thread's strategy.
        let mut queued: Vec<ToolCall> = Vec::new();
        for unit in &pending {
            if let Pending::Queued(call) = unit {
                queued.push(call.clone());
            }
        }
        let mut batch_results = if queued.is_empty() {
            Vec::new()
        } else {
            self.dispatcher
                .execute_batch(run_id, ctx, &queued, &options.policy, cancel)
                .await
        }
        .into_iter();

        let mut running: Vec<(ToolCall, tokio::task::JoinHandle<ToolResult>)> = Vec::new();
        let mut order: Vec<Slot> = Vec::new();
        let mut synthesized: Vec<ToolResult> = Vec::new();
        for unit in pending {
            match unit {
                Pending::Queued(_) => order.push(Slot::Batch),
                Pending::Running(call, handle) => {
                    order.push(Slot::Streamed(running.len()));
                    running.push((call, handle));
                }
                Pending::Synthesized(_, result) => {
                    order.push(Slot::Synth(synthesized.len()));
                    synthesized.push(result);
                }
            }
        }

        let mut streamed_results = self.dispatcher.collect(run_id, running).await.into_iter();

        let mut results = Vec::with_capacity(order.len());
        for slot in order {
            match slot {
                Slot::Batch => {
                    if let Some(result) = batch_results.next() {
                        results.push(result);
                    }
                }
                Slot::Streamed(_) => {
                    if let Some(result) = streamed_results.next() {
                        results.push(result);
                    }
                }
                Slot::Synth(idx) => results.push(synthesized[idx].clone()),
            }
        }
        results
    }
}

enum Slot {
    Batch,
    Streamed(usize),
    Synth(usize),
}

#[derive(Default)]
struct StreamedTurn {
    text: String,
    pending: Vec<Pending>,
    usage: Option<Usage>,
    cancelled: bool,
}
