//! Tool dispatcher — resolves parsed calls against the registry and
//! executes them under the thread's execution policy.
//!
//! Guarantees:
//! - a handler failure becomes a `success=false` result; the conversation
//!   is never aborted by a tool;
//! - parallel execution fans out, but results are emitted and returned in
//!   parse order, independent of completion order;
//! - every call gets a start event and a completion event on the fabric.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use relay_domain::cancel::CancelToken;
use relay_domain::error::Error;
use relay_domain::event::EventKind;
use relay_domain::tool::{ToolCall, ToolResult};
use relay_tools::{ToolContext, ToolRegistry};

use super::fabric::StreamingFabric;

/// Ordering when multiple calls are pending in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    #[default]
    Parallel,
    Sequential,
}

/// Per-thread tool execution policy.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub xml_tool_calling: bool,
    pub native_tool_calling: bool,
    pub execute_tools: bool,
    pub execute_on_stream: bool,
    pub strategy: ExecutionStrategy,
    /// 0 = unlimited.
    pub max_xml_tool_calls: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            xml_tool_calling: true,
            native_tool_calling: true,
            execute_tools: true,
            execute_on_stream: false,
            strategy: ExecutionStrategy::Parallel,
            max_xml_tool_calls: 0,
        }
    }
}

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    fabric: Arc<StreamingFabric>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, fabric: Arc<StreamingFabric>, timeout: Duration) -> Self {
        Self { registry, fabric, timeout }
    }

    /// Execute a batch of calls under the policy's strategy, reporting
    /// start and completion events. Results come back in parse order.
    pub async fn execute_batch(
        &self,
        run_id: Uuid,
        ctx: &ToolContext,
        calls: &[ToolCall],
        policy: &ExecutionPolicy,
        cancel: &CancelToken,
    ) -> Vec<ToolResult> {
        if !policy.execute_tools {
            return calls
                .iter()
                .map(|call| {
                    self.publish_start(run_id, call);
                    let result = ToolResult::skipped(call);
                    self.publish_result(run_id, &result);
                    result
                })
                .collect();
        }

        match policy.strategy {
            ExecutionStrategy::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    self.publish_start(run_id, call);
                    let result = self.execute_one(ctx, call, cancel).await;
                    self.publish_result(run_id, &result);
                    results.push(result);
                }
                results
            }
            ExecutionStrategy::Parallel => {
                for call in calls {
                    self.publish_start(run_id, call);
                }
                let futures: Vec<_> = calls.iter().map(|call| self.execute_one(ctx, call, cancel)).collect();
                // join_all preserves input order, which is parse order.
                let results = futures_util::future::join_all(futures).await;
                for result in &results {
                    self.publish_result(run_id, result);
                }
                results
            }
        }
    }

    /// Launch one call immediately (streaming execution). The start event
    /// fires now; the completion event fires when [`Self::collect`]
    /// reaches the handle in parse order.
    pub fn spawn(
        &self,
        run_id: Uuid,
        ctx: &ToolContext,
        call: &ToolCall,
        cancel: &CancelToken,
    ) -> JoinHandle<ToolResult> {
        self.publish_start(run_id, call);

        let dispatcher = self.clone();
        let ctx = ctx.clone();
        let call = call.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.execute_one(&ctx, &call, &cancel).await })
    }

    /// Await spawned handles in parse order, publishing each completion.
    pub async fn collect(&self, run_id: Uuid, handles: Vec<(ToolCall, JoinHandle<ToolResult>)>) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(handles.len());
        for (call, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => ToolResult::failure(&call, format!("tool task panicked: {e}")),
            };
            self.publish_result(run_id, &result);
            results.push(result);
        }
        results
    }

    /// Publish the completion event for a result the parser synthesized
    /// (no handler ran, but the correlation contract still holds).
    pub fn report_synthetic(&self, run_id: Uuid, call: &ToolCall, result: &ToolResult) {
        self.publish_start(run_id, call);
        self.publish_result(run_id, result);
    }

    async fn execute_one(&self, ctx: &ToolContext, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        if let Some(reason) = &call.argument_error {
            return ToolResult::failure(call, format!("argument coercion failed: {reason}"));
        }
        if cancel.is_cancelled() {
            return ToolResult::failure(call, "cancelled before execution");
        }

        let Some(spec) = self.registry.lookup_by_name(&call.tool_name) else {
            return ToolResult::failure(call, format!("unknown tool: {:?}", call.tool_name));
        };

        let started = std::time::Instant::now();
        let invocation = spec.handler.invoke(ctx, call.arguments.clone(), cancel);
        let outcome = tokio::time::timeout(self.timeout, invocation).await;

        match outcome {
            Ok(Ok(payload)) => ToolResult::ok(call, payload),
            Ok(Err(Error::Cancelled)) => ToolResult::failure(call, "cancelled"),
            Ok(Err(e)) => {
                tracing::warn!(
                    tool = %call.tool_name,
                    call_id = %call.call_id,
                    error = %e,
                    "tool handler failed"
                );
                ToolResult::failure(call, e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    tool = %call.tool_name,
                    call_id = %call.call_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool handler timed out"
                );
                ToolResult::failure(call, format!("timed out after {}s", self.timeout.as_secs()))
            }
        }
    }

    fn publish_start(&self, run_id: Uuid, call: &ToolCall) {
        self.fabric.publish(
            run_id,
            EventKind::ToolStart,
            serde_json::json!({
                "call_id": call.call_id,
                "tool_name": call.tool_name,
                "arguments": call.arguments,
            }),
        );
    }

    fn publish_result(&self, run_id: Uuid, result: &ToolResult) {
        let payload = serde_json::to_value(result).unwrap_or(Value::Null);
        self.fabric.publish(run_id, EventKind::ToolResult, payload);
    }
}
