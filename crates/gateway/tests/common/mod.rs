//! Shared fixtures for the end-to-end scenario tests: a scripted LLM
//! client, an in-process sandbox, and a fully wired run manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use relay_domain::cancel::CancelToken;
use relay_domain::config::Config;
use relay_domain::error::{Error, Result};
use relay_domain::event::RunEvent;
use relay_domain::stream::{BoxStream, LlmEvent, Usage};
use relay_gateway::runtime::fabric::Subscription;
use relay_gateway::runtime::{
    ContextManager, RunManager, StreamingFabric, ThreadManager, ToolDispatcher,
};
use relay_llm::{ChatRequest, ChatResponse, LlmClient};
use relay_sandbox::{ExecOutput, FileEntry, SandboxHandle, SandboxProvider};
use relay_store::{InMemoryMessageStore, InMemoryProjectStore, KvStore, MessageStore, ProjectStore};
use relay_tools::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted response of the fake LLM.
pub enum Script {
    /// Emit these events in order, then end the stream.
    Events(Vec<LlmEvent>),
    /// Emit tokens forever (until the consumer stops reading).
    Endless,
}

/// Scripted [`LlmClient`]: each `chat_stream` call consumes the next
/// script entry; requests are recorded for assertions.
pub struct FakeLlm {
    scripts: Mutex<std::collections::VecDeque<Script>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub summary_text: String,
}

impl FakeLlm {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            summary_text: "Condensed history.".into(),
        }
    }

    pub fn done() -> LlmEvent {
        LlmEvent::Done {
            usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
            finish_reason: Some("stop".into()),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for FakeLlm {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req.clone());
        Ok(ChatResponse {
            content: self.summary_text.clone(),
            usage: Some(Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 }),
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<LlmEvent>>> {
        self.requests.lock().push(req.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| Error::UpstreamFailure("fake LLM script exhausted".into()))?;

        let stream = async_stream::stream! {
            match script {
                Script::Events(events) => {
                    for event in events {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        yield Ok(event);
                    }
                }
                Script::Endless => {
                    let mut i = 0u64;
                    loop {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        yield Ok(LlmEvent::Token { text: format!("t{i} ") });
                        i += 1;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct FakeSandbox {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, _project_id: Uuid) -> Result<SandboxHandle> {
        Ok(SandboxHandle { sandbox_id: "sbx-test".into() })
    }

    async fn start(&self, _sandbox_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _sandbox_id: &str) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, _sandbox_id: &str, command: &str) -> Result<ExecOutput> {
        Ok(ExecOutput { exit_code: 0, stdout: format!("ran: {command}"), stderr: String::new() })
    }

    async fn read_file(&self, _sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ToolFailure(format!("{path}: not found")))
    }

    async fn write_file(&self, _sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.files.lock().insert(path.to_owned(), contents.to_vec());
        Ok(())
    }

    async fn delete_file(&self, _sandbox_id: &str, path: &str) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    async fn list_dir(&self, _sandbox_id: &str, _path: &str) -> Result<Vec<FileEntry>> {
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A `search` tool whose latency and answer depend on the query, used to
/// prove result ordering is parse order, not completion order.
pub struct TimedSearch;

#[async_trait::async_trait]
impl ToolHandler for TimedSearch {
    async fn invoke(&self, _ctx: &ToolContext, arguments: serde_json::Value, _cancel: &CancelToken) -> Result<serde_json::Value> {
        let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let (delay_ms, answer) = match query {
            "A" => (100, "RA"),
            "B" => (10, "RB"),
            other => (1, other),
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(serde_json::json!({ "result": answer }))
    }
}

pub fn search_spec() -> ToolSpec {
    ToolSpec {
        name: "search".into(),
        description: "timed search".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }),
        xml: None,
        handler: Arc::new(TimedSearch),
    }
}

/// A `read_file` stand-in that always fails, for the failure-isolation
/// scenario.
pub struct MissingFile;

#[async_trait::async_trait]
impl ToolHandler for MissingFile {
    async fn invoke(&self, _ctx: &ToolContext, arguments: serde_json::Value, _cancel: &CancelToken) -> Result<serde_json::Value> {
        let path = arguments.get("path").and_then(|v| v.as_str()).unwrap_or("?");
        Err(Error::ToolFailure(format!("{path}: not found")))
    }
}

pub fn failing_read_spec() -> ToolSpec {
    ToolSpec {
        name: "read_file".into(),
        description: "read a file".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }),
        xml: None,
        handler: Arc::new(MissingFile),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Harness {
    pub manager: Arc<RunManager>,
    pub store: Arc<InMemoryMessageStore>,
    pub projects: Arc<InMemoryProjectStore>,
    pub threads: Arc<ThreadManager>,
    pub fabric: Arc<StreamingFabric>,
    pub llm: Arc<FakeLlm>,
}

pub fn harness(llm: FakeLlm, registry: ToolRegistry, config: Config) -> Harness {
    let config = Arc::new(config);
    let llm: Arc<FakeLlm> = Arc::new(llm);
    let llm_dyn: Arc<dyn LlmClient> = llm.clone();
    let registry = Arc::new(registry);

    let kv = Arc::new(KvStore::new());
    let store = Arc::new(InMemoryMessageStore::new());
    let store_dyn: Arc<dyn MessageStore> = store.clone();
    let projects = Arc::new(InMemoryProjectStore::new());
    let projects_dyn: Arc<dyn ProjectStore> = projects.clone();
    let sandbox: Arc<dyn SandboxProvider> = Arc::new(FakeSandbox::default());

    let fabric = Arc::new(StreamingFabric::new(kv.clone(), config.runtime.response_list_ttl));
    let dispatcher = Arc::new(ToolDispatcher::new(
        registry.clone(),
        fabric.clone(),
        config.runtime.tool_timeout,
    ));
    let context = Arc::new(ContextManager::new(llm_dyn.clone(), store_dyn.clone(), config.clone()));
    let threads = Arc::new(ThreadManager::new(
        store_dyn.clone(),
        llm_dyn,
        registry,
        dispatcher,
        context,
        fabric.clone(),
        config.clone(),
    ));
    let manager = Arc::new(RunManager::new(
        config,
        projects_dyn,
        store_dyn,
        sandbox,
        kv,
        fabric.clone(),
        threads.clone(),
    ));

    Harness { manager, store, projects, threads, fabric, llm }
}

pub fn default_request(prompt: &str) -> relay_gateway::runtime::AgentRunRequest {
    serde_json::from_value(serde_json::json!({
        "model_name": "gpt-4o",
        "initial_prompt": prompt,
        "stream": true,
        "enable_context_manager": false,
    }))
    .unwrap()
}

/// Drain a subscription until the closing `done` event (or the deadline).
pub async fn collect_until_done(mut sub: Subscription, deadline: Duration) -> Vec<RunEvent> {
    let mut events = Vec::new();
    for event in sub.replay.drain(..) {
        let is_done = event.is_done();
        events.push(event);
        if is_done {
            return events;
        }
    }

    let Some(mut rx) = sub.live else { return events };
    let stop_at = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = stop_at.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                let is_done = event.is_done();
                events.push(event);
                if is_done {
                    return events;
                }
            }
            Ok(Err(_)) | Err(_) => return events,
        }
    }
}

