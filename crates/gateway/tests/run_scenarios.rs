//! End-to-end scenarios driving the full pipeline — run manager, thread
//! loop, parser, dispatcher, fabric — against a scripted LLM and an
//! in-process sandbox.

mod common;

use std::time::Duration;

use common::*;
use relay_domain::config::Config;
use relay_store::MessageStore;
use relay_domain::event::EventKind;
use relay_domain::run::RunStatus;
use relay_domain::stream::LlmEvent;
use relay_tools::builtin::control;
use relay_tools::ToolRegistry;

fn base_config() -> Config {
    let mut config = Config::default();
    config.llm.default_model = "gpt-4o".into();
    config
}

fn registry_with_control() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(control::complete_spec()).unwrap();
    registry.register(control::ask_spec()).unwrap();
    registry.register(control::browser_takeover_spec()).unwrap();
    registry
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single-turn completion via XML tag
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn single_turn_completion() {
    let llm = FakeLlm::new(vec![Script::Events(vec![
        LlmEvent::Token { text: "DONE".into() },
        LlmEvent::Token { text: "<complete></complete>".into() },
        FakeLlm::done(),
    ])]);
    let h = harness(llm, registry_with_control(), base_config());

    let run = h
        .manager
        .start_run(default_request("Reply with DONE then call complete."), vec![])
        .await
        .unwrap();
    let events = collect_until_done(h.manager.subscribe(run.run_id).unwrap(), Duration::from_secs(5)).await;

    // One assistant chunk carrying exactly "DONE".
    let chunks: Vec<_> = events.iter().filter(|e| e.kind == EventKind::AssistantChunk).collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].payload["content"], serde_json::json!("DONE"));

    // One tool_start for complete.
    let starts: Vec<_> = events.iter().filter(|e| e.kind == EventKind::ToolStart).collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].payload["tool_name"], serde_json::json!("complete"));

    // One successful tool_result with the completion payload.
    let results: Vec<_> = events.iter().filter(|e| e.kind == EventKind::ToolResult).collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].payload["success"], serde_json::json!(true));
    assert_eq!(results[0].payload["payload"]["status"], serde_json::json!("complete"));

    // Exactly one done, and it is the final event.
    assert!(events.last().unwrap().is_done());
    assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);

    let view = h.manager.status(run.run_id).unwrap();
    assert_eq!(view.status, RunStatus::Completed);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parallel tool fan-out preserves parse order
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn parallel_fanout_persists_in_parse_order() {
    let llm = FakeLlm::new(vec![
        Script::Events(vec![
            LlmEvent::ToolCallStarted { call_id: "c1".into(), tool_name: "search".into() },
            LlmEvent::ToolCallFinished {
                call_id: "c1".into(),
                tool_name: "search".into(),
                arguments: r#"{"query":"A"}"#.into(),
            },
            LlmEvent::ToolCallStarted { call_id: "c2".into(), tool_name: "search".into() },
            LlmEvent::ToolCallFinished {
                call_id: "c2".into(),
                tool_name: "search".into(),
                arguments: r#"{"query":"B"}"#.into(),
            },
            FakeLlm::done(),
        ]),
        Script::Events(vec![LlmEvent::Token { text: "both searches finished".into() }, FakeLlm::done()]),
    ]);
    let registry = ToolRegistry::new();
    registry.register(search_spec()).unwrap();
    let h = harness(llm, registry, base_config());

    let run = h.manager.start_run(default_request("search A and B"), vec![]).await.unwrap();
    let events = collect_until_done(h.manager.subscribe(run.run_id).unwrap(), Duration::from_secs(5)).await;
    assert!(events.last().unwrap().is_done());

    // search("A") sleeps 100 ms and search("B") 10 ms, so B completes
    // first; persisted order must still be A then B.
    let tool_messages: Vec<_> = h
        .store
        .list(run.thread_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == relay_domain::message::MessageKind::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].content["call_id"], serde_json::json!("c1"));
    assert_eq!(tool_messages[0].content["payload"]["result"], serde_json::json!("RA"));
    assert_eq!(tool_messages[1].content["call_id"], serde_json::json!("c2"));
    assert_eq!(tool_messages[1].content["payload"]["result"], serde_json::json!("RB"));

    // The tool_result events mirror the same order.
    let result_ids: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ToolResult)
        .map(|e| e.payload["call_id"].clone())
        .collect();
    assert_eq!(result_ids, vec![serde_json::json!("c1"), serde_json::json!("c2")]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool failure is isolated, the run continues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_failure_does_not_fail_run() {
    let llm = FakeLlm::new(vec![
        Script::Events(vec![
            LlmEvent::ToolCallStarted { call_id: "c1".into(), tool_name: "read_file".into() },
            LlmEvent::ToolCallFinished {
                call_id: "c1".into(),
                tool_name: "read_file".into(),
                arguments: r#"{"path":"/missing"}"#.into(),
            },
            FakeLlm::done(),
        ]),
        Script::Events(vec![
            LlmEvent::Token { text: "the file is missing, stopping here".into() },
            FakeLlm::done(),
        ]),
    ]);
    let registry = ToolRegistry::new();
    registry.register(failing_read_spec()).unwrap();
    let h = harness(llm, registry, base_config());

    let run = h.manager.start_run(default_request("read /missing"), vec![]).await.unwrap();
    let events = collect_until_done(h.manager.subscribe(run.run_id).unwrap(), Duration::from_secs(5)).await;
    assert!(events.last().unwrap().is_done());

    let tool_messages: Vec<_> = h
        .store
        .list(run.thread_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == relay_domain::message::MessageKind::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].content["success"], serde_json::json!(false));
    assert!(tool_messages[0].content["error"]
        .as_str()
        .unwrap()
        .contains("not found"));

    // A second iteration ran (the LLM got to react) and the run completed.
    assert_eq!(h.llm.requests.lock().len(), 2);
    assert_eq!(h.manager.status(run.run_id).unwrap().status, RunStatus::Completed);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation mid-stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn stop_mid_stream_terminates_within_deadline() {
    let llm = FakeLlm::new(vec![Script::Endless]);
    let h = harness(llm, registry_with_control(), base_config());

    let run = h.manager.start_run(default_request("stream forever"), vec![]).await.unwrap();

    // Wait for streaming to visibly start.
    let mut sub = h.manager.subscribe(run.run_id).unwrap();
    let rx = sub.live.as_mut().expect("run is live");
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("stream started")
            .unwrap();
        if event.kind == EventKind::AssistantChunk {
            break;
        }
    }

    let stopped_at = tokio::time::Instant::now();
    assert_eq!(h.manager.stop(run.run_id).unwrap(), RunStatus::Stopped);

    let tail = collect_until_done(h.manager.subscribe(run.run_id).unwrap(), Duration::from_secs(2)).await;
    assert!(tail.last().unwrap().is_done(), "done must arrive after stop");
    assert!(stopped_at.elapsed() < Duration::from_secs(2));

    // A STOPPED status event precedes done, and nothing follows done.
    let replay = h.fabric.replay(run.run_id);
    let done_idx = replay.iter().position(|e| e.is_done()).unwrap();
    assert_eq!(done_idx, replay.len() - 1);
    assert!(replay[..done_idx]
        .iter()
        .any(|e| e.kind == EventKind::Status && e.payload["status"] == serde_json::json!("STOPPED")));

    // Stop is idempotent on a terminal run.
    assert_eq!(h.manager.stop(run.run_id).unwrap(), RunStatus::Stopped);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.fabric.replay(run.run_id).len(), replay.len(), "no events after done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Late subscriber replay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn late_subscriber_sees_identical_ordered_replay() {
    let llm = FakeLlm::new(vec![Script::Events(vec![
        LlmEvent::Token { text: "DONE".into() },
        LlmEvent::Token { text: "<complete></complete>".into() },
        FakeLlm::done(),
    ])]);
    let h = harness(llm, registry_with_control(), base_config());

    let run = h.manager.start_run(default_request("finish immediately"), vec![]).await.unwrap();
    let live_events = collect_until_done(h.manager.subscribe(run.run_id).unwrap(), Duration::from_secs(5)).await;

    // Subscribe again after completion: channel is gone, replay is whole.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let late = h.manager.subscribe(run.run_id).unwrap();
    assert!(late.live.is_none());

    let late_seqs: Vec<u64> = late.replay.iter().map(|e| e.seq).collect();
    let live_seqs: Vec<u64> = live_events.iter().map(|e| e.seq).collect();
    assert_eq!(late_seqs, live_seqs);

    // No duplicates, no gaps, done last.
    let expected: Vec<u64> = (0..late.replay.len() as u64).collect();
    assert_eq!(late_seqs, expected);
    assert!(late.replay.last().unwrap().is_done());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context compaction before the LLM call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn compaction_summarizes_tail_before_llm_call() {
    use relay_domain::cancel::CancelToken;
    use relay_domain::message::MessageKind;
    use relay_gateway::runtime::{ExecutionPolicy, ThreadOptions};
    use relay_store::{MessageStore, ProjectStore};

    let llm = FakeLlm::new(vec![Script::Events(vec![
        LlmEvent::Token { text: "acknowledged".into() },
        FakeLlm::done(),
    ])]);

    // Budget 400 tokens: the system prompt fits, twenty accumulated
    // messages do not.
    let mut config = base_config();
    config.llm.token_budgets.insert("gpt-4o".into(), 400);
    let h = harness(llm, registry_with_control(), config);

    // A thread with 20 accumulated messages, well past the threshold.
    let project = h.projects.ensure_project("acct").await.unwrap();
    let thread = h.projects.create_thread(project.project_id).await.unwrap();
    for i in 0..20 {
        let kind = if i % 2 == 0 { MessageKind::User } else { MessageKind::Assistant };
        h.store
            .append(
                thread.thread_id,
                kind,
                serde_json::Value::String(format!("message number {i} with some padding text")),
                true,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
    }

    let options = ThreadOptions {
        model: "gpt-4o".into(),
        enable_thinking: false,
        reasoning_effort: None,
        enable_context_manager: true,
        policy: ExecutionPolicy::default(),
    };
    h.threads
        .run(uuid::Uuid::new_v4(), thread.thread_id, None, &options, &CancelToken::new())
        .await
        .unwrap();

    // A summary message exists and records its coverage.
    let all = h.store.list(thread.thread_id).await.unwrap();
    let summary = all.iter().find(|m| m.kind == MessageKind::Summary).expect("summary appended");
    let covers = summary.metadata["covers"].as_array().unwrap();
    assert_eq!(covers.len(), 2);
    assert_eq!(covers[0], serde_json::json!(all[0].message_id));

    // The prompt actually sent to the LLM: system first, the summary
    // rendered as a system message, and a total estimate within budget.
    let requests = h.llm.requests.lock();
    let stream_request = requests.last().unwrap();
    let rendered: Vec<String> = stream_request.messages.iter().map(|m| m.content.text()).collect();
    assert!(rendered
        .iter()
        .any(|text| text.contains("Condensed history.")));

    let total_chars: usize = rendered.iter().map(|t| t.len()).sum();
    assert!(total_chars / 4 <= 400, "prompt estimate {} exceeds budget", total_chars / 4);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker pool admission
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn saturated_pool_queues_then_admission_times_out() {
    let llm = FakeLlm::new(vec![Script::Endless, Script::Endless]);
    let mut config = base_config();
    config.runtime.worker_pool_size = 1;
    config.runtime.admission_timeout = Duration::from_millis(200);
    let h = harness(llm, registry_with_control(), config);

    let first = h.manager.start_run(default_request("hog the only worker"), vec![]).await.unwrap();
    assert_eq!(first.status, RunStatus::Running);

    let second = h.manager.start_run(default_request("wait in line"), vec![]).await.unwrap();
    assert_eq!(second.status, RunStatus::Pending);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let view = h.manager.status(second.run_id).unwrap();
    assert_eq!(view.status, RunStatus::Failed);
    assert!(view.error.unwrap().contains("admission timeout"));

    // The queued run's stream closed with a done event.
    let replay = h.fabric.replay(second.run_id);
    assert!(replay.last().unwrap().is_done());

    h.manager.stop(first.run_id).unwrap();
}

#[tokio::test]
async fn stopping_queued_run_emits_single_done_after_deadline() {
    let llm = FakeLlm::new(vec![Script::Endless, Script::Endless]);
    let mut config = base_config();
    config.runtime.worker_pool_size = 1;
    config.runtime.admission_timeout = Duration::from_millis(150);
    let h = harness(llm, registry_with_control(), config);

    let first = h.manager.start_run(default_request("occupy the worker"), vec![]).await.unwrap();
    let second = h.manager.start_run(default_request("queue then stop"), vec![]).await.unwrap();
    assert_eq!(second.status, RunStatus::Pending);

    assert_eq!(h.manager.stop(second.run_id).unwrap(), RunStatus::Stopped);

    // Let the parked admission task hit its deadline; it must not fail
    // the stopped run or emit a second closing event.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let view = h.manager.status(second.run_id).unwrap();
    assert_eq!(view.status, RunStatus::Stopped);
    assert!(view.error.is_none());

    let replay = h.fabric.replay(second.run_id);
    assert_eq!(replay.iter().filter(|e| e.is_done()).count(), 1);
    assert!(replay.last().unwrap().is_done());
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (0..replay.len() as u64).collect();
    assert_eq!(seqs, expected);

    h.manager.stop(first.run_id).unwrap();
}
