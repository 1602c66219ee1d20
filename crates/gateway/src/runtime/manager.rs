//! Run manager — accepts run requests, performs setup (account → project
//! → sandbox → thread → attachments → initial message), admits runs onto
//! the bounded worker pool, tracks status, and serves cancellation.
//!
//! Status lives in two places: the in-memory run map (authoritative while
//! the process lives) and the KV status registry `run:<id>:status`
//! (best-effort, TTL'd, queryable after restart). A startup sweep rewrites
//! any KV record still claiming RUNNING or PENDING to FAILED, so a
//! post-crash read never reports a run whose worker no longer exists as
//! alive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use relay_domain::cancel::CancelToken;
use relay_domain::config::Config;
use relay_domain::error::{Error, Result};
use relay_domain::event::{EventKind, RunEvent};
use relay_domain::message::MessageKind;
use relay_domain::run::{AgentRun, RunStatus};
use relay_domain::stream::Usage;
use relay_llm::ReasoningEffort;
use relay_sandbox::SandboxProvider;
use relay_store::{KvStore, MessageStore, ProjectStore};

use super::dispatch::ExecutionPolicy;
use super::fabric::{StreamingFabric, Subscription};
use super::thread::{RunOutcome, ThreadManager, ThreadOptions};

/// The run request body (the `request` part of `POST /agent/runs`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRunRequest {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default = "default_true")]
    pub enable_context_manager: bool,
    pub initial_prompt: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// One uploaded attachment from the multipart request.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Status answer assembled from the run map or, after a restart, the KV
/// registry.
#[derive(Debug, Clone)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub status: RunStatus,
    pub error: Option<String>,
}

struct RunHandle {
    run: AgentRun,
    cancel: CancelToken,
    /// Whether the closing `done` event went out. Exactly one finish path
    /// may claim it, whichever reaches the run map first.
    done_published: bool,
}

struct Inner {
    config: Arc<Config>,
    projects: Arc<dyn ProjectStore>,
    store: Arc<dyn MessageStore>,
    sandbox: Arc<dyn SandboxProvider>,
    kv: Arc<KvStore>,
    fabric: Arc<StreamingFabric>,
    threads: Arc<ThreadManager>,
    runs: RwLock<HashMap<Uuid, RunHandle>>,
    pool: Arc<Semaphore>,
}

/// Cheap to clone; all state sits behind one `Arc`.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    pub fn new(
        config: Arc<Config>,
        projects: Arc<dyn ProjectStore>,
        store: Arc<dyn MessageStore>,
        sandbox: Arc<dyn SandboxProvider>,
        kv: Arc<KvStore>,
        fabric: Arc<StreamingFabric>,
        threads: Arc<ThreadManager>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.runtime.worker_pool_size));
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                projects,
                store,
                sandbox,
                kv,
                fabric,
                threads,
                runs: RwLock::new(HashMap::new()),
                pool,
            }),
        };
        manager.startup_sweep();
        manager
    }

    /// Rewrite stale RUNNING/PENDING status records left by a crashed
    /// process to FAILED.
    fn startup_sweep(&self) {
        for key in self.inner.kv.keys_with_prefix("run:") {
            if !key.ends_with(":status") {
                continue;
            }
            let Some(raw) = self.inner.kv.get(&key) else { continue };
            let Ok(record) = serde_json::from_str::<serde_json::Value>(&raw) else { continue };
            let status = record.get("status").and_then(|v| v.as_str()).unwrap_or("");
            if status == "RUNNING" || status == "PENDING" {
                let mut swept = record.clone();
                swept["status"] = serde_json::json!("FAILED");
                swept["error"] = serde_json::json!("worker lost (process restart)");
                self.inner
                    .kv
                    .set(&key, swept.to_string(), Some(self.inner.config.runtime.status_ttl));
                tracing::warn!(key = %key, "swept orphaned run to FAILED");
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // start_run
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Setup + admission. Errors out of here are returned synchronously
    /// to the HTTP caller; once the run is admitted, failures surface on
    /// the fabric instead.
    pub async fn start_run(&self, request: AgentRunRequest, attachments: Vec<Attachment>) -> Result<AgentRun> {
        if request.initial_prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("initial_prompt must not be empty".into()));
        }

        let account_id = request.user_id.clone().unwrap_or_else(|| "default".into());

        // ── Setup: project → sandbox → thread ────────────────────────
        let project = self.inner.projects.ensure_project(&account_id).await?;
        let sandbox_id = match &project.sandbox_ref {
            Some(existing) => existing.clone(),
            None => {
                let handle = self.inner.sandbox.create(project.project_id).await?;
                self.inner.sandbox.start(&handle.sandbox_id).await?;
                self.inner
                    .projects
                    .set_sandbox_ref(project.project_id, &handle.sandbox_id)
                    .await?;
                handle.sandbox_id
            }
        };

        let thread = self.inner.projects.create_thread(project.project_id).await?;

        // ── Upload attachments into the sandbox workspace ────────────
        let mut uploaded = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let path = format!("/workspace/{}", attachment.filename);
            self.inner
                .sandbox
                .write_file(&sandbox_id, &path, &attachment.bytes)
                .await?;
            uploaded.push(path);
        }

        // ── Initial user message ─────────────────────────────────────
        let metadata = if uploaded.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::json!({ "attachments": uploaded })
        };
        self.inner
            .store
            .append(
                thread.thread_id,
                MessageKind::User,
                serde_json::Value::String(request.initial_prompt.clone()),
                true,
                metadata,
            )
            .await?;

        // ── Create the run record ────────────────────────────────────
        let run = AgentRun::new(thread.thread_id, project.project_id);
        let run_id = run.run_id;
        let cancel = CancelToken::new();
        self.inner.runs.write().insert(
            run_id,
            RunHandle { run: run.clone(), cancel: cancel.clone(), done_published: false },
        );
        self.mirror_status(run_id, RunStatus::Pending, Some(thread.thread_id), None);

        let options = ThreadOptions {
            model: request
                .model_name
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.inner.config.llm.default_model.clone()),
            enable_thinking: request.enable_thinking,
            reasoning_effort: request.reasoning_effort,
            enable_context_manager: request.enable_context_manager,
            policy: ExecutionPolicy::default(),
        };

        // ── Admission ────────────────────────────────────────────────
        match self.inner.pool.clone().try_acquire_owned() {
            Ok(permit) => {
                self.promote_and_spawn(run_id, thread.thread_id, sandbox_id, options, cancel, permit);
            }
            Err(_) => {
                // Pool saturated: stay PENDING, queue FIFO on the
                // semaphore with the admission deadline.
                let manager = self.clone();
                let thread_id = thread.thread_id;
                tokio::spawn(async move {
                    manager
                        .wait_for_admission(run_id, thread_id, sandbox_id, options, cancel)
                        .await;
                });
            }
        }

        let current = self
            .inner
            .runs
            .read()
            .get(&run_id)
            .map(|h| h.run.clone())
            .unwrap_or(run);
        Ok(current)
    }

    async fn wait_for_admission(
        &self,
        run_id: Uuid,
        thread_id: Uuid,
        sandbox_id: String,
        options: ThreadOptions,
        cancel: CancelToken,
    ) {
        let deadline = self.inner.config.runtime.admission_timeout;
        match tokio::time::timeout(deadline, self.inner.pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                // The run may have been stopped while queued.
                if self.is_pending(run_id) {
                    self.promote_and_spawn(run_id, thread_id, sandbox_id, options, cancel, permit);
                }
            }
            Ok(Err(_)) => {
                // A stop while queued already drove the run terminal and
                // emitted its closing event; there is nothing left to fail.
                if self.is_pending(run_id) {
                    self.fail_run(run_id, "worker pool closed".into());
                }
            }
            Err(_) => {
                if self.is_pending(run_id) {
                    tracing::warn!(%run_id, deadline_s = deadline.as_secs(), "admission deadline exceeded");
                    self.fail_run(run_id, format!("admission timeout after {}s", deadline.as_secs()));
                }
            }
        }
    }

    fn is_pending(&self, run_id: Uuid) -> bool {
        self.inner
            .runs
            .read()
            .get(&run_id)
            .map(|h| h.run.status == RunStatus::Pending)
            .unwrap_or(false)
    }

    fn promote_and_spawn(
        &self,
        run_id: Uuid,
        thread_id: Uuid,
        sandbox_id: String,
        options: ThreadOptions,
        cancel: CancelToken,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        {
            let mut runs = self.inner.runs.write();
            let Some(handle) = runs.get_mut(&run_id) else { return };
            if !handle.run.status.can_transition(RunStatus::Running) {
                return;
            }
            handle.run.status = RunStatus::Running;
        }
        self.mirror_status(run_id, RunStatus::Running, Some(thread_id), None);
        self.inner.fabric.publish(
            run_id,
            EventKind::Status,
            RunEvent::status_payload(RunStatus::Running, None),
        );

        let manager = self.clone();
        let span = tracing::info_span!("run", %run_id);
        tokio::spawn(tracing::Instrument::instrument(
            async move {
                let _permit = permit;

                // Refresh the status key's TTL while the worker lives.
                let refresher = {
                    let kv = manager.inner.kv.clone();
                    let ttl = manager.inner.config.runtime.status_ttl;
                    let key = status_key(run_id);
                    tokio::spawn(async move {
                        let mut tick = tokio::time::interval(ttl / 2);
                        tick.tick().await;
                        loop {
                            tick.tick().await;
                            kv.expire(&key, ttl);
                        }
                    })
                };

                let outcome = manager
                    .inner
                    .threads
                    .run(run_id, thread_id, Some(sandbox_id), &options, &cancel)
                    .await;
                refresher.abort();

                match outcome {
                    Ok(RunOutcome::Completed(usage)) => {
                        manager.finish_run(run_id, RunStatus::Completed, None, Some(usage));
                    }
                    Ok(RunOutcome::Cancelled(usage)) => {
                        manager.finish_cancelled(run_id, Some(usage));
                    }
                    Err(e) if e.is_cancelled() => {
                        manager.finish_cancelled(run_id, None);
                    }
                    Err(e) => {
                        tracing::warn!(%run_id, error = %e, "run failed");
                        manager.finish_run(run_id, RunStatus::Failed, Some(e.to_string()), None);
                    }
                }
            },
            span,
        ));
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Terminal transitions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Drive a run to a terminal state: status event (plus error event on
    /// failure), the closing `done`, then channel teardown.
    fn finish_run(&self, run_id: Uuid, status: RunStatus, error: Option<String>, usage: Option<Usage>) {
        enum Step {
            // Another finish path already emitted the closing done.
            Finished,
            // A concurrent stop won the status race; it published its own
            // status event, so only the closing done remains.
            AlreadyTerminal(RunStatus),
            Transitioned(Uuid),
        }

        let step = {
            let mut runs = self.inner.runs.write();
            let Some(handle) = runs.get_mut(&run_id) else { return };
            if handle.run.status.is_terminal() {
                if handle.done_published {
                    Step::Finished
                } else {
                    handle.done_published = true;
                    Step::AlreadyTerminal(handle.run.status)
                }
            } else {
                handle.run.finish(status);
                handle.run.error = error.clone();
                handle.done_published = true;
                Step::Transitioned(handle.run.thread_id)
            }
        };

        match step {
            Step::Finished => {}
            Step::AlreadyTerminal(current) => {
                self.publish_done(run_id, current, usage);
                self.inner.fabric.close(run_id);
            }
            Step::Transitioned(thread_id) => {
                self.mirror_status(run_id, status, Some(thread_id), error.as_deref());
                if let Some(message) = &error {
                    self.inner
                        .fabric
                        .publish(run_id, EventKind::Error, serde_json::json!({ "message": message }));
                }
                self.inner.fabric.publish(
                    run_id,
                    EventKind::Status,
                    RunEvent::status_payload(status, error.as_deref()),
                );
                self.publish_done(run_id, status, usage);
                self.inner.fabric.close(run_id);
            }
        }
    }

    /// The worker observed cancellation; `stop()` already published the
    /// STOPPED status event, so only the closing `done` is owed — if no
    /// other path claimed it first.
    fn finish_cancelled(&self, run_id: Uuid, usage: Option<Usage>) {
        let claimed = {
            let mut runs = self.inner.runs.write();
            match runs.get_mut(&run_id) {
                Some(handle) if !handle.done_published => {
                    handle.done_published = true;
                    true
                }
                _ => false,
            }
        };
        if claimed {
            self.publish_done(run_id, RunStatus::Stopped, usage);
            self.inner.fabric.close(run_id);
        }
    }

    fn fail_run(&self, run_id: Uuid, error: String) {
        self.finish_run(run_id, RunStatus::Failed, Some(error), None);
    }

    fn publish_done(&self, run_id: Uuid, status: RunStatus, usage: Option<Usage>) {
        let mut payload = serde_json::json!({ "status": status });
        if let Some(usage) = usage {
            payload["usage"] = serde_json::to_value(usage).unwrap_or(serde_json::Value::Null);
        }
        self.inner.fabric.publish(run_id, EventKind::Done, payload);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Queries & stop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Idempotent cooperative stop. Terminal runs are a no-op.
    pub fn stop(&self, run_id: Uuid) -> Result<RunStatus> {
        let was_pending;
        let thread_id;
        {
            let mut runs = self.inner.runs.write();
            let handle = runs
                .get_mut(&run_id)
                .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
            if handle.run.status.is_terminal() {
                return Ok(handle.run.status);
            }
            was_pending = handle.run.status == RunStatus::Pending;
            handle.run.finish(RunStatus::Stopped);
            handle.cancel.cancel();
            thread_id = handle.run.thread_id;
        }

        self.mirror_status(run_id, RunStatus::Stopped, Some(thread_id), None);
        self.inner.fabric.publish(
            run_id,
            EventKind::Status,
            RunEvent::status_payload(RunStatus::Stopped, None),
        );
        if was_pending {
            // No worker exists to emit the closing event.
            self.finish_cancelled(run_id, None);
        }
        Ok(RunStatus::Stopped)
    }

    /// Status of a run, falling back to the KV registry for runs from a
    /// previous process. A stale alive claim downgrades to FAILED.
    pub fn status(&self, run_id: Uuid) -> Result<RunStatusView> {
        if let Some(handle) = self.inner.runs.read().get(&run_id) {
            return Ok(RunStatusView {
                run_id,
                thread_id: Some(handle.run.thread_id),
                status: handle.run.status,
                error: handle.run.error.clone(),
            });
        }

        let key = status_key(run_id);
        let raw = self
            .inner
            .kv
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        let record: serde_json::Value = serde_json::from_str(&raw)?;
        let status_str = record.get("status").and_then(|v| v.as_str()).unwrap_or("FAILED");
        let thread_id = record
            .get("thread_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        if status_str == "RUNNING" || status_str == "PENDING" {
            // The worker is gone; never report the run as alive.
            let error = "worker lost (process restart)";
            let mut swept = record.clone();
            swept["status"] = serde_json::json!("FAILED");
            swept["error"] = serde_json::json!(error);
            self.inner
                .kv
                .set(&key, swept.to_string(), Some(self.inner.config.runtime.status_ttl));
            return Ok(RunStatusView {
                run_id,
                thread_id,
                status: RunStatus::Failed,
                error: Some(error.into()),
            });
        }

        let status = serde_json::from_value(serde_json::json!(status_str)).unwrap_or(RunStatus::Failed);
        Ok(RunStatusView {
            run_id,
            thread_id,
            status,
            error: record.get("error").and_then(|v| v.as_str()).map(String::from),
        })
    }

    pub fn thread_for(&self, run_id: Uuid) -> Option<Uuid> {
        self.inner.runs.read().get(&run_id).map(|h| h.run.thread_id)
    }

    /// Recent runs, newest first, with an optional status filter.
    pub fn list(&self, status: Option<RunStatus>, limit: usize, offset: usize) -> (Vec<AgentRun>, usize) {
        let runs = self.inner.runs.read();
        let mut matching: Vec<AgentRun> = runs
            .values()
            .map(|h| h.run.clone())
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matching.len();
        let page = matching.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    /// Subscribe to a run's event stream. `NotFound` when the run has
    /// neither a live channel nor recorded history.
    pub fn subscribe(&self, run_id: Uuid) -> Result<Subscription> {
        if self.inner.runs.read().contains_key(&run_id) || self.inner.fabric.has_history(run_id) {
            return Ok(self.inner.fabric.subscribe(run_id));
        }
        Err(Error::NotFound(format!("run {run_id}")))
    }

    fn mirror_status(&self, run_id: Uuid, status: RunStatus, thread_id: Option<Uuid>, error: Option<&str>) {
        let mut record = serde_json::json!({ "status": status });
        if let Some(thread_id) = thread_id {
            record["thread_id"] = serde_json::json!(thread_id);
        }
        if let Some(error) = error {
            record["error"] = serde_json::json!(error);
        }
        self.inner
            .kv
            .set(&status_key(run_id), record.to_string(), Some(self.inner.config.runtime.status_ttl));
    }
}

fn status_key(run_id: Uuid) -> String {
    format!("run:{run_id}:status")
}
