//! One loop, two roles. The orchestrator drives a bounded function-calling
//! loop per task: compose prompt, call the model, dispatch tool calls
//! through the access policy, and finish on terminal text. The Manager and
//! Worker contexts share this code path; only SOUL and tool profile differ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::core::config::Config;
use crate::core::inbox::{TaskInbox, TaskSource, TaskStatus};
use crate::core::llm::{ChatTurn, LlmClient, LlmReply, ToolDefinition};
use crate::core::memory::{is_memory_tool, MemoryClient};
use crate::core::platform::UnifiedContext;
use crate::core::prompt::{PromptComposer, SoulStore};
use crate::core::skills::{ExtensionExecutor, SkillLoader};
use crate::core::state::{ChatLog, StateStore};
use crate::core::tools::{
    dispatch_definitions, extension_definitions, memory_definitions, primitive_definitions,
    AgentKind, ExecContext, PrimitiveRuntime, ToolAccessStore, ToolResponse,
};
use crate::core::worker::{CoreAgentBackend, ProgressEvent, WorkerRecord, WorkerRuntime};

/// Consecutive identical (name, args, result) triples that trip the breaker.
const CIRCUIT_BREAKER_RUN: u32 = 3;
/// Char budget for the history window, roughly model limit minus prompt and
/// tool schemas.
const HISTORY_CHAR_BUDGET: usize = 24_000;
/// Global cap on concurrently running tasks.
const MAX_CONCURRENT_TASKS: usize = 32;

const RETRY_BACKOFF_MS: &[u64] = &[200, 1000, 5000];

pub struct Orchestrator {
    config: Config,
    llm: Arc<dyn LlmClient>,
    store: Arc<StateStore>,
    chat: Arc<ChatLog>,
    inbox: Arc<TaskInbox>,
    access: Arc<ToolAccessStore>,
    skills: Arc<Mutex<SkillLoader>>,
    extensions: Arc<ExtensionExecutor>,
    workers: Arc<WorkerRuntime>,
    souls: Arc<SoulStore>,
    memory: Option<Arc<dyn MemoryClient>>,
    session_locks: std::sync::Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    cancel_flags: std::sync::Mutex<HashMap<String, Arc<AtomicBool>>>,
    concurrency: Arc<Semaphore>,
}

struct LoopOutcome {
    final_text: String,
    turns: u32,
    tool_calls: u32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        store: Arc<StateStore>,
        chat: Arc<ChatLog>,
        inbox: Arc<TaskInbox>,
        access: Arc<ToolAccessStore>,
        skills: Arc<Mutex<SkillLoader>>,
        extensions: Arc<ExtensionExecutor>,
        workers: Arc<WorkerRuntime>,
        souls: Arc<SoulStore>,
        memory: Option<Arc<dyn MemoryClient>>,
    ) -> Self {
        Self {
            config,
            llm,
            store,
            chat,
            inbox,
            access,
            skills,
            extensions,
            workers,
            souls,
            memory,
            session_locks: std::sync::Mutex::new(HashMap::new()),
            cancel_flags: std::sync::Mutex::new(HashMap::new()),
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
        }
    }

    pub fn inbox(&self) -> &Arc<TaskInbox> {
        &self.inbox
    }

    pub fn workers(&self) -> &Arc<WorkerRuntime> {
        &self.workers
    }

    fn session_lock(&self, user_id: &str, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry((user_id.to_string(), session_id.to_string()))
            .or_default()
            .clone()
    }

    fn cancel_flag(&self, task_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().unwrap_or_else(|e| e.into_inner());
        flags.entry(task_id.to_string()).or_default().clone()
    }

    fn drop_cancel_flag(&self, task_id: &str) {
        let mut flags = self.cancel_flags.lock().unwrap_or_else(|e| e.into_inner());
        flags.remove(task_id);
    }

    /// Request cancellation of a running task. Takes effect at the next
    /// tool-call boundary.
    pub fn request_cancel(&self, task_id: &str) {
        self.cancel_flag(task_id).store(true, Ordering::SeqCst);
    }

    fn manager_tools(&self, source: TaskSource) -> Vec<ToolDefinition> {
        let mut tools = primitive_definitions();
        tools.extend(extension_definitions());
        let routing_allowed =
            self.config.dispatch_model_routing || !matches!(source, TaskSource::UserChat);
        if routing_allowed {
            tools.extend(dispatch_definitions());
        }
        if self.config.mcp_memory_enabled && self.memory.is_some() {
            tools.extend(memory_definitions());
        }
        tools
            .into_iter()
            .filter(|t| {
                self.access
                    .is_tool_allowed(AgentKind::Manager, None, &t.name)
                    .is_ok()
            })
            .collect()
    }

    fn worker_tools(&self, worker_id: &str) -> Vec<ToolDefinition> {
        let mut tools = primitive_definitions();
        tools.extend(extension_definitions());
        tools
            .into_iter()
            .filter(|t| {
                self.access
                    .is_tool_allowed(AgentKind::Worker, Some(worker_id), &t.name)
                    .is_ok()
            })
            .collect()
    }

    /// Entry point: run one inbox task to completion, serialized per
    /// (user, session). Returns the user-visible final output.
    pub async fn handle_task(&self, ctx: &UnifiedContext, task_id: &str) -> Result<String> {
        let _permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("task scheduler is shutting down"))?;

        let task = self
            .inbox
            .get(task_id)
            .await
            .ok_or_else(|| anyhow!("task not found: {task_id}"))?;

        let lock = self.session_lock(&task.user_id, &ctx.session_id);
        let _session = lock.lock().await;

        if task.status == TaskStatus::Pending {
            self.inbox.update_status(task_id, TaskStatus::Running).await?;
        }

        let cancel = self.cancel_flag(task_id);
        let result = self.run_manager(ctx, task_id, &task.goal, task.source, &cancel).await;
        self.drop_cancel_flag(task_id);

        match result {
            Ok(outcome) => {
                info!(
                    "Task {} completed in {} turn(s), {} tool call(s)",
                    task_id, outcome.turns, outcome.tool_calls
                );
                let mut result_map = Map::new();
                result_map.insert("turns".into(), json!(outcome.turns));
                result_map.insert("tool_calls".into(), json!(outcome.tool_calls));
                self.inbox
                    .complete(task_id, result_map, &outcome.final_text)
                    .await?;
                if task.requires_reply && !outcome.final_text.is_empty() {
                    if let Err(e) = ctx.reply(&outcome.final_text, None).await {
                        warn!("reply delivery failed for task {}: {}", task_id, e);
                    }
                }
                Ok(outcome.final_text)
            }
            Err(e) => {
                error!("Task {} failed: {:#}", task_id, e);
                if e.to_string().starts_with("task_cancelled") {
                    self.inbox.cancel(task_id).await.ok();
                } else {
                    self.inbox.fail(task_id, &e.to_string()).await.ok();
                }
                if task.requires_reply {
                    let visible = format!("Task failed: {e}");
                    ctx.reply(&visible, None).await.ok();
                }
                Err(e)
            }
        }
    }

    async fn run_manager(
        &self,
        ctx: &UnifiedContext,
        task_id: &str,
        goal: &str,
        source: TaskSource,
        cancel: &AtomicBool,
    ) -> Result<LoopOutcome> {
        let soul = self.souls.manager_soul().await;
        let tools = self.manager_tools(source);
        let memory_allowed = self.config.mcp_memory_enabled && self.memory.is_some();
        let prompt = PromptComposer::compose(
            AgentKind::Manager,
            &soul,
            &tools,
            memory_allowed,
            match source {
                TaskSource::Heartbeat => "heartbeat",
                TaskSource::Cron => "cron",
                _ => "chat",
            },
        );

        let mut history = self.history_window(ctx, goal).await;
        self.chat
            .save_message(ctx.user_id(), &ctx.session_id, "user", goal)
            .await
            .ok();

        let primitives = PrimitiveRuntime::new(
            self.store.data_dir(),
            self.config.kernel_protected_paths.clone(),
        );
        let exec = ExecContext::manager().with_policy(&ctx.execution_policy);

        let outcome = self
            .run_loop(
                ctx,
                task_id,
                AgentKind::Manager,
                None,
                &prompt,
                &tools,
                &primitives,
                &exec,
                &mut history,
                cancel,
            )
            .await?;

        self.chat
            .save_message(ctx.user_id(), &ctx.session_id, "model", &outcome.final_text)
            .await
            .ok();
        Ok(outcome)
    }

    /// Bounded turn loop shared by both roles.
    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        ctx: &UnifiedContext,
        task_id: &str,
        kind: AgentKind,
        worker: Option<&WorkerRecord>,
        prompt: &str,
        tools: &[ToolDefinition],
        primitives: &PrimitiveRuntime,
        exec: &ExecContext,
        history: &mut Vec<ChatTurn>,
        cancel: &AtomicBool,
    ) -> Result<LoopOutcome> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.task_timeout_sec);
        let mut tool_calls = 0u32;
        let mut last_signature = String::new();
        let mut identical_run = 0u32;

        for turn in 1..=self.config.max_turns {
            if cancel.load(Ordering::SeqCst) {
                bail!("task_cancelled: cancelled by user");
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "task_timeout: wall clock exceeded {}s",
                    self.config.task_timeout_sec
                );
            }

            let reply = self.generate_with_retry(prompt, history, tools).await?;

            match reply {
                LlmReply::Text(text) => {
                    return Ok(LoopOutcome {
                        final_text: text.trim().to_string(),
                        turns: turn,
                        tool_calls,
                    });
                }
                LlmReply::FunctionCall { name, args } => {
                    tool_calls += 1;
                    info!("Turn {}: {:?} invokes tool `{}`", turn, kind, name);
                    history.push(ChatTurn::model_call(&name, args.clone()));

                    let worker_id = worker.map(|w| w.worker_id.as_str());
                    let response = match self.access.is_tool_allowed(kind, worker_id, &name) {
                        Err(reason) => {
                            warn!("Tool `{}` rejected for {:?}: {}", name, kind, reason);
                            ToolResponse::unauthorized(reason)
                        }
                        Ok(()) => {
                            self.dispatch_tool(ctx, task_id, kind, worker, primitives, exec, &name, &args)
                                .await
                        }
                    };

                    let observation = response.to_value();
                    let signature = format!("{name}\u{1}{args}\u{1}{observation}");
                    if signature == last_signature {
                        identical_run += 1;
                    } else {
                        identical_run = 1;
                        last_signature = signature;
                    }
                    history.push(ChatTurn::tool_response(&name, observation));

                    if identical_run >= CIRCUIT_BREAKER_RUN {
                        self.inbox.bump_retry(task_id, "loop_detected").await.ok();
                        bail!(
                            "loop_detected: tool `{}` repeated {} identical calls",
                            name,
                            identical_run
                        );
                    }
                }
            }
        }

        bail!(
            "turn_budget_exhausted: no terminal reply within {} turns",
            self.config.max_turns
        )
    }

    /// LLM transport failures retry with 200 ms / 1 s / 5 s backoff before
    /// surfacing as task failure.
    async fn generate_with_retry(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply> {
        let mut last_err = None;
        for (attempt, backoff_ms) in std::iter::once(&0u64)
            .chain(RETRY_BACKOFF_MS.iter())
            .enumerate()
        {
            if *backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
            }
            match self.llm.generate(prompt, history, tools).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!("LLM call failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("llm_unavailable")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        &self,
        ctx: &UnifiedContext,
        task_id: &str,
        kind: AgentKind,
        worker: Option<&WorkerRecord>,
        primitives: &PrimitiveRuntime,
        exec: &ExecContext,
        name: &str,
        args: &Value,
    ) -> ToolResponse {
        match name {
            "read" => {
                let path = args.get("path").and_then(Value::as_str).unwrap_or("");
                let start = args.get("start_line").and_then(Value::as_u64).map(|v| v as usize);
                let max = args.get("max_lines").and_then(Value::as_u64).map(|v| v as usize);
                primitives.read(path, start, max).await
            }
            "write" => {
                let path = args.get("path").and_then(Value::as_str).unwrap_or("");
                let content = args.get("content").and_then(Value::as_str).unwrap_or("");
                let mode = args.get("mode").and_then(Value::as_str).unwrap_or("overwrite");
                let create_parents = args
                    .get("create_parents")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                primitives.write(exec, path, content, mode, create_parents).await
            }
            "edit" => {
                let path = args.get("path").and_then(Value::as_str).unwrap_or("");
                let edits = args
                    .get("edits")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
                primitives.edit(exec, path, &edits, dry_run).await
            }
            "bash" => {
                let command = args.get("command").and_then(Value::as_str).unwrap_or("");
                let cwd = args.get("cwd").and_then(Value::as_str);
                let timeout = args.get("timeout_sec").and_then(Value::as_u64);
                primitives.bash(exec, command, cwd, timeout).await
            }
            "list_extensions" => {
                let mut skills = self.skills.lock().await;
                skills.reload_if_changed();
                ToolResponse::ok(json!({"catalog": skills.catalog()}), "listed extensions")
            }
            "run_extension" => {
                let skill_name = args.get("skill_name").and_then(Value::as_str).unwrap_or("");
                let skill_args = args
                    .get("args")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let descriptor = {
                    let mut skills = self.skills.lock().await;
                    skills.reload_if_changed();
                    skills.get(skill_name).cloned()
                };
                match descriptor {
                    None => ToolResponse::err(
                        "skill_not_found",
                        format!("skill not found: {skill_name}"),
                    ),
                    Some(descriptor) => {
                        let result = self
                            .extensions
                            .execute(&descriptor, ctx.user_id(), &skill_args)
                            .await;
                        // Emitted files may be auto-delivered by the adapter.
                        let send_files = result
                            .ui
                            .as_ref()
                            .and_then(|ui| ui.get("send_files"))
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if result.ok && send_files {
                            for file in &result.files {
                                if let Err(e) = ctx.reply_document(&file.path, None).await {
                                    warn!("file delivery failed: {e}");
                                }
                            }
                        }
                        result.to_tool_response()
                    }
                }
            }
            "list_workers" => {
                let workers = self.workers.registry().list_workers().await;
                let rows: Vec<Value> = workers
                    .iter()
                    .map(|w| {
                        json!({
                            "worker_id": w.worker_id,
                            "name": w.name,
                            "backend": w.backend.as_str(),
                            "status": w.status,
                            "capabilities": w.capabilities,
                            "summary": w.summary,
                        })
                    })
                    .collect();
                ToolResponse::ok(json!({"workers": rows}), format!("{} worker(s)", rows.len()))
            }
            "dispatch_worker" => {
                if kind != AgentKind::Manager {
                    return ToolResponse::unauthorized("workers never re-dispatch");
                }
                let worker_id = args.get("worker_id").and_then(Value::as_str).unwrap_or("");
                let instruction = args.get("instruction").and_then(Value::as_str).unwrap_or("");
                if worker_id.is_empty() || instruction.is_empty() {
                    return ToolResponse::err(
                        "invalid_input",
                        "dispatch_worker requires worker_id and instruction",
                    );
                }
                let metadata = args
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.inbox
                    .assign_worker(task_id, worker_id, "manager_dispatch")
                    .await
                    .ok();

                let (tx, rx) = mpsc::channel::<ProgressEvent>(32);
                let relay = self.spawn_progress_relay(ctx.clone(), rx).await;
                let outcome = self
                    .workers
                    .execute_task(
                        worker_id,
                        "manager_dispatch",
                        instruction,
                        None,
                        metadata,
                        Some(tx),
                        Some(self),
                    )
                    .await;
                relay.abort();
                outcome.to_tool_response()
            }
            name if is_memory_tool(name) => match &self.memory {
                Some(memory) => match memory.call_tool(name, args).await {
                    Ok(result) => ToolResponse::ok(result, format!("memory `{name}` ok")),
                    Err(e) => ToolResponse::err("mcp_unavailable", e.to_string()),
                },
                None => ToolResponse::err("mcp_unavailable", "memory service is not configured"),
            },
            _ => ToolResponse::err("unknown_tool", format!("unknown tool: {name}")),
        }
    }

    /// Surface worker progress through one edited status message.
    async fn spawn_progress_relay(
        &self,
        ctx: UnifiedContext,
        mut rx: mpsc::Receiver<ProgressEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut message_id: Option<String> = None;
            while let Some(event) = rx.recv().await {
                let text = format!("[worker {}] {}", event.worker_id, event.text);
                match &message_id {
                    None => {
                        if let Ok(id) = ctx.reply(&text, None).await {
                            message_id = Some(id);
                        }
                    }
                    Some(id) => {
                        ctx.edit_message(id, &text, None).await.ok();
                    }
                }
            }
        })
    }

    /// Recent transcript plus the new goal, trimmed to the char budget from
    /// the oldest end.
    async fn history_window(&self, ctx: &UnifiedContext, goal: &str) -> Vec<ChatTurn> {
        let mut turns = Vec::new();
        for entry in self
            .chat
            .session_messages(ctx.user_id(), &ctx.session_id, 60)
            .await
        {
            let turn = if entry.role == "model" {
                ChatTurn::model_text(&entry.content)
            } else {
                ChatTurn::user_text(&entry.content)
            };
            turns.push(turn);
        }
        turns.push(ChatTurn::user_text(goal));

        let mut total: usize = turns.iter().map(ChatTurn::char_len).sum();
        while total > HISTORY_CHAR_BUDGET && turns.len() > 1 {
            let removed = turns.remove(0);
            total -= removed.char_len();
        }
        turns
    }
}

#[async_trait]
impl CoreAgentBackend for Orchestrator {
    /// The `core-agent` worker backend: the same loop under the Worker SOUL
    /// and the worker tool profile, rooted in the worker workspace.
    async fn run_worker_task(&self, worker: &WorkerRecord, instruction: &str) -> Result<String> {
        let soul = self.souls.worker_soul(&worker.soul_path()).await;
        let tools = self.worker_tools(&worker.worker_id);
        let prompt = PromptComposer::compose(AgentKind::Worker, &soul, &tools, false, "task");

        let primitives = PrimitiveRuntime::new(
            &worker.workspace_path,
            self.config.kernel_protected_paths.clone(),
        );
        let exec = ExecContext::worker(worker.shell_allowed);
        let mut history = vec![ChatTurn::user_text(instruction)];
        let cancel = AtomicBool::new(false);

        let ctx = crate::core::platform::UnifiedContext::new(
            crate::core::platform::UnifiedMessage::text_message(
                "worker_runtime",
                &format!("worker::{}", worker.worker_id),
                &worker.worker_id,
                instruction,
            ),
            &format!("worker-{}", worker.worker_id),
            Arc::new(crate::core::platform::SilentAdapter),
        );

        let outcome = self
            .run_loop(
                &ctx,
                &format!("worker-task-{}", worker.worker_id),
                AgentKind::Worker,
                Some(worker),
                &prompt,
                &tools,
                &primitives,
                &exec,
                &mut history,
                &cancel,
            )
            .await?;
        Ok(outcome.final_text)
    }
}
