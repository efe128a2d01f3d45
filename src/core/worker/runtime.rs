//! Worker task execution: a dispatched instruction runs under one of four
//! backends (nested core-agent loop, external codex / gemini-cli processes,
//! or the shell fast path) inside the worker's isolated workspace, with
//! stdout relayed as progress while the task runs.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, SecondsFormat};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::tasks::{WorkerTaskStore, WorkerTaskUpdate};
use super::{WorkerBackend, WorkerRecord, WorkerRegistry, WorkerStatus};
use crate::core::config::Config;
use crate::core::tools::ToolResponse;

/// Cadence of "still running" pulses while a backend produces no output.
const PROGRESS_PULSE_SEC: u64 = 10;

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Single-line commands that clearly look like shell invocations. User-
/// sourced dispatches matching this skip the agent loop entirely.
const SHELL_COMMAND_HINTS: &[&str] = &[
    "echo", "ls", "pwd", "cat", "head", "tail", "grep", "rg", "find", "git", "docker", "uv",
    "python", "python3", "pip", "npm", "pnpm", "yarn", "bash", "sh", "zsh", "curl", "wget", "make",
    "pytest", "cargo",
];

pub fn looks_like_shell_command(text: &str) -> bool {
    let raw = text.trim();
    if raw.is_empty() || raw.contains('\n') {
        return false;
    }
    let first = raw.split_whitespace().next().unwrap_or("");
    SHELL_COMMAND_HINTS.contains(&first)
        || first.starts_with("./")
        || first.starts_with("../")
        || first.starts_with('/')
}

/// Progress emitted while a worker task runs; the orchestrator may surface
/// these through an intermediate message edit.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub task_id: String,
    pub worker_id: String,
    pub text: String,
}

/// Seam for the `core-agent` backend: the orchestrator implements this by
/// running its nested worker loop. Kept as a trait so the worker runtime
/// stays free of a direct dependency on the loop it is called from.
#[async_trait]
pub trait CoreAgentBackend: Send + Sync {
    async fn run_worker_task(&self, worker: &WorkerRecord, instruction: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub ok: bool,
    pub task_id: String,
    pub backend: WorkerBackend,
    pub summary: String,
    pub result: String,
    pub error: String,
}

impl DispatchOutcome {
    pub fn to_tool_response(&self) -> ToolResponse {
        if self.ok {
            ToolResponse::ok(
                json!({
                    "task_id": self.task_id,
                    "backend": self.backend.as_str(),
                    "summary": self.summary,
                    "result": self.result,
                }),
                self.summary.clone(),
            )
        } else {
            ToolResponse::err(
                if self.error.is_empty() {
                    "exec_failure".to_string()
                } else {
                    self.error.clone()
                },
                self.summary.clone(),
            )
        }
    }
}

struct RunOutput {
    ok: bool,
    exit_code: i32,
    output: String,
    error: String,
}

pub struct WorkerRuntime {
    config: Config,
    registry: Arc<WorkerRegistry>,
    tasks: Arc<WorkerTaskStore>,
}

impl WorkerRuntime {
    pub fn new(config: Config, registry: Arc<WorkerRegistry>, tasks: Arc<WorkerTaskStore>) -> Self {
        Self {
            config,
            registry,
            tasks,
        }
    }

    pub fn task_store(&self) -> &Arc<WorkerTaskStore> {
        &self.tasks
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn backend_command(&self, backend: WorkerBackend, instruction: &str) -> (String, Vec<String>) {
        match backend {
            WorkerBackend::Shell => (
                self.config.worker_shell_command.clone(),
                vec!["-lc".to_string(), instruction.to_string()],
            ),
            WorkerBackend::GeminiCli => (
                self.config.worker_gemini_command.clone(),
                substitute_template(&self.config.worker_gemini_args_template, instruction),
            ),
            _ => (
                self.config.worker_codex_command.clone(),
                substitute_template(&self.config.worker_codex_args_template, instruction),
            ),
        }
    }

    fn command_available(command: &str) -> bool {
        if command.contains('/') {
            return Path::new(command).exists();
        }
        std::process::Command::new("which")
            .arg(command)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run an external process in the worker workspace, pumping stdout into
    /// the progress relay and pulsing at least every ten seconds.
    async fn run_streaming(
        &self,
        command: &str,
        args: &[String],
        workspace: &Path,
        timeout_sec: u64,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
        task_id: &str,
        worker_id: &str,
    ) -> RunOutput {
        tokio::fs::create_dir_all(workspace).await.ok();
        let child = Command::new(command)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return RunOutput {
                    ok: false,
                    exit_code: -1,
                    output: String::new(),
                    error: format!("prepare_failed: {e}"),
                }
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_sec);
        let mut pulse = tokio::time::interval(Duration::from_secs(PROGRESS_PULSE_SEC));
        pulse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pulse.tick().await; // first tick is immediate

        let mut out_buf = String::new();
        let mut lines = stdout.map(|s| BufReader::new(s).lines());
        let mut stdout_done = lines.is_none();

        // Phase 1: pump stdout until EOF, pulsing progress, honoring the
        // deadline. The child is only touched after the reader is done, so
        // the borrows stay disjoint.
        while !stdout_done {
            tokio::select! {
                line = async {
                    match lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                } => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(tx) = progress {
                                let _ = tx.try_send(ProgressEvent {
                                    task_id: task_id.to_string(),
                                    worker_id: worker_id.to_string(),
                                    text: line.clone(),
                                });
                            }
                            out_buf.push_str(&line);
                            out_buf.push('\n');
                        }
                        _ => stdout_done = true,
                    }
                }
                _ = pulse.tick() => {
                    if let Some(tx) = progress {
                        let _ = tx.try_send(ProgressEvent {
                            task_id: task_id.to_string(),
                            worker_id: worker_id.to_string(),
                            text: "still running".to_string(),
                        });
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return RunOutput {
                        ok: false,
                        exit_code: -1,
                        output: out_buf,
                        error: format!("timeout: worker task exceeded {timeout_sec}s"),
                    };
                }
            }
        }

        // Phase 2: stdout is closed; reap the child within the same deadline.
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                return RunOutput {
                    ok: false,
                    exit_code: -1,
                    output: out_buf,
                    error: format!("timeout: worker task exceeded {timeout_sec}s"),
                };
            }
        };

        let mut err_buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut err_buf).await;
        }

        match status {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                if !err_buf.trim().is_empty() {
                    out_buf = if out_buf.is_empty() {
                        format!("[stderr]\n{err_buf}")
                    } else {
                        format!("{out_buf}\n[stderr]\n{err_buf}")
                    };
                }
                RunOutput {
                    ok: exit_code == 0,
                    exit_code,
                    output: out_buf.trim().to_string(),
                    error: if exit_code == 0 {
                        String::new()
                    } else {
                        format!("exit_code={exit_code}")
                    },
                }
            }
            Err(e) => RunOutput {
                ok: false,
                exit_code: -1,
                output: out_buf,
                error: format!("wait_failed: {e}"),
            },
        }
    }

    async fn finalize(
        &self,
        worker_id: &str,
        task_id: &str,
        ok: bool,
        result: &str,
        summary: &str,
        error: &str,
        retry_count: u32,
    ) {
        let update = WorkerTaskUpdate {
            status: Some(if ok { "done".into() } else { "failed".into() }),
            result: Some(result.to_string()),
            result_summary: Some(summary.chars().take(500).collect()),
            error: Some(error.to_string()),
            ended_at: Some(now_iso()),
            retry_count: Some(retry_count),
            ..Default::default()
        };
        if let Err(e) = self.tasks.update_task(task_id, update).await {
            warn!("worker task log update failed: {e}");
        }
        if let Err(e) = self
            .registry
            .set_status(worker_id, WorkerStatus::Idle, Some(task_id), Some(error))
            .await
        {
            warn!("worker status update failed: {e}");
        }
    }

    /// Execute one dispatched instruction to completion.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_task(
        &self,
        worker_id: &str,
        source: &str,
        instruction: &str,
        backend_override: Option<WorkerBackend>,
        metadata: Map<String, Value>,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        core_agent: Option<&dyn CoreAgentBackend>,
    ) -> DispatchOutcome {
        let worker = match self.registry.get_worker(worker_id).await {
            Some(worker) => worker,
            None => {
                return DispatchOutcome {
                    ok: false,
                    task_id: String::new(),
                    backend: WorkerBackend::CoreAgent,
                    summary: format!("worker not found: {worker_id}"),
                    result: String::new(),
                    error: "worker_not_found".to_string(),
                }
            }
        };
        if matches!(worker.status, WorkerStatus::Busy | WorkerStatus::Offline) {
            return DispatchOutcome {
                ok: false,
                task_id: String::new(),
                backend: worker.backend,
                summary: format!("worker {} is {:?}", worker.worker_id, worker.status),
                result: String::new(),
                error: "worker_unavailable".to_string(),
            };
        }

        let task = match self
            .tasks
            .create_task(&worker.worker_id, source, instruction, metadata)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                return DispatchOutcome {
                    ok: false,
                    task_id: String::new(),
                    backend: worker.backend,
                    summary: format!("task log append failed: {e}"),
                    result: String::new(),
                    error: "io_error".to_string(),
                }
            }
        };
        let task_id = task.task_id.clone();

        if let Err(e) = self
            .tasks
            .update_task(
                &task_id,
                WorkerTaskUpdate {
                    status: Some("running".into()),
                    started_at: Some(now_iso()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!("worker task log update failed: {e}");
        }
        if let Err(e) = self
            .registry
            .set_status(&worker.worker_id, WorkerStatus::Busy, Some(&task_id), Some(""))
            .await
        {
            warn!("worker status update failed: {e}");
        }

        let mut backend = backend_override.unwrap_or(worker.backend);
        // User-sourced one-liners that read as shell commands take the fast
        // path regardless of the configured agent backend.
        if backend != WorkerBackend::Shell
            && matches!(source, "user_chat" | "user_cmd")
            && looks_like_shell_command(instruction)
        {
            backend = WorkerBackend::Shell;
        }
        info!(
            "Worker dispatch: worker={} backend={} task={}",
            worker.worker_id,
            backend.as_str(),
            task_id
        );

        if backend == WorkerBackend::CoreAgent {
            return self
                .run_core_agent(&worker, &task_id, instruction, core_agent, 0)
                .await;
        }

        let (command, args) = self.backend_command(backend, instruction);
        if !Self::command_available(&command) {
            if self.config.worker_fallback_core_agent
                && matches!(backend, WorkerBackend::Codex | WorkerBackend::GeminiCli)
                && core_agent.is_some()
            {
                info!(
                    "CLI `{}` unavailable; falling back to core-agent for task {}",
                    command, task_id
                );
                return self
                    .run_core_agent(&worker, &task_id, instruction, core_agent, 1)
                    .await;
            }
            let msg = format!("CLI not found: {command}. Authorize/install this backend first.");
            self.finalize(&worker.worker_id, &task_id, false, "", &msg, "prepare_failed", 0)
                .await;
            return DispatchOutcome {
                ok: false,
                task_id,
                backend,
                summary: msg,
                result: String::new(),
                error: "prepare_failed".to_string(),
            };
        }

        let run = self
            .run_streaming(
                &command,
                &args,
                &worker.workspace_path,
                self.config.worker_exec_timeout_sec,
                progress.as_ref(),
                &task_id,
                &worker.worker_id,
            )
            .await;

        if run.error.starts_with("timeout") {
            self.finalize(&worker.worker_id, &task_id, false, &run.output, &run.error, "timeout", 0)
                .await;
            return DispatchOutcome {
                ok: false,
                task_id,
                backend,
                summary: run.error.clone(),
                result: run.output,
                error: "timeout".to_string(),
            };
        }

        let summary = if run.output.is_empty() {
            format!("{} exited with code {}", backend.as_str(), run.exit_code)
        } else {
            run.output.chars().take(500).collect()
        };
        self.finalize(
            &worker.worker_id,
            &task_id,
            run.ok,
            &run.output,
            &summary,
            &run.error,
            0,
        )
        .await;
        DispatchOutcome {
            ok: run.ok,
            task_id,
            backend,
            summary,
            result: run.output,
            error: run.error,
        }
    }

    async fn run_core_agent(
        &self,
        worker: &WorkerRecord,
        task_id: &str,
        instruction: &str,
        core_agent: Option<&dyn CoreAgentBackend>,
        retry_count: u32,
    ) -> DispatchOutcome {
        let Some(agent) = core_agent else {
            let msg = "core-agent backend is not wired into this runtime".to_string();
            self.finalize(
                &worker.worker_id,
                task_id,
                false,
                "",
                &msg,
                "core_agent_unavailable",
                retry_count,
            )
            .await;
            return DispatchOutcome {
                ok: false,
                task_id: task_id.to_string(),
                backend: WorkerBackend::CoreAgent,
                summary: msg,
                result: String::new(),
                error: "core_agent_unavailable".to_string(),
            };
        };

        match agent.run_worker_task(worker, instruction).await {
            Ok(result) => {
                let result = if result.trim().is_empty() {
                    "Worker core-agent finished with no text output.".to_string()
                } else {
                    result
                };
                let summary: String = result.chars().take(500).collect();
                self.finalize(
                    &worker.worker_id,
                    task_id,
                    true,
                    &result,
                    &summary,
                    "",
                    retry_count,
                )
                .await;
                DispatchOutcome {
                    ok: true,
                    task_id: task_id.to_string(),
                    backend: WorkerBackend::CoreAgent,
                    summary,
                    result,
                    error: String::new(),
                }
            }
            Err(e) => {
                let msg = format!("core-agent execution failed: {e}");
                self.finalize(
                    &worker.worker_id,
                    task_id,
                    false,
                    "",
                    &msg,
                    "core_agent_failed",
                    retry_count,
                )
                .await;
                DispatchOutcome {
                    ok: false,
                    task_id: task_id.to_string(),
                    backend: WorkerBackend::CoreAgent,
                    summary: msg,
                    result: String::new(),
                    error: "core_agent_failed".to_string(),
                }
            }
        }
    }

    fn auth_command(&self, backend: WorkerBackend, action: &str) -> (String, Vec<String>) {
        let command = match backend {
            WorkerBackend::GeminiCli => self.config.worker_gemini_command.clone(),
            _ => self.config.worker_codex_command.clone(),
        };
        let args = vec!["auth".to_string(), action.to_string()];
        (command, args)
    }

    /// Interactive auth cannot run headless; hand the operator the exact
    /// command to run in the worker workspace.
    pub async fn build_auth_start_command(
        &self,
        worker_id: &str,
        backend: WorkerBackend,
    ) -> ToolResponse {
        let Some(worker) = self.registry.get_worker(worker_id).await else {
            return ToolResponse::err("worker_not_found", format!("worker not found: {worker_id}"));
        };
        let (command, args) = self.auth_command(backend, "login");
        let manual = format!(
            "cd {} && {} {}",
            worker.workspace_path.display(),
            command,
            args.join(" ")
        );
        ToolResponse::ok(
            json!({
                "worker_id": worker.worker_id,
                "backend": backend.as_str(),
                "command": manual,
            }),
            "Run this command manually to complete interactive auth login.",
        )
    }

    pub async fn check_auth_status(
        &self,
        worker_id: &str,
        backend: WorkerBackend,
    ) -> ToolResponse {
        let Some(worker) = self.registry.get_worker(worker_id).await else {
            return ToolResponse::err("worker_not_found", format!("worker not found: {worker_id}"));
        };
        let (command, args) = self.auth_command(backend, "status");
        if !Self::command_available(&command) {
            return ToolResponse::err("prepare_failed", format!("CLI not found: {command}"));
        }
        let run = self
            .run_streaming(
                &command,
                &args,
                &worker.workspace_path,
                45,
                None,
                "auth-status",
                &worker.worker_id,
            )
            .await;
        let lowered = run.output.to_lowercase();
        let not_authed = ["not logged", "unauth", "login required"]
            .iter()
            .any(|t| lowered.contains(t));
        let authed = !not_authed
            && ["logged in", "authenticated", "authorized"]
                .iter()
                .any(|t| lowered.contains(t));
        ToolResponse::ok(
            json!({
                "worker_id": worker.worker_id,
                "backend": backend.as_str(),
                "authenticated": authed,
                "status": if authed {
                    "authenticated"
                } else if not_authed {
                    "not_authenticated"
                } else {
                    "unknown"
                },
                "output": run.output.chars().take(500).collect::<String>(),
            }),
            "auth status checked",
        )
    }
}

/// Replace `{instruction}` in a whitespace-separated args template. The
/// instruction lands as a single argv element, so no shell quoting applies.
fn substitute_template(template: &str, instruction: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            if token == "{instruction}" {
                instruction.to_string()
            } else {
                token.replace("{instruction}", instruction)
            }
        })
        .collect()
}
