//! Deterministic runtime for the four baseline tools. Every method returns a
//! structured `ToolResponse`; nothing here panics or propagates errors into
//! the orchestrator loop.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Command;

use super::access::AgentKind;
use super::ToolResponse;
use crate::core::platform::HEARTBEAT_READONLY_POLICY;

pub const DEFAULT_BASH_TIMEOUT_SEC: u64 = 60;
pub const MAX_BASH_TIMEOUT_SEC: u64 = 300;
/// Combined stdout+stderr cap, 64 KB.
pub const MAX_BASH_OUTPUT: usize = 64 * 1024;
const DEFAULT_READ_MAX_LINES: usize = 200;

/// Commands a worker with shell access may run. The Manager is not
/// restricted to this list.
const WORKER_SHELL_ALLOWLIST: &[&str] = &[
    "docker", "curl", "netstat", "ss", "grep", "cat", "ls", "pwd", "sed", "awk", "head", "tail",
];

/// Who is calling and under which execution policy. Heartbeat runs are
/// read-only; workers get the restricted shell.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub agent_kind: AgentKind,
    pub execution_policy: String,
    /// Worker shell permission from the worker profile; ignored for the
    /// Manager.
    pub shell_allowed: bool,
}

impl ExecContext {
    pub fn manager() -> Self {
        Self {
            agent_kind: AgentKind::Manager,
            execution_policy: String::new(),
            shell_allowed: true,
        }
    }

    pub fn worker(shell_allowed: bool) -> Self {
        Self {
            agent_kind: AgentKind::Worker,
            execution_policy: String::new(),
            shell_allowed,
        }
    }

    pub fn with_policy(mut self, policy: &str) -> Self {
        self.execution_policy = policy.to_string();
        self
    }

    fn readonly(&self) -> bool {
        self.execution_policy == HEARTBEAT_READONLY_POLICY
    }
}

pub struct PrimitiveRuntime {
    workspace_root: PathBuf,
    kernel_protected_roots: Vec<PathBuf>,
}

fn looks_sensitive(path: &str) -> bool {
    let lowered = path.to_lowercase();
    let name = lowered.rsplit('/').next().unwrap_or(&lowered);
    name == ".env"
        || name.starts_with(".env.")
        || lowered.contains("secret")
        || lowered.contains("password")
}

impl PrimitiveRuntime {
    pub fn new(workspace_root: impl Into<PathBuf>, protected: Vec<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            kernel_protected_roots: protected,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolResponse> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ToolResponse::err("invalid_args", "path is required"));
        }
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.workspace_root.join(raw)
        };
        // Normalize away `..` without requiring the file to exist.
        let mut normalized = PathBuf::new();
        for part in candidate.components() {
            match part {
                std::path::Component::ParentDir => {
                    normalized.pop();
                }
                std::path::Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.workspace_root) {
            return Err(ToolResponse::err(
                "path_denied",
                format!("path escapes the workspace: {}", normalized.display()),
            ));
        }
        Ok(normalized)
    }

    fn is_kernel_protected(&self, target: &Path) -> bool {
        self.kernel_protected_roots
            .iter()
            .any(|root| target.starts_with(root))
    }

    pub async fn read(
        &self,
        path: &str,
        start_line: Option<usize>,
        max_lines: Option<usize>,
    ) -> ToolResponse {
        let target = match self.resolve_path(path) {
            Ok(target) => target,
            Err(resp) => return resp,
        };
        if looks_sensitive(&target.to_string_lossy()) {
            return ToolResponse::err("path_denied", "sensitive file reads are not allowed");
        }

        let start_line = start_line.unwrap_or(1);
        let max_lines = max_lines.unwrap_or(DEFAULT_READ_MAX_LINES);
        if start_line < 1 || max_lines < 1 {
            return ToolResponse::err("invalid_args", "start_line and max_lines must be >= 1");
        }

        if !target.exists() {
            return ToolResponse::err("not_found", format!("path not found: {}", target.display()));
        }
        if target.is_dir() {
            return ToolResponse::err(
                "is_directory",
                format!("path is a directory: {}", target.display()),
            );
        }

        let bytes = match tokio::fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(e) => return ToolResponse::err("read_failed", e.to_string()),
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                return ToolResponse::err("decode_error", "file is not valid UTF-8");
            }
        };

        let lines: Vec<&str> = text.lines().collect();
        let total = lines.len();
        let start_idx = start_line - 1;
        let end_idx = (start_idx + max_lines).min(total);
        let selected: Vec<String> = lines
            .get(start_idx..end_idx)
            .unwrap_or(&[])
            .iter()
            .enumerate()
            .map(|(offset, line)| format!("{:>5}: {}", start_idx + offset + 1, line))
            .collect();

        ToolResponse::ok(
            json!({
                "path": target.to_string_lossy(),
                "start_line": start_idx + 1,
                "end_line": end_idx,
                "total_lines": total,
                "content": selected.join("\n"),
            }),
            format!("Read {} line(s) from {}", selected.len(), target.display()),
        )
    }

    pub async fn write(
        &self,
        ctx: &ExecContext,
        path: &str,
        content: &str,
        mode: &str,
        create_parents: bool,
    ) -> ToolResponse {
        if ctx.readonly() {
            return ToolResponse::err("policy_blocked", "read-only mode forbids write operations");
        }
        let target = match self.resolve_path(path) {
            Ok(target) => target,
            Err(resp) => return resp,
        };
        if self.is_kernel_protected(&target) {
            return ToolResponse::err(
                "policy_blocked",
                format!("kernel-protected path is read-only: {}", target.display()),
            );
        }

        let mode = mode.trim().to_lowercase();
        if !matches!(mode.as_str(), "create" | "overwrite" | "") {
            return ToolResponse::err("invalid_args", "mode must be 'create' or 'overwrite'");
        }
        if mode == "create" && target.exists() {
            return ToolResponse::err(
                "exists",
                format!("file already exists: {}", target.display()),
            );
        }

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                if create_parents {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return ToolResponse::err("write_failed", e.to_string());
                    }
                } else {
                    return ToolResponse::err(
                        "parent_missing",
                        format!("parent directory does not exist: {}", parent.display()),
                    );
                }
            }
        }

        // Atomic: temp file in the same directory, then rename over.
        let tmp_name = format!(
            "{}.tmp-write",
            target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string())
        );
        let tmp = target.with_file_name(tmp_name);
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            return ToolResponse::err("write_failed", e.to_string());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            return ToolResponse::err("write_failed", e.to_string());
        }

        ToolResponse::ok(
            json!({
                "path": target.to_string_lossy(),
                "bytes_written": content.len(),
            }),
            format!("Wrote {} byte(s) to {}", content.len(), target.display()),
        )
    }

    pub async fn edit(
        &self,
        ctx: &ExecContext,
        path: &str,
        edits: &[Value],
        dry_run: bool,
    ) -> ToolResponse {
        if ctx.readonly() {
            return ToolResponse::err("policy_blocked", "read-only mode forbids edit operations");
        }
        let target = match self.resolve_path(path) {
            Ok(target) => target,
            Err(resp) => return resp,
        };
        if self.is_kernel_protected(&target) {
            return ToolResponse::err(
                "policy_blocked",
                format!("kernel-protected path is read-only: {}", target.display()),
            );
        }
        if edits.is_empty() {
            return ToolResponse::err("invalid_args", "edits must be a non-empty list");
        }
        if !target.exists() {
            return ToolResponse::err("not_found", format!("path not found: {}", target.display()));
        }

        let original = match tokio::fs::read_to_string(&target).await {
            Ok(text) => text,
            Err(e) => return ToolResponse::err("read_failed", e.to_string()),
        };

        let mut updated = original.clone();
        let mut applied = Vec::new();
        for (idx, item) in edits.iter().enumerate() {
            let pattern = item.get("match").and_then(Value::as_str).unwrap_or("");
            let replace = item.get("replace").and_then(Value::as_str).unwrap_or("");
            let count = item.get("count").and_then(Value::as_u64);
            if pattern.is_empty() {
                return ToolResponse::err(
                    "invalid_args",
                    format!("edit at index {idx} requires a non-empty match"),
                );
            }

            let found = updated.matches(pattern).count();
            if found == 0 {
                return ToolResponse::err(
                    "match_not_found",
                    format!("edit at index {idx}: match not found"),
                );
            }
            let replaced = match count {
                None if found > 1 => {
                    return ToolResponse::err(
                        "ambiguous_match",
                        format!(
                            "edit at index {idx}: {found} matches; pass count to disambiguate"
                        ),
                    );
                }
                None => {
                    updated = updated.replacen(pattern, replace, 1);
                    1
                }
                Some(n) => {
                    let n = (n as usize).min(found);
                    updated = updated.replacen(pattern, replace, n);
                    n
                }
            };
            applied.push(json!({"index": idx, "matches_found": found, "replaced": replaced}));
        }

        let changed = updated != original;
        if changed && !dry_run {
            if let Err(e) = tokio::fs::write(&target, updated).await {
                return ToolResponse::err("write_failed", e.to_string());
            }
        }

        ToolResponse::ok(
            json!({
                "path": target.to_string_lossy(),
                "applied_edits": applied,
                "changed": changed,
                "dry_run": dry_run,
            }),
            format!(
                "Applied {} edit(s) to {}{}",
                edits.len(),
                target.display(),
                if dry_run { " (dry-run)" } else { "" }
            ),
        )
    }

    fn first_command_word(command: &str) -> String {
        command
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string()
    }

    fn worker_command_allowed(command: &str) -> bool {
        let first = Self::first_command_word(command);
        if first == "docker" {
            // `docker ...` and `docker compose ...` are both fine.
            return true;
        }
        WORKER_SHELL_ALLOWLIST.contains(&first.as_str())
    }

    pub async fn bash(
        &self,
        ctx: &ExecContext,
        command: &str,
        cwd: Option<&str>,
        timeout_sec: Option<u64>,
    ) -> ToolResponse {
        if command.trim().is_empty() {
            return ToolResponse::err("invalid_args", "command is required");
        }
        if ctx.readonly() {
            return ToolResponse::err("policy_blocked", "read-only mode forbids bash operations");
        }

        // Sensitive-file reads are denied for every profile, Manager included.
        let lowered = command.to_lowercase();
        if lowered.contains(".env") || lowered.contains("secret") || lowered.contains("password") {
            return ToolResponse::err(
                "path_denied",
                "command references sensitive files (.env/secret/password)",
            );
        }

        if ctx.agent_kind == AgentKind::Worker {
            if !ctx.shell_allowed {
                return ToolResponse::err(
                    "policy_blocked",
                    "this worker profile does not grant shell access",
                );
            }
            if !Self::worker_command_allowed(command) {
                return ToolResponse::err(
                    "policy_blocked",
                    format!(
                        "command `{}` is not in the worker shell allow-list",
                        Self::first_command_word(command)
                    ),
                );
            }
        }

        let workdir = match cwd {
            Some(cwd) => match self.resolve_path(cwd) {
                Ok(dir) => {
                    if !dir.is_dir() {
                        return ToolResponse::err(
                            "not_found",
                            format!("cwd does not exist: {}", dir.display()),
                        );
                    }
                    dir
                }
                Err(resp) => return resp,
            },
            None => self.workspace_root.clone(),
        };

        let timeout_sec = timeout_sec
            .unwrap_or(DEFAULT_BASH_TIMEOUT_SEC)
            .min(MAX_BASH_TIMEOUT_SEC)
            .max(1);

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return ToolResponse::err("exec_failed", e.to_string()),
        };

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_sec),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResponse::err("exec_failed", e.to_string()),
            Err(_) => {
                return ToolResponse::err(
                    "timeout",
                    format!("command timed out after {timeout_sec}s"),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout.to_string();
        if !stderr.trim().is_empty() {
            if combined.is_empty() {
                combined = format!("[stderr]\n{stderr}");
            } else {
                combined = format!("{combined}\n[stderr]\n{stderr}");
            }
        }
        if combined.len() > MAX_BASH_OUTPUT {
            combined.truncate(MAX_BASH_OUTPUT);
            combined.push_str("\n...[truncated]");
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let data = json!({
            "command": command,
            "cwd": workdir.to_string_lossy(),
            "exit_code": exit_code,
            "output": combined,
        });
        if exit_code != 0 {
            let mut resp = ToolResponse::err(
                "command_failed",
                format!("command exited with code {exit_code}"),
            );
            resp.data = Some(data);
            return resp;
        }
        ToolResponse::ok(data, format!("command exited with code {exit_code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> (PrimitiveRuntime, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (PrimitiveRuntime::new(tmp.path(), Vec::new()), tmp)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_with_line_numbers() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        let resp = rt.write(&ctx, "notes.txt", "alpha\nbeta\n", "create", false).await;
        assert!(resp.ok, "{resp:?}");

        let resp = rt.read("notes.txt", None, None).await;
        assert!(resp.ok);
        let content = resp.data.unwrap()["content"].as_str().unwrap().to_string();
        assert!(content.contains("1: alpha"));
        assert!(content.contains("2: beta"));
    }

    #[tokio::test]
    async fn create_mode_fails_on_existing_file() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        rt.write(&ctx, "x.txt", "one", "create", false).await;
        let resp = rt.write(&ctx, "x.txt", "two", "create", false).await;
        assert_eq!(resp.error_code.as_deref(), Some("exists"));
    }

    #[tokio::test]
    async fn path_escape_is_denied() {
        let (rt, _tmp) = runtime();
        let resp = rt.read("../../etc/passwd", None, None).await;
        assert_eq!(resp.error_code.as_deref(), Some("path_denied"));
    }

    #[tokio::test]
    async fn sensitive_reads_are_denied() {
        let (rt, _tmp) = runtime();
        let resp = rt.read(".env", None, None).await;
        assert_eq!(resp.error_code.as_deref(), Some("path_denied"));
    }

    #[tokio::test]
    async fn edit_requires_count_for_ambiguous_match() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        rt.write(&ctx, "f.txt", "aaa bbb aaa", "create", false).await;

        let resp = rt
            .edit(
                &ctx,
                "f.txt",
                &[json!({"match": "aaa", "replace": "ccc"})],
                false,
            )
            .await;
        assert_eq!(resp.error_code.as_deref(), Some("ambiguous_match"));

        let resp = rt
            .edit(
                &ctx,
                "f.txt",
                &[json!({"match": "aaa", "replace": "ccc", "count": 2})],
                false,
            )
            .await;
        assert!(resp.ok, "{resp:?}");
        let read = rt.read("f.txt", None, None).await;
        assert!(read.data.unwrap()["content"]
            .as_str()
            .unwrap()
            .contains("ccc bbb ccc"));
    }

    #[tokio::test]
    async fn edit_dry_run_leaves_file_untouched() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        rt.write(&ctx, "f.txt", "hello", "create", false).await;
        let resp = rt
            .edit(
                &ctx,
                "f.txt",
                &[json!({"match": "hello", "replace": "bye"})],
                true,
            )
            .await;
        assert!(resp.ok);
        let read = rt.read("f.txt", None, None).await;
        assert!(read.data.unwrap()["content"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn bash_runs_and_captures_output() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        let resp = rt.bash(&ctx, "echo hello", None, None).await;
        assert!(resp.ok);
        let data = resp.data.unwrap();
        assert_eq!(data["exit_code"], 0);
        assert!(data["output"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn bash_nonzero_exit_is_command_failed_with_data() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        let resp = rt.bash(&ctx, "exit 3", None, None).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_code.as_deref(), Some("command_failed"));
        assert_eq!(resp.data.unwrap()["exit_code"], 3);
    }

    #[tokio::test]
    async fn bash_denies_sensitive_file_access_even_for_manager() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        let resp = rt.bash(&ctx, "cat .env", None, None).await;
        assert_eq!(resp.error_code.as_deref(), Some("path_denied"));
    }

    #[tokio::test]
    async fn worker_shell_is_allowlisted() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::worker(true);
        assert!(rt.bash(&ctx, "ls", None, None).await.ok);
        let resp = rt.bash(&ctx, "rm -rf /tmp/x", None, None).await;
        assert_eq!(resp.error_code.as_deref(), Some("policy_blocked"));

        let no_shell = ExecContext::worker(false);
        let resp = rt.bash(&no_shell, "ls", None, None).await;
        assert_eq!(resp.error_code.as_deref(), Some("policy_blocked"));
    }

    #[tokio::test]
    async fn readonly_policy_blocks_mutations_but_not_reads() {
        let (rt, _tmp) = runtime();
        let manager = ExecContext::manager();
        rt.write(&manager, "f.txt", "data", "create", false).await;

        let ro = ExecContext::manager().with_policy(HEARTBEAT_READONLY_POLICY);
        assert!(rt.read("f.txt", None, None).await.ok);
        assert_eq!(
            rt.write(&ro, "f.txt", "x", "overwrite", false)
                .await
                .error_code
                .as_deref(),
            Some("policy_blocked")
        );
        assert_eq!(
            rt.bash(&ro, "echo hi", None, None).await.error_code.as_deref(),
            Some("policy_blocked")
        );
    }

    #[tokio::test]
    async fn kernel_protected_roots_are_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let protected = tmp.path().join("kernel");
        std::fs::create_dir_all(&protected).unwrap();
        std::fs::write(protected.join("core.rs"), "fn main() {}").unwrap();
        let rt = PrimitiveRuntime::new(tmp.path(), vec![protected.clone()]);
        let ctx = ExecContext::manager();

        let resp = rt
            .write(&ctx, "kernel/core.rs", "sabotage", "overwrite", false)
            .await;
        assert_eq!(resp.error_code.as_deref(), Some("policy_blocked"));
        assert!(rt.read("kernel/core.rs", None, None).await.ok);
    }

    #[tokio::test]
    async fn bash_timeout_kills_the_command() {
        let (rt, _tmp) = runtime();
        let ctx = ExecContext::manager();
        let resp = rt.bash(&ctx, "sleep 5", None, Some(1)).await;
        assert_eq!(resp.error_code.as_deref(), Some("timeout"));
    }
}
