//! Deterministic, isolated skill execution. Entry points run as `/bin/sh`
//! subprocesses in a per-user extension workspace; exceptions and timeouts
//! surface as `ok:false` observations and never crash the orchestrator.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::schema::validate_args;
use super::SkillDescriptor;
use crate::core::skills::{FilesystemScope, NetworkScope};
use crate::core::tools::ToolResponse;

/// Output caps: 1 MB of text, 10 files of at most 10 MB each.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const MAX_EMITTED_FILES: usize = 10;
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedFile {
    pub path: PathBuf,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct ExtensionResult {
    pub ok: bool,
    pub skill_name: String,
    pub result: String,
    pub ui: Option<Value>,
    pub files: Vec<EmittedFile>,
    pub error_code: String,
    pub message: String,
}

impl ExtensionResult {
    fn failure(skill_name: &str, error_code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            skill_name: skill_name.to_string(),
            result: String::new(),
            ui: None,
            files: Vec::new(),
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_tool_response(&self) -> ToolResponse {
        let files: Vec<Value> = self
            .files
            .iter()
            .map(|f| json!({"path": f.path.to_string_lossy(), "mime": f.mime}))
            .collect();
        if self.ok {
            ToolResponse::ok(
                json!({
                    "skill_name": self.skill_name,
                    "result": self.result,
                    "ui": self.ui,
                    "files": files,
                }),
                if self.result.is_empty() {
                    format!("Extension {} executed", self.skill_name)
                } else {
                    self.result.chars().take(200).collect::<String>()
                },
            )
        } else {
            ToolResponse::err(self.error_code.clone(), self.message.clone())
        }
    }
}

fn guess_mime(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" | "md" => "text/plain",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// bwrap exists AND can actually create a sandbox here (user namespaces are
/// often unavailable inside containers). Probed once per process.
fn has_bwrap() -> bool {
    use std::sync::OnceLock;
    static USABLE: OnceLock<bool> = OnceLock::new();
    *USABLE.get_or_init(|| {
        std::process::Command::new("bwrap")
            .args([
                "--ro-bind", "/usr", "/usr", "--ro-bind", "/bin", "/bin", "--ro-bind-try", "/lib",
                "/lib", "--ro-bind-try", "/lib64", "/lib64", "--unshare-all", "--die-with-parent",
                "--", "/bin/true",
            ])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

pub struct ExtensionExecutor {
    data_dir: PathBuf,
}

impl ExtensionExecutor {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn ext_workspace(&self, user_id: &str, skill_name: &str) -> PathBuf {
        self.data_dir
            .join("users")
            .join(user_id.trim())
            .join("ext")
            .join(skill_name)
    }

    /// Wrap the entrypoint with bwrap when available: skill dir read-only,
    /// extension workspace writable, network only when declared.
    fn build_command(
        &self,
        skill: &SkillDescriptor,
        script: &Path,
        workspace: &Path,
    ) -> Command {
        if cfg!(target_os = "linux") && has_bwrap() {
            info!(
                "Sandboxing skill [{}] with bwrap (workspace: {})",
                skill.name,
                workspace.display()
            );
            let mut cmd = Command::new("bwrap");
            cmd.args([
                "--ro-bind", "/usr", "/usr",
                "--ro-bind", "/bin", "/bin",
                "--ro-bind-try", "/etc", "/etc",
                "--ro-bind-try", "/lib", "/lib",
                "--ro-bind-try", "/lib64", "/lib64",
            ]);
            let skill_dir = skill.skill_dir.to_string_lossy().to_string();
            cmd.args(["--ro-bind", &skill_dir, &skill_dir]);
            if skill.permissions.filesystem == FilesystemScope::Workspace {
                let ws = workspace.to_string_lossy().to_string();
                cmd.args(["--bind", &ws, &ws]);
            }
            cmd.args(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]);
            cmd.arg("--unshare-all");
            if skill.permissions.network == NetworkScope::Limited {
                cmd.arg("--share-net");
            }
            cmd.args(["--die-with-parent", "--", "/bin/sh"]);
            cmd.arg(script);
            return cmd;
        }

        warn!(
            "No OS-level sandbox available for skill [{}]; relying on environment restrictions",
            skill.name
        );
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(script);
        cmd
    }

    pub async fn execute(
        &self,
        skill: &SkillDescriptor,
        user_id: &str,
        args: &Map<String, Value>,
    ) -> ExtensionResult {
        let merged = match validate_args(args, &skill.input_schema) {
            Ok(merged) => merged,
            Err(message) => return ExtensionResult::failure(&skill.name, "schema", message),
        };

        let script = skill.skill_dir.join(&skill.entrypoint);
        if !script.exists() {
            return ExtensionResult::failure(
                &skill.name,
                "entrypoint_missing",
                format!("entrypoint not found: {}", script.display()),
            );
        }

        let workspace = self.ext_workspace(user_id, &skill.name);
        let out_dir = workspace.join("out");
        if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
            return ExtensionResult::failure(&skill.name, "exec_failure", e.to_string());
        }

        let mut cmd = self.build_command(skill, &script, &workspace);
        cmd.env_clear();
        cmd.current_dir(&workspace);
        cmd.env("HOME", &workspace);
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        cmd.env("SKILL_DIR", &skill.skill_dir);
        cmd.env("EXT_WORKSPACE", &workspace);
        cmd.env("EXT_OUT_DIR", &out_dir);
        cmd.env(
            "EXT_NETWORK",
            match skill.permissions.network {
                NetworkScope::Limited => "limited",
                NetworkScope::None => "none",
            },
        );
        cmd.env("XBOT_ARGS_MODE", "stdin");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExtensionResult::failure(&skill.name, "exec_failure", e.to_string()),
        };

        let payload = json!({"args": merged, "user_id": user_id}).to_string();
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
        }

        let timeout = Duration::from_secs(skill.effective_timeout_sec());
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ExtensionResult::failure(&skill.name, "exec_failure", e.to_string()),
            Err(_) => {
                warn!(
                    "Extension execution timeout: skill={} timeout={}s",
                    skill.name,
                    timeout.as_secs()
                );
                return ExtensionResult::failure(
                    &skill.name,
                    "timeout",
                    format!(
                        "extension '{}' timed out after {}s",
                        skill.name,
                        timeout.as_secs()
                    ),
                );
            }
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if stdout.len() > MAX_OUTPUT_BYTES {
            stdout.truncate(MAX_OUTPUT_BYTES);
            stdout.push_str("\n...[truncated]");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ExtensionResult::failure(
                &skill.name,
                "exec_failure",
                format!(
                    "skill exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.chars().take(500).collect::<String>()
                ),
            );
        }

        self.normalize(skill, &out_dir, stdout).await
    }

    /// The entry point may print plain text, or a final JSON object line
    /// `{ok?, text?, ui?, files?}`; emitted file paths resolve inside the
    /// extension out dir and are capped in count and size.
    async fn normalize(
        &self,
        skill: &SkillDescriptor,
        out_dir: &Path,
        stdout: String,
    ) -> ExtensionResult {
        let structured = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .filter(|value| {
                value.is_object()
                    && (value.get("ok").is_some()
                        || value.get("text").is_some()
                        || value.get("ui").is_some()
                        || value.get("files").is_some())
            });

        let Some(structured) = structured else {
            return ExtensionResult {
                ok: true,
                skill_name: skill.name.clone(),
                result: stdout.trim().to_string(),
                ui: None,
                files: Vec::new(),
                error_code: String::new(),
                message: String::new(),
            };
        };

        let ok = structured.get("ok").and_then(Value::as_bool).unwrap_or(true);
        let text = structured
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ui = structured.get("ui").filter(|v| v.is_object()).cloned();

        let mut files = Vec::new();
        if let Some(names) = structured.get("files").and_then(Value::as_array) {
            for name in names.iter().filter_map(Value::as_str) {
                if files.len() >= MAX_EMITTED_FILES {
                    warn!(
                        "Skill {} emitted more than {} files; extras dropped",
                        skill.name, MAX_EMITTED_FILES
                    );
                    break;
                }
                if name.contains("..") || name.starts_with('/') {
                    warn!("Skill {} emitted an invalid file path: {}", skill.name, name);
                    continue;
                }
                let path = out_dir.join(name);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() && meta.len() <= MAX_FILE_BYTES => {
                        files.push(EmittedFile {
                            mime: guess_mime(&path),
                            path,
                        });
                    }
                    Ok(_) => warn!(
                        "Skill {} file rejected (missing or oversized): {}",
                        skill.name, name
                    ),
                    Err(_) => warn!("Skill {} declared a missing file: {}", skill.name, name),
                }
            }
        }

        if ok {
            ExtensionResult {
                ok: true,
                skill_name: skill.name.clone(),
                result: text,
                ui,
                files,
                error_code: String::new(),
                message: String::new(),
            }
        } else {
            ExtensionResult {
                ok: false,
                skill_name: skill.name.clone(),
                result: text.clone(),
                ui,
                files,
                error_code: "skill_failed".to_string(),
                message: if text.is_empty() {
                    "skill reported failure".to_string()
                } else {
                    text
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skills::{write_test_skill, SkillLoader};

    async fn run_skill(script: &str, args: Value) -> ExtensionResult {
        let tmp = tempfile::tempdir().unwrap();
        let skills_root = tmp.path().join("skills");
        write_test_skill(&skills_root, "builtin", "probe", script);
        let loader = SkillLoader::new(&skills_root);
        let skill = loader.get("probe").unwrap();
        let executor = ExtensionExecutor::new(tmp.path());
        executor
            .execute(skill, "1", args.as_object().unwrap())
            .await
    }

    #[tokio::test]
    async fn plain_text_stdout_becomes_the_result() {
        let result = run_skill("echo plain output\n", json!({})).await;
        assert!(result.ok, "{result:?}");
        assert_eq!(result.result, "plain output");
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn structured_json_line_is_parsed() {
        let result = run_skill(
            "echo '{\"ok\": true, \"text\": \"done\", \"ui\": {\"send_files\": true}}'\n",
            json!({}),
        )
        .await;
        assert!(result.ok);
        assert_eq!(result.result, "done");
        assert!(result.ui.is_some());
    }

    #[tokio::test]
    async fn emitted_files_are_collected_from_out_dir() {
        let result = run_skill(
            "echo artifact > \"$EXT_OUT_DIR/report.txt\"\n\
             echo '{\"ok\": true, \"text\": \"saved\", \"files\": [\"report.txt\"]}'\n",
            json!({}),
        )
        .await;
        assert!(result.ok, "{result:?}");
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].mime, "text/plain");
        assert!(result.files[0].path.ends_with("report.txt"));
    }

    #[tokio::test]
    async fn declared_but_missing_files_are_dropped() {
        let result = run_skill(
            "echo '{\"ok\": true, \"files\": [\"ghost.png\", \"../escape.txt\"]}'\n",
            json!({}),
        )
        .await;
        assert!(result.ok);
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn schema_violation_short_circuits_without_running() {
        let result = run_skill("echo should-not-run\n", json!({"url": 5})).await;
        assert!(!result.ok);
        assert_eq!(result.error_code, "schema");
    }

    #[tokio::test]
    async fn nonzero_exit_is_exec_failure() {
        let result = run_skill("echo boom >&2; exit 2\n", json!({})).await;
        assert!(!result.ok);
        assert_eq!(result.error_code, "exec_failure");
        assert!(result.message.contains("boom"));
    }

    #[tokio::test]
    async fn skill_reported_failure_is_surfaced() {
        let result = run_skill(
            "echo '{\"ok\": false, \"text\": \"no such video\"}'\n",
            json!({}),
        )
        .await;
        assert!(!result.ok);
        assert_eq!(result.error_code, "skill_failed");
        assert_eq!(result.message, "no such video");
    }
}
