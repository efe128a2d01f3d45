use std::path::PathBuf;

use anyhow::{Context, Result};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all file-backed state. Required in production; tests point
    /// this at a temp dir.
    pub data_dir: PathBuf,

    pub mcp_memory_enabled: bool,
    /// Max LLM turns per orchestrator run.
    pub max_turns: u32,
    /// Wall-clock cap for one task, seconds.
    pub task_timeout_sec: u64,
    /// When false the Manager answers every user_chat task itself and never
    /// dispatches to workers.
    pub dispatch_model_routing: bool,
    pub deployment_staging_path: Option<PathBuf>,

    // Worker backend commands (external CLIs are opaque; see DESIGN.md).
    pub worker_codex_command: String,
    pub worker_codex_args_template: String,
    pub worker_gemini_command: String,
    pub worker_gemini_args_template: String,
    pub worker_shell_command: String,
    pub worker_exec_timeout_sec: u64,
    pub worker_fallback_core_agent: bool,

    pub heartbeat_enabled: bool,
    pub heartbeat_tick_sec: u64,
    pub heartbeat_suppress_ok: bool,

    /// Comma-separated extra roots the primitives must never write to.
    pub kernel_protected_paths: Vec<PathBuf>,

    // LLM provider credentials.
    pub llm_api_base: String,
    pub llm_api_key: String,
    pub llm_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("DATA_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|d| d.join("xbot")))
            .context("DATA_DIR is not set and no platform data dir is available")?;

        let kernel_protected_paths = std::env::var("KERNEL_PROTECTED_PATHS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(Self {
            data_dir,
            mcp_memory_enabled: env_bool("MCP_MEMORY_ENABLED", false),
            max_turns: env_u64("MAX_TURNS", 12) as u32,
            task_timeout_sec: env_u64("TASK_TIMEOUT", 600),
            dispatch_model_routing: env_bool("DISPATCH_MODEL_ROUTING", true),
            deployment_staging_path: std::env::var("X_DEPLOYMENT_STAGING_PATH")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            worker_codex_command: env_string("WORKER_CODEX_COMMAND", "codex"),
            worker_codex_args_template: env_string("WORKER_CODEX_ARGS_TEMPLATE", "exec {instruction}"),
            worker_gemini_command: env_string("WORKER_GEMINI_CLI_COMMAND", "gemini-cli"),
            worker_gemini_args_template: env_string(
                "WORKER_GEMINI_ARGS_TEMPLATE",
                "--prompt {instruction}",
            ),
            worker_shell_command: env_string("WORKER_SHELL_COMMAND", "sh"),
            worker_exec_timeout_sec: env_u64("WORKER_EXEC_TIMEOUT_SEC", 900).max(30),
            worker_fallback_core_agent: env_bool("WORKER_FALLBACK_CORE_AGENT", true),
            heartbeat_enabled: env_bool("HEARTBEAT_ENABLED", true),
            heartbeat_tick_sec: env_u64("HEARTBEAT_TICK_SEC", 1).max(1),
            heartbeat_suppress_ok: env_bool("HEARTBEAT_SUPPRESS_OK", true),
            kernel_protected_paths,
            llm_api_base: env_string("LLM_API_BASE", "https://api.openai.com/v1"),
            llm_api_key: env_string("LLM_API_KEY", ""),
            llm_model: env_string("LLM_MODEL", "gpt-4.1-mini"),
        })
    }

    /// A config rooted at an explicit data dir, with defaults everywhere else.
    /// Used by tests and by CLI subcommands that don't touch the LLM.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mcp_memory_enabled: false,
            max_turns: 12,
            task_timeout_sec: 600,
            dispatch_model_routing: true,
            deployment_staging_path: None,
            worker_codex_command: "codex".into(),
            worker_codex_args_template: "exec {instruction}".into(),
            worker_gemini_command: "gemini-cli".into(),
            worker_gemini_args_template: "--prompt {instruction}".into(),
            worker_shell_command: "sh".into(),
            worker_exec_timeout_sec: 900,
            worker_fallback_core_agent: true,
            heartbeat_enabled: true,
            heartbeat_tick_sec: 1,
            heartbeat_suppress_ok: true,
            kernel_protected_paths: Vec::new(),
            llm_api_base: "https://api.openai.com/v1".into(),
            llm_api_key: String::new(),
            llm_model: "gpt-4.1-mini".into(),
        }
    }
}
