//! System prompt composition: base policy, role section, SOUL, tool
//! inventory and memory guidance layered into one bounded string.

use std::path::PathBuf;
use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::core::llm::ToolDefinition;
use crate::core::state::StateStore;
use crate::core::tools::AgentKind;

/// Composer output cap, bytes.
const MAX_PROMPT_BYTES: usize = 2048;
const MAX_TOOL_LINES: usize = 40;
const MAX_TOOL_DESC_CHARS: usize = 88;

const BASE_POLICY: &str = "\
You are the agentic core of a multi-platform assistant. Decide, then act: \
answer directly when you can, call a tool when you need effects or facts, \
and finish with one concise user-facing reply. Never invent tool names, \
never repeat a failing call unchanged, and report failures plainly.";

const MANAGER_ROLE: &str = "\
[Role]\n\
You are the Core Manager, the only voice the user hears. Understand the \
request, dispatch a worker when execution is better delegated, then \
paraphrase the structured result back to the user.";

const WORKER_ROLE: &str = "\
[Role]\n\
You are a Worker. Complete the dispatched task, report a structured \
result to the Manager, and never talk to the end user or re-dispatch.";

const MEMORY_GUIDE: &str = "\
[Memory]\n\
Before answering questions about the user's identity, preferences or \
history, consult the memory tools; store durable new facts when learned.";

pub const DEFAULT_MANAGER_SOUL: &str = "\
Name: Core Manager\n\
Curious, concise, governs the fleet. Prefers one good answer over three \
hedges, and delegates real execution to named workers.";

pub const DEFAULT_WORKER_SOUL: &str = "\
Name: Worker\n\
Execution-focused. Accept the dispatch, do the work inside the assigned \
workspace, report a structured result, never re-dispatch.";

/// Role/personality files. The Manager SOUL is a canonical state file under
/// `kernel/core-manager/SOUL.MD` (so edits get backup-on-write); worker
/// SOULs are plain markdown inside each worker workspace.
pub struct SoulStore {
    store: Arc<StateStore>,
}

impl SoulStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    fn manager_soul_path(&self) -> PathBuf {
        self.store
            .data_dir()
            .join("kernel")
            .join("core-manager")
            .join("SOUL.MD")
    }

    /// Seed the Manager SOUL on first boot.
    pub async fn ensure_seeded(&self) {
        let path = self.manager_soul_path();
        if path.exists() {
            return;
        }
        let mut payload = Mapping::new();
        payload.insert("role".into(), Value::String("core-manager".into()));
        payload.insert(
            "content".into(),
            Value::String(DEFAULT_MANAGER_SOUL.to_string()),
        );
        if let Err(e) = self.store.write_state(&path, &payload).await {
            warn!("could not seed manager SOUL: {e}");
        }
    }

    pub async fn manager_soul(&self) -> String {
        self.soul_from(&self.manager_soul_path(), DEFAULT_MANAGER_SOUL).await
    }

    /// Worker SOULs live in the worker workspace; raw markdown is accepted.
    pub async fn worker_soul(&self, soul_path: &std::path::Path) -> String {
        self.soul_from(soul_path, DEFAULT_WORKER_SOUL).await
    }

    async fn soul_from(&self, path: &std::path::Path, default: &str) -> String {
        if let Ok((payload, _)) = self.store.read_state(path).await {
            if let Some(content) = payload.get("content").and_then(Value::as_str) {
                if !content.trim().is_empty() {
                    return content.trim().to_string();
                }
            }
        }
        match tokio::fs::read_to_string(path).await {
            Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
            _ => default.to_string(),
        }
    }

    /// Rewrite the Manager SOUL content; the state store backs up any
    /// unparseable predecessor.
    pub async fn set_manager_soul(&self, content: &str) -> anyhow::Result<()> {
        let mut payload = Mapping::new();
        payload.insert("role".into(), Value::String("core-manager".into()));
        payload.insert("content".into(), Value::String(content.trim().to_string()));
        self.store
            .write_state(&self.manager_soul_path(), &payload)
            .await?;
        Ok(())
    }
}

fn short_desc(text: &str) -> String {
    let first = text.lines().next().unwrap_or("").trim();
    if first.len() <= MAX_TOOL_DESC_CHARS {
        first.to_string()
    } else {
        let mut cut: String = first.chars().take(MAX_TOOL_DESC_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

pub struct PromptComposer;

impl PromptComposer {
    /// Layer base policy, role, SOUL, tool inventory, memory guide and mode
    /// marker. Output stays under 2 KB.
    pub fn compose(
        kind: AgentKind,
        soul: &str,
        tools: &[ToolDefinition],
        memory_allowed: bool,
        mode: &str,
    ) -> String {
        let mut parts: Vec<String> = vec![BASE_POLICY.to_string()];
        parts.push(match kind {
            AgentKind::Manager => MANAGER_ROLE.to_string(),
            AgentKind::Worker => WORKER_ROLE.to_string(),
        });
        if !soul.trim().is_empty() {
            parts.push(format!("[SOUL]\n{}", soul.trim()));
        }

        let mut lines = Vec::new();
        for tool in tools.iter().take(MAX_TOOL_LINES) {
            let desc = short_desc(&tool.description);
            if desc.is_empty() {
                lines.push(format!("- `{}`", tool.name));
            } else {
                lines.push(format!("- `{}`: {}", tool.name, desc));
            }
        }
        if lines.is_empty() {
            parts.push("[Tools]\n- (none)".to_string());
        } else {
            parts.push(format!("[Tools]\n{}", lines.join("\n")));
        }

        if memory_allowed && kind == AgentKind::Manager {
            parts.push(MEMORY_GUIDE.to_string());
        }
        parts.push(format!("[Mode] {}", mode.trim().to_lowercase()));

        let mut prompt = parts.join("\n\n");
        if prompt.len() > MAX_PROMPT_BYTES {
            let mut cut = MAX_PROMPT_BYTES;
            while !prompt.is_char_boundary(cut) {
                cut -= 1;
            }
            prompt.truncate(cut);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, desc: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: desc.into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn manager_prompt_layers_in_order() {
        let prompt = PromptComposer::compose(
            AgentKind::Manager,
            "Name: Core Manager",
            &[tool("read", "Read a file"), tool("bash", "Run a command")],
            true,
            "chat",
        );
        let base = prompt.find("agentic core").unwrap();
        let role = prompt.find("[Role]").unwrap();
        let soul = prompt.find("[SOUL]").unwrap();
        let tools = prompt.find("[Tools]").unwrap();
        let memory = prompt.find("[Memory]").unwrap();
        let mode = prompt.find("[Mode] chat").unwrap();
        assert!(base < role && role < soul && soul < tools && tools < memory && memory < mode);
    }

    #[test]
    fn worker_prompt_never_includes_memory_guide() {
        let prompt = PromptComposer::compose(AgentKind::Worker, "", &[], true, "task");
        assert!(prompt.contains("never talk to the end user"));
        assert!(!prompt.contains("[Memory]"));
    }

    #[test]
    fn prompt_is_capped_at_two_kilobytes() {
        let tools: Vec<ToolDefinition> = (0..60)
            .map(|i| tool(&format!("tool_{i}"), &"very long description ".repeat(20)))
            .collect();
        let prompt = PromptComposer::compose(AgentKind::Manager, "soul", &tools, true, "chat");
        assert!(prompt.len() <= 2048);
    }

    #[tokio::test]
    async fn soul_store_seeds_and_resolves_manager_soul() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(tmp.path()));
        let souls = SoulStore::new(store.clone());
        souls.ensure_seeded().await;
        let soul = souls.manager_soul().await;
        assert!(soul.contains("governs the fleet"));

        souls.set_manager_soul("Name: Vega\nCalm and precise.").await.unwrap();
        let soul = souls.manager_soul().await;
        assert!(soul.contains("Vega"));
    }

    #[tokio::test]
    async fn worker_soul_accepts_plain_markdown() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(tmp.path()));
        let souls = SoulStore::new(store);
        let path = tmp.path().join("SOUL.MD");
        std::fs::write(&path, "Name: Atlas\n\nShip it.").unwrap();
        let soul = souls.worker_soul(&path).await;
        assert!(soul.contains("Atlas"));

        let missing = souls.worker_soul(&tmp.path().join("nope.md")).await;
        assert_eq!(missing, DEFAULT_WORKER_SOUL);
    }
}
