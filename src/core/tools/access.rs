//! Tool access policy: which caller profile may invoke which tool. Policies
//! are checked before the executor runs anything; a rejected call surfaces as
//! `unauthorized` without side effects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{MEMORY_TOOLS, PRIMITIVE_TOOLS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Manager,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ToolLists {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Policy {
    #[serde(default)]
    tools: ToolLists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessPayload {
    version: u32,
    core_manager: Policy,
    worker_default: Policy,
    #[serde(default)]
    workers: HashMap<String, Policy>,
}

impl Default for AccessPayload {
    fn default() -> Self {
        Self {
            version: 1,
            core_manager: Policy {
                tools: ToolLists {
                    allow: vec!["group:all".into()],
                    deny: vec![],
                },
            },
            worker_default: Policy {
                tools: ToolLists {
                    allow: vec!["group:all".into()],
                    deny: vec!["group:management".into(), "group:memory".into()],
                },
            },
            workers: HashMap::new(),
        }
    }
}

/// Group a tool name belongs to for policy matching.
fn tool_group(name: &str) -> &'static str {
    if PRIMITIVE_TOOLS.contains(&name) {
        "group:primitives"
    } else if MEMORY_TOOLS.contains(&name) {
        "group:memory"
    } else if matches!(name, "list_workers" | "dispatch_worker") {
        "group:management"
    } else if matches!(name, "run_extension" | "list_extensions") {
        "group:skills"
    } else {
        "group:other"
    }
}

fn entry_matches(entry: &str, tool: &str, group: &str) -> bool {
    let entry = entry.trim().to_lowercase();
    entry == "group:all" || entry == "*" || entry == tool || entry == group
}

pub struct ToolAccessStore {
    path: PathBuf,
    payload: Mutex<AccessPayload>,
}

impl ToolAccessStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Self {
        let path = data_dir.into().join("kernel").join("tool_access.json");
        let payload = Self::read(&path);
        let store = Self {
            path,
            payload: Mutex::new(payload),
        };
        store.persist();
        store
    }

    fn read(path: &PathBuf) -> AccessPayload {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("tool_access.json unreadable ({e}), using defaults");
                AccessPayload::default()
            }),
            Err(_) => AccessPayload::default(),
        }
    }

    fn persist(&self) {
        let payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("cannot create kernel dir: {e}");
                return;
            }
        }
        match serde_json::to_string_pretty(&*payload) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw + "\n") {
                    warn!("tool_access.json write failed: {e}");
                }
            }
            Err(e) => warn!("tool_access.json serialize failed: {e}"),
        }
    }

    /// Seed a per-worker policy from the worker default if absent.
    pub fn ensure_worker_policy(&self, worker_id: &str) {
        let mut changed = false;
        {
            let mut payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
            if !payload.workers.contains_key(worker_id) {
                let default = payload.worker_default.clone();
                payload.workers.insert(worker_id.to_string(), default);
                changed = true;
            }
        }
        if changed {
            self.persist();
        }
    }

    pub fn reset_worker_policy(&self, worker_id: &str) {
        let removed = {
            let mut payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
            payload.workers.remove(worker_id).is_some()
        };
        if removed {
            self.persist();
        }
    }

    /// Check whether `tool` is allowed for a caller. Deny entries win over
    /// allow entries. Returns the blocking entry as the reason on rejection.
    pub fn is_tool_allowed(
        &self,
        kind: AgentKind,
        worker_id: Option<&str>,
        tool: &str,
    ) -> Result<(), String> {
        let payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        let policy = match kind {
            AgentKind::Manager => &payload.core_manager,
            AgentKind::Worker => worker_id
                .and_then(|id| payload.workers.get(id))
                .unwrap_or(&payload.worker_default),
        };
        let group = tool_group(tool);

        if let Some(hit) = policy
            .tools
            .deny
            .iter()
            .find(|entry| entry_matches(entry, tool, group))
        {
            return Err(format!("denied by policy entry `{}`", hit.trim()));
        }
        if policy
            .tools
            .allow
            .iter()
            .any(|entry| entry_matches(entry, tool, group))
        {
            return Ok(());
        }
        Err(format!("tool `{tool}` is not in the allow list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ToolAccessStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (ToolAccessStore::open(tmp.path()), tmp)
    }

    #[test]
    fn manager_profile_allows_everything() {
        let (store, _tmp) = store();
        for tool in ["read", "bash", "dispatch_worker", "run_extension", "read_graph"] {
            assert!(store.is_tool_allowed(AgentKind::Manager, None, tool).is_ok());
        }
    }

    #[test]
    fn worker_profile_denies_management_and_memory() {
        let (store, _tmp) = store();
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("worker-main"), "dispatch_worker")
            .is_err());
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("worker-main"), "list_workers")
            .is_err());
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("worker-main"), "read_graph")
            .is_err());
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("worker-main"), "bash")
            .is_ok());
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("worker-main"), "run_extension")
            .is_ok());
    }

    #[test]
    fn policy_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = ToolAccessStore::open(tmp.path());
            store.ensure_worker_policy("builder");
        }
        let store = ToolAccessStore::open(tmp.path());
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("builder"), "dispatch_worker")
            .is_err());
        assert!(tmp.path().join("kernel/tool_access.json").exists());
    }

    #[test]
    fn reset_removes_worker_policy() {
        let (store, _tmp) = store();
        store.ensure_worker_policy("w1");
        store.reset_worker_policy("w1");
        // Falls back to worker_default, which still denies management.
        assert!(store
            .is_tool_allowed(AgentKind::Worker, Some("w1"), "list_workers")
            .is_err());
    }
}
