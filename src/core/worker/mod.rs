mod runtime;
mod tasks;

pub use runtime::{
    looks_like_shell_command, CoreAgentBackend, DispatchOutcome, ProgressEvent, WorkerRuntime,
};
pub use tasks::{WorkerTaskEvent, WorkerTaskRecord, WorkerTaskStore, WorkerTaskUpdate};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{Local, SecondsFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn slugify(value: &str, fallback: &str) -> String {
    let re = Regex::new(r"[^a-z0-9_\-]+").expect("static slug regex must compile");
    let slug = re
        .replace_all(&value.trim().to_lowercase(), "-")
        .trim_matches('-')
        .to_string();
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

impl WorkerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "busy" => WorkerStatus::Busy,
            "error" => WorkerStatus::Error,
            "offline" => WorkerStatus::Offline,
            // `ready` is what older registries wrote for an available slot.
            _ => WorkerStatus::Idle,
        }
    }
}

impl<'de> Deserialize<'de> for WorkerStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(WorkerStatus::parse(&String::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerBackend {
    #[default]
    CoreAgent,
    Codex,
    GeminiCli,
    Shell,
}

impl WorkerBackend {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "shell" | "bash" | "sh" => WorkerBackend::Shell,
            "codex" | "openai-codex" => WorkerBackend::Codex,
            "gemini" | "gemini-cli" | "gemini_cli" => WorkerBackend::GeminiCli,
            _ => WorkerBackend::CoreAgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerBackend::CoreAgent => "core-agent",
            WorkerBackend::Codex => "codex",
            WorkerBackend::GeminiCli => "gemini-cli",
            WorkerBackend::Shell => "shell",
        }
    }
}

impl<'de> Deserialize<'de> for WorkerBackend {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(WorkerBackend::parse(&String::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub name: String,
    #[serde(default)]
    pub backend: WorkerBackend,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub summary: String,
    pub workspace_path: PathBuf,
    pub credentials_path: PathBuf,
    #[serde(default)]
    pub shell_allowed: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_task_id: String,
    #[serde(default)]
    pub last_error: String,
}

impl WorkerRecord {
    pub fn soul_path(&self) -> PathBuf {
        self.workspace_path.join("SOUL.MD")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RegistryPayload {
    version: u32,
    updated_at: String,
    #[serde(default)]
    workers: BTreeMap<String, WorkerRecord>,
}

/// A `Name:` line near the top of a worker's SOUL.MD overrides a generic
/// display name.
fn name_from_worker_soul(workspace: &Path) -> Option<String> {
    let soul = workspace.join("SOUL.MD");
    let text = std::fs::read_to_string(soul).ok()?;
    let re = Regex::new(r"(?i)^\s*(?:[-*]\s*)?Name\s*:\s*(.+?)\s*$")
        .expect("static soul-name regex must compile");
    for line in text.lines().take(120) {
        if let Some(caps) = re.captures(line) {
            let name = caps
                .get(1)
                .map(|m| m.as_str().trim_matches(['`', '*']).trim().to_string())
                .unwrap_or_default();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Persistent worker registry backed by `DATA_DIR/WORKERS.json`.
pub struct WorkerRegistry {
    data_dir: PathBuf,
    meta_path: PathBuf,
    lock: Mutex<()>,
}

impl WorkerRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            meta_path: data_dir.join("WORKERS.json"),
            data_dir,
            lock: Mutex::new(()),
        }
    }

    fn workers_root(&self) -> PathBuf {
        self.data_dir.join("userland").join("workers")
    }

    fn read_unlocked(&self) -> RegistryPayload {
        let mut payload = match std::fs::read_to_string(&self.meta_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => RegistryPayload::default(),
        };
        payload.version = 1;
        for (id, record) in payload.workers.iter_mut() {
            record.worker_id = id.clone();
            if let Some(soul_name) = name_from_worker_soul(&record.workspace_path) {
                let generic = record.name.is_empty()
                    || record.name == *id
                    || matches!(
                        record.name.to_lowercase().as_str(),
                        "main worker" | "worker" | "default worker"
                    );
                if generic {
                    record.name = soul_name;
                }
            }
        }
        payload
    }

    fn write_unlocked(&self, mut payload: RegistryPayload) -> Result<()> {
        payload.updated_at = now_iso();
        if let Some(parent) = self.meta_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&payload)?;
        std::fs::write(&self.meta_path, raw + "\n")?;
        Ok(())
    }

    fn build_record(&self, worker_id: &str, name: &str, backend: WorkerBackend) -> WorkerRecord {
        let now = now_iso();
        let safe_id = slugify(worker_id, "worker");
        WorkerRecord {
            name: if name.trim().is_empty() {
                safe_id.clone()
            } else {
                name.trim().to_string()
            },
            backend,
            status: WorkerStatus::Idle,
            capabilities: Vec::new(),
            summary: String::new(),
            workspace_path: self.workers_root().join(&safe_id),
            credentials_path: self
                .data_dir
                .join("credentials")
                .join("workers")
                .join(&safe_id),
            shell_allowed: true,
            created_at: now.clone(),
            updated_at: now,
            last_task_id: String::new(),
            last_error: String::new(),
            worker_id: safe_id,
        }
    }

    fn ensure_dirs(record: &WorkerRecord) -> Result<()> {
        std::fs::create_dir_all(&record.workspace_path)?;
        std::fs::create_dir_all(&record.credentials_path)?;
        Ok(())
    }

    pub async fn ensure_default_worker(&self) -> Result<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut payload = self.read_unlocked();
        if let Some(existing) = payload.workers.get("worker-main") {
            return Ok(existing.clone());
        }
        let record = self.build_record("worker-main", "Main Worker", WorkerBackend::CoreAgent);
        Self::ensure_dirs(&record)?;
        payload.workers.insert(record.worker_id.clone(), record.clone());
        self.write_unlocked(payload)?;
        info!("Created default worker: worker-main");
        Ok(record)
    }

    pub async fn create_worker(
        &self,
        name: &str,
        backend: WorkerBackend,
    ) -> Result<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut payload = self.read_unlocked();
        let base = slugify(name, "worker");
        let mut final_id = base.clone();
        let mut suffix = 1;
        while payload.workers.contains_key(&final_id) {
            suffix += 1;
            final_id = format!("{base}-{suffix}");
        }
        let record = self.build_record(&final_id, name, backend);
        Self::ensure_dirs(&record)?;
        payload.workers.insert(record.worker_id.clone(), record.clone());
        self.write_unlocked(payload)?;
        Ok(record)
    }

    pub async fn delete_worker(&self, worker_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut payload = self.read_unlocked();
        let removed = payload.workers.remove(&slugify(worker_id, "")).is_some();
        if removed {
            self.write_unlocked(payload)?;
        }
        Ok(removed)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        let _guard = self.lock.lock().await;
        self.read_unlocked()
            .workers
            .get(&slugify(worker_id, ""))
            .cloned()
    }

    pub async fn list_workers(&self) -> Vec<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut workers: Vec<WorkerRecord> = self.read_unlocked().workers.into_values().collect();
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        workers
    }

    /// Least-recently-used idle worker; selection policy for overlapping
    /// capabilities.
    pub async fn pick_idle_worker(&self) -> Option<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut idle: Vec<WorkerRecord> = self
            .read_unlocked()
            .workers
            .into_values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .collect();
        idle.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        idle.into_iter().next()
    }

    pub async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        last_task_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut payload = self.read_unlocked();
        let safe_id = slugify(worker_id, "");
        let record = payload
            .workers
            .get_mut(&safe_id)
            .ok_or_else(|| anyhow!("worker not found: {worker_id}"))?;
        record.status = status;
        if let Some(task_id) = last_task_id {
            record.last_task_id = task_id.to_string();
        }
        if let Some(error) = last_error {
            record.last_error = error.to_string();
        }
        record.updated_at = now_iso();
        let snapshot = record.clone();
        self.write_unlocked(payload)?;
        Ok(snapshot)
    }

    pub async fn set_capabilities(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> Result<WorkerRecord> {
        let _guard = self.lock.lock().await;
        let mut payload = self.read_unlocked();
        let safe_id = slugify(worker_id, "");
        let record = payload
            .workers
            .get_mut(&safe_id)
            .ok_or_else(|| anyhow!("worker not found: {worker_id}"))?;
        record.capabilities = capabilities;
        record.updated_at = now_iso();
        let snapshot = record.clone();
        self.write_unlocked(payload)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_normalizes_ids() {
        assert_eq!(slugify("Deploy Bot #1", "worker"), "deploy-bot-1");
        assert_eq!(slugify("", "worker"), "worker");
        assert_eq!(slugify("___", "worker"), "___");
    }

    #[tokio::test]
    async fn default_worker_is_created_once() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(tmp.path());
        let a = registry.ensure_default_worker().await.unwrap();
        let b = registry.ensure_default_worker().await.unwrap();
        assert_eq!(a.worker_id, "worker-main");
        assert_eq!(a.created_at, b.created_at);
        assert!(a.workspace_path.exists());
        assert!(a.credentials_path.exists());
    }

    #[tokio::test]
    async fn create_worker_dedupes_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(tmp.path());
        let a = registry
            .create_worker("Builder", WorkerBackend::Shell)
            .await
            .unwrap();
        let b = registry
            .create_worker("Builder", WorkerBackend::Shell)
            .await
            .unwrap();
        assert_eq!(a.worker_id, "builder");
        assert_eq!(b.worker_id, "builder-2");
    }

    #[tokio::test]
    async fn soul_name_overrides_generic_display_name() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(tmp.path());
        let record = registry.ensure_default_worker().await.unwrap();
        std::fs::write(record.soul_path(), "Name: Atlas\n\nExecution focused.\n").unwrap();

        let reloaded = registry.get_worker("worker-main").await.unwrap();
        assert_eq!(reloaded.name, "Atlas");
    }

    #[tokio::test]
    async fn pick_idle_worker_is_lru() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(tmp.path());
        registry.create_worker("old", WorkerBackend::CoreAgent).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        registry.create_worker("new", WorkerBackend::CoreAgent).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        // Touching `old` makes `new` the least recently used.
        registry
            .set_status("old", WorkerStatus::Idle, None, None)
            .await
            .unwrap();
        let picked = registry.pick_idle_worker().await.unwrap();
        assert_eq!(picked.worker_id, "new");
    }

    #[tokio::test]
    async fn busy_workers_are_not_picked() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(tmp.path());
        registry.ensure_default_worker().await.unwrap();
        registry
            .set_status("worker-main", WorkerStatus::Busy, Some("t1"), None)
            .await
            .unwrap();
        assert!(registry.pick_idle_worker().await.is_none());
    }
}
