//! The Task Inbox: the only way a new unit of work enters the system.
//! Envelopes live in memory behind one async mutex and are persisted to
//! `task_inbox/tasks/<id>.json` before the lock is released; every mutation
//! also appends to `task_inbox/events.jsonl`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    UserChat,
    UserCmd,
    Heartbeat,
    Cron,
    #[default]
    System,
}

impl TaskSource {
    /// Unknown tokens normalize to `system` so old envelopes keep loading.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "user_chat" | "chat" | "message" => TaskSource::UserChat,
            "user_cmd" | "user" | "command" | "cmd" => TaskSource::UserCmd,
            "heartbeat" | "hb" => TaskSource::Heartbeat,
            "cron" => TaskSource::Cron,
            _ => TaskSource::System,
        }
    }
}

impl<'de> Deserialize<'de> for TaskSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(TaskSource::parse(&String::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" => TaskPriority::High,
            "low" => TaskPriority::Low,
            _ => TaskPriority::Normal,
        }
    }

    fn rank(self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

impl<'de> Deserialize<'de> for TaskPriority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(TaskPriority::parse(&String::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" | "canceled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(TaskStatus::parse(&String::deserialize(deserializer)?))
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub at: String,
    pub kind: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default = "default_true")]
    pub requires_reply: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_worker_id: String,
    #[serde(default)]
    pub dispatch_reason: String,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

fn default_true() -> bool {
    true
}

impl TaskEnvelope {
    fn add_event(&mut self, kind: &str, note: &str) {
        let at = now_iso();
        self.events.push(TaskEvent {
            at: at.clone(),
            kind: kind.to_string(),
            note: note.chars().take(200).collect(),
        });
        self.updated_at = at;
    }
}

/// Parameters for [`TaskInbox::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source: TaskSource,
    pub goal: String,
    pub user_id: String,
    pub platform: String,
    pub payload: Map<String, Value>,
    pub priority: TaskPriority,
    pub requires_reply: bool,
}

impl SubmitRequest {
    pub fn new(source: TaskSource, goal: &str, user_id: &str) -> Self {
        Self {
            source,
            goal: goal.trim().to_string(),
            user_id: user_id.trim().to_string(),
            platform: String::new(),
            payload: Map::new(),
            priority: TaskPriority::Normal,
            requires_reply: true,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn requires_reply(mut self, requires_reply: bool) -> Self {
        self.requires_reply = requires_reply;
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }
}

pub struct TaskInbox {
    tasks_root: PathBuf,
    events_path: PathBuf,
    tasks: Mutex<HashMap<String, TaskEnvelope>>,
}

impl TaskInbox {
    /// Open the inbox and rehydrate every envelope from disk.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = data_dir.into().join("task_inbox");
        let tasks_root = root.join("tasks");
        tokio::fs::create_dir_all(&tasks_root).await?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&tasks_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<TaskEnvelope>(&raw) {
                    Ok(task) => {
                        loaded.insert(task.task_id.clone(), task);
                    }
                    Err(e) => warn!("Skipping unreadable envelope {}: {}", path.display(), e),
                },
                Err(e) => warn!("Skipping unreadable envelope {}: {}", path.display(), e),
            }
        }

        Ok(Self {
            events_path: root.join("events.jsonl"),
            tasks_root,
            tasks: Mutex::new(loaded),
        })
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_root.join(format!("{task_id}.json"))
    }

    async fn persist(&self, task: &TaskEnvelope) -> Result<()> {
        let raw = serde_json::to_string_pretty(task)?;
        tokio::fs::write(self.task_path(&task.task_id), raw + "\n").await?;
        Ok(())
    }

    async fn append_log(&self, task_id: &str, kind: &str, note: &str) {
        let entry = json!({
            "at": now_iso(),
            "task_id": task_id,
            "kind": kind,
            "note": note.chars().take(200).collect::<String>(),
        });
        let line = entry.to_string() + "\n";
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await;
        match result {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("Inbox event log write failed: {}", e);
                }
            }
            Err(e) => warn!("Inbox event log open failed: {}", e),
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskEnvelope> {
        let now = now_iso();
        let mut task = TaskEnvelope {
            task_id: Uuid::new_v4().to_string(),
            source: request.source,
            goal: request.goal,
            payload: request.payload,
            priority: request.priority,
            user_id: request.user_id,
            platform: request.platform,
            requires_reply: request.requires_reply,
            created_at: now.clone(),
            updated_at: now,
            status: TaskStatus::Pending,
            assigned_worker_id: String::new(),
            dispatch_reason: String::new(),
            result: Map::new(),
            final_output: String::new(),
            retry_count: 0,
            events: Vec::new(),
        };
        let submitted_note = task.goal.clone();
        task.add_event("submitted", &submitted_note);

        let mut tasks = self.tasks.lock().await;
        self.persist(&task).await?;
        self.append_log(&task.task_id, "submitted", &task.goal).await;
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskEnvelope> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Pending envelopes, highest priority first, FIFO within a priority.
    pub async fn list_pending(&self, limit: usize) -> Vec<TaskEnvelope> {
        let tasks = self.tasks.lock().await;
        let mut rows: Vec<TaskEnvelope> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        rows.truncate(limit.max(1));
        rows
    }

    pub async fn list_recent(&self, user_id: Option<&str>, limit: usize) -> Vec<TaskEnvelope> {
        let tasks = self.tasks.lock().await;
        let mut rows: Vec<TaskEnvelope> = tasks
            .values()
            .filter(|t| user_id.map(|uid| t.user_id == uid).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit.max(1));
        rows
    }

    /// True when the user has a user_chat task currently running; heartbeat
    /// and cron submissions for that user must yield.
    pub async fn has_active_chat_task(&self, user_id: &str) -> bool {
        let tasks = self.tasks.lock().await;
        tasks.values().any(|t| {
            t.user_id == user_id
                && t.status == TaskStatus::Running
                && matches!(t.source, TaskSource::UserChat | TaskSource::UserCmd)
        })
    }

    async fn mutate<F>(&self, task_id: &str, kind: &str, note: &str, apply: F) -> Result<TaskEnvelope>
    where
        F: FnOnce(&mut TaskEnvelope) -> Result<()>,
    {
        let mut tasks = self.tasks.lock().await;
        let task = match tasks.get_mut(task_id) {
            Some(task) => task,
            None => bail!("task not found: {task_id}"),
        };
        apply(task)?;
        task.add_event(kind, note);
        let snapshot = task.clone();
        self.persist(&snapshot).await?;
        self.append_log(task_id, kind, note).await;
        Ok(snapshot)
    }

    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<TaskEnvelope> {
        self.mutate(task_id, "status_updated", &format!("{status:?}"), |task| {
            if task.status.is_terminal() {
                bail!("task {} is terminal ({:?})", task.task_id, task.status);
            }
            task.status = status;
            Ok(())
        })
        .await
    }

    pub async fn assign_worker(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<TaskEnvelope> {
        let note = format!("worker={worker_id}; reason={reason}");
        self.mutate(task_id, "worker_assigned", &note, |task| {
            if task.status.is_terminal() {
                bail!("task {} is terminal ({:?})", task.task_id, task.status);
            }
            if !task.assigned_worker_id.is_empty() && task.assigned_worker_id != worker_id {
                bail!(
                    "task {} is already assigned to {}",
                    task.task_id,
                    task.assigned_worker_id
                );
            }
            task.status = TaskStatus::Running;
            task.assigned_worker_id = worker_id.to_string();
            task.dispatch_reason = reason.to_string();
            Ok(())
        })
        .await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        result: Map<String, Value>,
        final_output: &str,
    ) -> Result<TaskEnvelope> {
        self.mutate(task_id, "completed", final_output, |task| {
            if task.status.is_terminal() {
                bail!("task {} is terminal ({:?})", task.task_id, task.status);
            }
            task.status = TaskStatus::Completed;
            task.result = result;
            task.final_output = final_output.to_string();
            Ok(())
        })
        .await
    }

    pub async fn fail(&self, task_id: &str, error: &str) -> Result<TaskEnvelope> {
        self.mutate(task_id, "failed", error, |task| {
            if task.status.is_terminal() {
                bail!("task {} is terminal ({:?})", task.task_id, task.status);
            }
            task.status = TaskStatus::Failed;
            task.result
                .insert("error".to_string(), Value::String(error.to_string()));
            task.final_output = String::new();
            Ok(())
        })
        .await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<TaskEnvelope> {
        self.mutate(task_id, "cancelled", "", |task| {
            if task.status.is_terminal() {
                bail!("task {} is terminal ({:?})", task.task_id, task.status);
            }
            task.status = TaskStatus::Cancelled;
            Ok(())
        })
        .await
    }

    pub async fn bump_retry(&self, task_id: &str, note: &str) -> Result<TaskEnvelope> {
        self.mutate(task_id, "retry", note, |task| {
            task.retry_count += 1;
            Ok(())
        })
        .await
    }
}
