//! Append-only worker task log: JSON lines wrapped in the outer state
//! markers so humans can edit the payload safely. Writers coordinate with an
//! OS advisory lock on the file descriptor, so log order is total even when
//! several tasks finish at once.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::state::{STATE_BEGIN_MARKER, STATE_END_MARKER};

const MAX_EVENTS_PER_TASK: usize = 40;

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Exclusive advisory lock held for the lifetime of the guard.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(file: File) -> Result<Self> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(anyhow!(
                "flock failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskEvent {
    pub at: String,
    pub status: String,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskRecord {
    pub task_id: String,
    pub worker_id: String,
    pub source: String,
    pub instruction: String,
    pub status: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub result_summary: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub ended_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub events: Vec<WorkerTaskEvent>,
}

/// Fields an update may change; everything else is append-only history.
#[derive(Debug, Clone, Default)]
pub struct WorkerTaskUpdate {
    pub status: Option<String>,
    pub result: Option<String>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub retry_count: Option<u32>,
}

pub struct WorkerTaskStore {
    path: PathBuf,
}

impl WorkerTaskStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("WORKER_TASKS.jsonl"),
        }
    }

    fn open_locked(&self) -> Result<FileLock> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        FileLock::acquire(file)
    }

    fn read_all(file: &mut File) -> Result<Vec<WorkerTaskRecord>> {
        let mut raw = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut raw)?;
        let mut rows = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line == STATE_BEGIN_MARKER || line == STATE_END_MARKER {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<WorkerTaskRecord>(line) {
                rows.push(record);
            }
        }
        Ok(rows)
    }

    fn write_all(file: &mut File, rows: &[WorkerTaskRecord]) -> Result<()> {
        let mut out = String::new();
        out.push_str(STATE_BEGIN_MARKER);
        out.push('\n');
        for row in rows {
            out.push_str(&serde_json::to_string(row)?);
            out.push('\n');
        }
        out.push_str(STATE_END_MARKER);
        out.push('\n');
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(out.as_bytes())?;
        file.sync_data().ok();
        Ok(())
    }

    fn new_event(status: &str, retry: u32, error: &str, detail: &str) -> WorkerTaskEvent {
        WorkerTaskEvent {
            at: now_iso(),
            status: status.to_string(),
            retry,
            error: error.chars().take(400).collect(),
            detail: detail.chars().take(400).collect(),
        }
    }

    pub async fn create_task(
        &self,
        worker_id: &str,
        source: &str,
        instruction: &str,
        metadata: Map<String, Value>,
    ) -> Result<WorkerTaskRecord> {
        let record = WorkerTaskRecord {
            task_id: format!(
                "wt-{}-{}",
                Local::now().timestamp(),
                &Uuid::new_v4().simple().to_string()[..8]
            ),
            worker_id: worker_id.to_string(),
            source: source.to_string(),
            instruction: instruction.trim().to_string(),
            status: "queued".to_string(),
            result: String::new(),
            result_summary: String::new(),
            error: String::new(),
            retry_count: 0,
            created_at: now_iso(),
            started_at: String::new(),
            ended_at: String::new(),
            metadata,
            events: vec![Self::new_event("queued", 0, "", "task created")],
        };

        let path = self.path.clone();
        let snapshot = record.clone();
        let record = tokio::task::spawn_blocking(move || -> Result<WorkerTaskRecord> {
            let store = WorkerTaskStore { path };
            let mut lock = store.open_locked()?;
            let mut rows = Self::read_all(&mut lock.file)?;
            rows.push(snapshot.clone());
            Self::write_all(&mut lock.file, &rows)?;
            Ok(snapshot)
        })
        .await??;
        Ok(record)
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        update: WorkerTaskUpdate,
    ) -> Result<Option<WorkerTaskRecord>> {
        let path = self.path.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<WorkerTaskRecord>> {
            let store = WorkerTaskStore { path };
            let mut lock = store.open_locked()?;
            let mut rows = Self::read_all(&mut lock.file)?;
            let mut changed = None;
            for row in rows.iter_mut() {
                if row.task_id != task_id {
                    continue;
                }
                let prev_status = row.status.clone();
                let prev_retry = row.retry_count;

                if let Some(status) = &update.status {
                    row.status = status.clone();
                }
                if let Some(result) = &update.result {
                    row.result = result.clone();
                }
                if let Some(summary) = &update.result_summary {
                    row.result_summary = summary.clone();
                }
                if let Some(error) = &update.error {
                    row.error = error.clone();
                }
                if let Some(started_at) = &update.started_at {
                    row.started_at = started_at.clone();
                }
                if let Some(ended_at) = &update.ended_at {
                    row.ended_at = ended_at.clone();
                }
                if let Some(retry) = update.retry_count {
                    row.retry_count = retry;
                }

                let status_changed = row.status != prev_status;
                let retry_changed = row.retry_count != prev_retry;
                let error_set = update.error.as_deref().map(|e| !e.is_empty()).unwrap_or(false);
                if status_changed || retry_changed || error_set {
                    row.events.push(Self::new_event(
                        &row.status,
                        row.retry_count,
                        &row.error,
                        update.result_summary.as_deref().unwrap_or(""),
                    ));
                    if row.events.len() > MAX_EVENTS_PER_TASK {
                        let excess = row.events.len() - MAX_EVENTS_PER_TASK;
                        row.events.drain(..excess);
                    }
                }
                changed = Some(row.clone());
                break;
            }
            if changed.is_some() {
                Self::write_all(&mut lock.file, &rows)?;
            }
            Ok(changed)
        })
        .await?
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<WorkerTaskRecord>> {
        let path = self.path.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<WorkerTaskRecord>> {
            let store = WorkerTaskStore { path };
            let mut lock = store.open_locked()?;
            let rows = Self::read_all(&mut lock.file)?;
            Ok(rows.into_iter().find(|r| r.task_id == task_id))
        })
        .await?
    }

    pub async fn list_recent(
        &self,
        worker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkerTaskRecord>> {
        let path = self.path.clone();
        let worker_id = worker_id.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<Vec<WorkerTaskRecord>> {
            let store = WorkerTaskStore { path };
            let mut lock = store.open_locked()?;
            let mut rows = Self::read_all(&mut lock.file)?;
            if let Some(worker_id) = worker_id {
                rows.retain(|r| r.worker_id == worker_id);
            }
            let skip = rows.len().saturating_sub(limit.max(1));
            Ok(rows.into_iter().skip(skip).collect())
        })
        .await?
    }
}
