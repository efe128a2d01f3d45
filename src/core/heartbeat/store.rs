//! Per-user heartbeat state: `STATUS.json` (schedule, lock, pulse, delivery
//! target) and `HEARTBEAT.md` (append-only graded run log).

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Duration, Local, SecondsFormat, Timelike};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// A lock older than this is considered abandoned and may be reclaimed.
const LOCK_STALE_MINUTES: i64 = 15;

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatGrade {
    Ok,
    Notice,
    Action,
}

impl HeartbeatGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatGrade::Ok => "OK",
            HeartbeatGrade::Notice => "NOTICE",
            HeartbeatGrade::Action => "ACTION",
        }
    }
}

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Grade a heartbeat run from its final output. The sentinel stays silent;
/// an explicit action marker escalates; anything else is a notice.
pub fn classify_result(text: &str) -> HeartbeatGrade {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == HEARTBEAT_OK {
        return HeartbeatGrade::Ok;
    }
    let upper = trimmed.to_uppercase();
    if upper.starts_with("[ACTION]") || upper.starts_with("ACTION") || upper.contains("\nACTION") {
        HeartbeatGrade::Action
    } else {
        HeartbeatGrade::Notice
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTarget {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_every_seconds")]
    pub every_seconds: u64,
    /// Local-time window `[start_hour, end_hour)` in which runs may fire.
    #[serde(default = "default_active_hours")]
    pub active_hours: [u32; 2],
    #[serde(default)]
    pub paused_until: String,
    #[serde(default)]
    pub lock_owner: String,
    #[serde(default)]
    pub lock_at: String,
    #[serde(default)]
    pub last_pulse_at: String,
    #[serde(default)]
    pub last_run_at: String,
    #[serde(default)]
    pub last_level: String,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub active_task_id: String,
    #[serde(default)]
    pub checklist: Vec<String>,
    #[serde(default)]
    pub delivery: Option<DeliveryTarget>,
}

fn default_every_seconds() -> u64 {
    3600
}

fn default_active_hours() -> [u32; 2] {
    [8, 23]
}

impl Default for HeartbeatStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            every_seconds: default_every_seconds(),
            active_hours: default_active_hours(),
            paused_until: String::new(),
            lock_owner: String::new(),
            lock_at: String::new(),
            last_pulse_at: String::new(),
            last_run_at: String::new(),
            last_level: String::new(),
            last_error: String::new(),
            active_task_id: String::new(),
            checklist: Vec::new(),
            delivery: None,
        }
    }
}

pub struct HeartbeatStore {
    data_dir: PathBuf,
}

impl HeartbeatStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.data_dir
            .join("users")
            .join(user_id.trim())
            .join("heartbeat")
    }

    fn status_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("STATUS.json")
    }

    pub fn heartbeat_log_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("HEARTBEAT.md")
    }

    pub async fn read_status(&self, user_id: &str) -> HeartbeatStatus {
        match tokio::fs::read_to_string(self.status_path(user_id)).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HeartbeatStatus::default(),
        }
    }

    pub async fn write_status(&self, user_id: &str, status: &HeartbeatStatus) -> Result<()> {
        let path = self.status_path(user_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(status)?;
        tokio::fs::write(&path, raw + "\n").await?;
        Ok(())
    }

    /// Users with a heartbeat STATUS.json on disk.
    pub async fn list_users(&self) -> Vec<String> {
        let users_root = self.data_dir.join("users");
        let mut users = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&users_root).await else {
            return users;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let uid = entry.file_name().to_string_lossy().to_string();
            if self.status_path(&uid).exists() {
                users.push(uid);
            }
        }
        users.sort();
        users
    }

    pub async fn enable_user(
        &self,
        user_id: &str,
        every_seconds: u64,
        checklist: Vec<String>,
        delivery: Option<DeliveryTarget>,
    ) -> Result<HeartbeatStatus> {
        let mut status = self.read_status(user_id).await;
        status.enabled = true;
        status.every_seconds = every_seconds.max(5);
        status.checklist = checklist;
        status.delivery = delivery;
        self.write_status(user_id, &status).await?;
        Ok(status)
    }

    /// Whether a heartbeat is due: enabled, inside active hours, not paused,
    /// and at least `every_seconds` past the previous run.
    pub async fn should_run(&self, user_id: &str, now: DateTime<Local>) -> bool {
        let status = self.read_status(user_id).await;
        if !status.enabled {
            return false;
        }

        let hour = now.hour();
        let [start, end] = status.active_hours;
        let in_window = if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        };
        if !in_window {
            return false;
        }

        if !status.paused_until.is_empty() {
            if let Ok(paused_until) = DateTime::parse_from_rfc3339(&status.paused_until) {
                if now < paused_until {
                    return false;
                }
            }
        }

        if status.last_run_at.is_empty() {
            return true;
        }
        match DateTime::parse_from_rfc3339(&status.last_run_at) {
            Ok(last) => {
                now.signed_duration_since(last) >= Duration::seconds(status.every_seconds as i64)
            }
            Err(_) => true,
        }
    }

    /// Claim the per-user run lock; stale locks are reclaimed.
    pub async fn claim_lock(&self, user_id: &str, owner: &str) -> Result<bool> {
        let mut status = self.read_status(user_id).await;
        if !status.lock_owner.is_empty() && status.lock_owner != owner {
            let stale = DateTime::parse_from_rfc3339(&status.lock_at)
                .map(|at| {
                    Local::now().signed_duration_since(at) > Duration::minutes(LOCK_STALE_MINUTES)
                })
                .unwrap_or(true);
            if !stale {
                return Ok(false);
            }
        }
        status.lock_owner = owner.to_string();
        status.lock_at = now_iso();
        status.last_pulse_at = now_iso();
        self.write_status(user_id, &status).await?;
        Ok(true)
    }

    pub async fn refresh_lock(&self, user_id: &str, owner: &str) -> Result<()> {
        let mut status = self.read_status(user_id).await;
        if status.lock_owner == owner {
            status.last_pulse_at = now_iso();
            self.write_status(user_id, &status).await?;
        }
        Ok(())
    }

    pub async fn release_lock(&self, user_id: &str, owner: &str) -> Result<()> {
        let mut status = self.read_status(user_id).await;
        if status.lock_owner == owner {
            status.lock_owner = String::new();
            status.lock_at = String::new();
            status.active_task_id = String::new();
            self.write_status(user_id, &status).await?;
        }
        Ok(())
    }

    pub async fn set_active_task(&self, user_id: &str, task_id: &str) -> Result<()> {
        let mut status = self.read_status(user_id).await;
        status.active_task_id = task_id.to_string();
        self.write_status(user_id, &status).await
    }

    pub async fn set_last_error(&self, user_id: &str, error: &str) -> Result<()> {
        let mut status = self.read_status(user_id).await;
        status.last_error = error.chars().take(400).collect();
        self.write_status(user_id, &status).await
    }

    /// Record a completed run: grade it, stamp the status, and append a
    /// graded entry to the markdown log.
    pub async fn mark_run(&self, user_id: &str, final_text: &str) -> Result<HeartbeatGrade> {
        let grade = classify_result(final_text);
        let mut status = self.read_status(user_id).await;
        status.last_run_at = now_iso();
        status.last_level = grade.as_str().to_string();
        if grade != HeartbeatGrade::Ok {
            status.last_error = String::new();
        }
        self.write_status(user_id, &status).await?;

        let log_path = self.heartbeat_log_path(user_id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = format!(
            "## {} [{}]\n\n{}\n\n",
            now_iso(),
            grade.as_str(),
            final_text.trim()
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        Ok(grade)
    }
}
