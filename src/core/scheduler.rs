//! Cron-style triggers feeding the Inbox. Schedules live in each user's
//! `automation/scheduled_tasks.md` state file; a 30-second tick reconciles
//! the live schedule against the file (detected by mtime) so edits take
//! effect without a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::inbox::{SubmitRequest, TaskInbox, TaskPriority, TaskSource};
use crate::core::state::StateStore;

pub const SCHEDULER_TICK_SEC: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: u64,
    /// Standard 5-field crontab: minute hour day-of-month month day-of-week.
    pub crontab: String,
    pub instruction: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: String,
    #[serde(default)]
    pub next_run: String,
}

fn default_enabled() -> bool {
    true
}

/// Next fire time of a 5-field expression after `after`. The `cron` crate
/// wants 7 fields, so seconds and year are pinned around the expression.
pub fn compute_next_run(expr: &str, after: DateTime<Local>) -> Option<DateTime<Local>> {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let seven_field = match fields.len() {
        5 => format!("0 {trimmed} *"),
        6 => format!("{trimmed} *"),
        _ => trimmed.to_string(),
    };
    match seven_field.parse::<cron::Schedule>() {
        Ok(schedule) => schedule.after(&after).next(),
        Err(e) => {
            warn!("Failed to parse cron expression '{expr}': {e}");
            None
        }
    }
}

pub struct Scheduler {
    store: Arc<StateStore>,
    inbox: Arc<TaskInbox>,
    /// Per-user cache of (file mtime at load, parsed entries).
    cache: Mutex<HashMap<String, (Option<SystemTime>, Vec<ScheduledTask>)>>,
}

impl Scheduler {
    pub fn new(store: Arc<StateStore>, inbox: Arc<TaskInbox>) -> Self {
        Self {
            store,
            inbox,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn tasks_path(&self, user_id: &str) -> PathBuf {
        self.store
            .user_path(user_id, &["automation", "scheduled_tasks.md"])
    }

    fn mtime(path: &PathBuf) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    pub async fn list_tasks(&self, user_id: &str) -> Vec<ScheduledTask> {
        let payload = self.store.read_or_default(&self.tasks_path(user_id)).await;
        payload
            .get("tasks")
            .and_then(serde_yaml::Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| serde_yaml::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn write_tasks(&self, user_id: &str, tasks: &[ScheduledTask]) -> Result<()> {
        let mut payload = Mapping::new();
        let seq: Vec<serde_yaml::Value> = tasks
            .iter()
            .filter_map(|t| serde_yaml::to_value(t).ok())
            .collect();
        payload.insert("tasks".into(), serde_yaml::Value::Sequence(seq));
        self.store
            .write_state(&self.tasks_path(user_id), &payload)
            .await?;
        Ok(())
    }

    pub async fn add_task(
        &self,
        user_id: &str,
        crontab: &str,
        instruction: &str,
    ) -> Result<ScheduledTask> {
        if compute_next_run(crontab, Local::now()).is_none() {
            anyhow::bail!("invalid crontab expression: {crontab}");
        }
        let mut tasks = self.list_tasks(user_id).await;
        let task = ScheduledTask {
            id: self.store.next_id("scheduled_task").await?,
            crontab: crontab.trim().to_string(),
            instruction: instruction.trim().to_string(),
            enabled: true,
            last_run: String::new(),
            next_run: String::new(),
        };
        tasks.push(task.clone());
        self.write_tasks(user_id, &tasks).await?;
        Ok(task)
    }

    pub async fn remove_task(&self, user_id: &str, id: u64) -> Result<bool> {
        let mut tasks = self.list_tasks(user_id).await;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Ok(false);
        }
        self.write_tasks(user_id, &tasks).await?;
        Ok(true)
    }

    fn users_with_schedules(&self) -> Vec<String> {
        let users_root = self.store.data_dir().join("users");
        let Ok(entries) = std::fs::read_dir(&users_root) else {
            return Vec::new();
        };
        let mut users: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let uid = entry.file_name().to_string_lossy().to_string();
                self.tasks_path(&uid).exists().then_some(uid)
            })
            .collect();
        users.sort();
        users
    }

    /// One reconcile pass over every user's schedule. Returns how many
    /// envelopes were submitted.
    pub async fn process_once(&self, now: DateTime<Local>) -> Result<usize> {
        let mut submitted = 0;
        for user_id in self.users_with_schedules() {
            let path = self.tasks_path(&user_id);
            let current_mtime = Self::mtime(&path);

            let mut tasks = {
                let mut cache = self.cache.lock().await;
                match cache.get(&user_id) {
                    Some((cached_mtime, tasks)) if *cached_mtime == current_mtime => {
                        tasks.clone()
                    }
                    _ => {
                        let fresh = self.list_tasks(&user_id).await;
                        info!(
                            "Scheduler reloaded {} task(s) for user {}",
                            fresh.len(),
                            user_id
                        );
                        cache.insert(user_id.clone(), (current_mtime, fresh.clone()));
                        fresh
                    }
                }
            };

            let mut dirty = false;
            for task in tasks.iter_mut() {
                if !task.enabled {
                    continue;
                }
                if task.next_run.is_empty() {
                    if let Some(next) = compute_next_run(&task.crontab, now) {
                        task.next_run = next.to_rfc3339_opts(SecondsFormat::Secs, false);
                        dirty = true;
                    }
                    continue;
                }
                let due = DateTime::parse_from_rfc3339(&task.next_run)
                    .map(|next| next <= now)
                    .unwrap_or(false);
                if !due {
                    continue;
                }

                self.inbox
                    .submit(
                        SubmitRequest::new(TaskSource::Cron, &task.instruction, &user_id)
                            .priority(TaskPriority::Low)
                            .requires_reply(true),
                    )
                    .await?;
                submitted += 1;
                task.last_run = now.to_rfc3339_opts(SecondsFormat::Secs, false);
                task.next_run = compute_next_run(&task.crontab, now)
                    .map(|next| next.to_rfc3339_opts(SecondsFormat::Secs, false))
                    .unwrap_or_default();
                dirty = true;
            }

            if dirty {
                self.write_tasks(&user_id, &tasks).await?;
                let mut cache = self.cache.lock().await;
                cache.insert(user_id, (Self::mtime(&path), tasks));
            }
        }
        Ok(submitted)
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("Scheduler started, tick={SCHEDULER_TICK_SEC}s");
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(SCHEDULER_TICK_SEC));
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.process_once(Local::now()).await {
                    error!("scheduler tick failed: {e:#}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn scheduler() -> (Arc<Scheduler>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(tmp.path()));
        let inbox = Arc::new(TaskInbox::open(tmp.path()).await.unwrap());
        (Arc::new(Scheduler::new(store, inbox)), tmp)
    }

    #[test]
    fn five_field_expressions_parse() {
        let now = Local::now();
        let next = compute_next_run("0 9 * * *", now).unwrap();
        assert!(next > now);
        assert_eq!(next.format("%H:%M").to_string(), "09:00");

        assert!(compute_next_run("*/5 * * * *", now).is_some());
        assert!(compute_next_run("not a cron", now).is_none());
    }

    #[tokio::test]
    async fn add_rejects_invalid_crontab() {
        let (scheduler, _tmp) = scheduler().await;
        assert!(scheduler.add_task("1", "nope nope", "x").await.is_err());
        assert!(scheduler.add_task("1", "*/10 * * * *", "check feeds").await.is_ok());
    }

    #[tokio::test]
    async fn first_pass_seeds_next_run_second_pass_fires() {
        let (scheduler, _tmp) = scheduler().await;
        scheduler.add_task("1", "* * * * *", "ping").await.unwrap();

        let now = Local::now();
        // First pass computes next_run without firing.
        assert_eq!(scheduler.process_once(now).await.unwrap(), 0);
        let tasks = scheduler.list_tasks("1").await;
        assert!(!tasks[0].next_run.is_empty());

        // Jump past the computed next_run: the entry fires and reschedules.
        let later = now + Duration::seconds(120);
        assert_eq!(scheduler.process_once(later).await.unwrap(), 1);
        let tasks = scheduler.list_tasks("1").await;
        assert!(!tasks[0].last_run.is_empty());

        let pending = scheduler.inbox.list_pending(10).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].goal, "ping");
        assert_eq!(pending[0].source, TaskSource::Cron);
        assert_eq!(pending[0].priority, TaskPriority::Low);
    }

    #[tokio::test]
    async fn disabled_tasks_never_fire() {
        let (scheduler, _tmp) = scheduler().await;
        let task = scheduler.add_task("1", "* * * * *", "ping").await.unwrap();
        let mut tasks = scheduler.list_tasks("1").await;
        tasks.iter_mut().find(|t| t.id == task.id).unwrap().enabled = false;
        scheduler.write_tasks("1", &tasks).await.unwrap();

        let later = Local::now() + Duration::seconds(120);
        assert_eq!(scheduler.process_once(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_edits_are_picked_up_between_ticks() {
        let (scheduler, _tmp) = scheduler().await;
        scheduler.add_task("1", "* * * * *", "first").await.unwrap();
        let now = Local::now();
        scheduler.process_once(now).await.unwrap();

        // Simulate a human edit: replace the instruction on disk.
        let mut tasks = scheduler.list_tasks("1").await;
        tasks[0].instruction = "edited".to_string();
        scheduler.write_tasks("1", &tasks).await.unwrap();

        let later = now + Duration::seconds(120);
        scheduler.process_once(later).await.unwrap();
        let pending = scheduler.inbox.list_pending(10).await;
        assert_eq!(pending[0].goal, "edited");
    }
}
