mod store;

pub use store::{
    classify_result, DeliveryTarget, HeartbeatGrade, HeartbeatStatus, HeartbeatStore,
    HEARTBEAT_OK,
};

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::config::Config;
use crate::core::inbox::{SubmitRequest, TaskInbox, TaskSource};
use crate::core::orchestrator::Orchestrator;
use crate::core::platform::{
    PlatformAdapter, SilentAdapter, UnifiedContext, UnifiedMessage, HEARTBEAT_READONLY_POLICY,
};

/// Drives per-user periodic maintenance: a 1-second dispatcher scans the
/// user set and submits a heartbeat envelope through the Task Inbox for each
/// due user. Runs are read-only and graded; `HEARTBEAT_OK` is suppressed.
pub struct HeartbeatWorker {
    config: Config,
    store: Arc<HeartbeatStore>,
    inbox: Arc<TaskInbox>,
    orchestrator: Arc<Orchestrator>,
    /// Adapter used to push graded results to the user's delivery target.
    delivery: Arc<dyn PlatformAdapter>,
    running: Mutex<HashSet<String>>,
}

impl HeartbeatWorker {
    pub fn new(
        config: Config,
        store: Arc<HeartbeatStore>,
        inbox: Arc<TaskInbox>,
        orchestrator: Arc<Orchestrator>,
        delivery: Arc<dyn PlatformAdapter>,
    ) -> Self {
        Self {
            config,
            store,
            inbox,
            orchestrator,
            delivery,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<HeartbeatStore> {
        &self.store
    }

    /// Spawn the dispatcher loop. Returns the handle so the daemon can abort
    /// it on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            if !worker.config.heartbeat_enabled {
                info!("Heartbeat worker disabled by env.");
                return;
            }
            info!(
                "Heartbeat worker started, tick={}s",
                worker.config.heartbeat_tick_sec
            );
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(worker.config.heartbeat_tick_sec));
            loop {
                tick.tick().await;
                if let Err(e) = worker.process_once().await {
                    error!("heartbeat dispatcher error: {e:#}");
                }
            }
        })
    }

    pub async fn process_once(self: &Arc<Self>) -> Result<()> {
        for user_id in self.store.list_users().await {
            // Heartbeat yields to an active chat task for the same user.
            if self.inbox.has_active_chat_task(&user_id).await {
                continue;
            }
            {
                let running = self.running.lock().await;
                if running.contains(&user_id) {
                    continue;
                }
            }
            if !self.store.should_run(&user_id, Local::now()).await {
                continue;
            }

            let worker = self.clone();
            self.running.lock().await.insert(user_id.clone());
            tokio::spawn(async move {
                let result = worker.run_for_user(&user_id, false).await;
                if let Err(e) = result {
                    warn!("heartbeat run failed for {user_id}: {e:#}");
                    worker.store.set_last_error(&user_id, &e.to_string()).await.ok();
                }
                worker.running.lock().await.remove(&user_id);
            });
        }
        Ok(())
    }

    /// Manual trigger, used by tests and an operator command.
    pub async fn run_user_now(self: &Arc<Self>, user_id: &str) -> Result<String> {
        {
            let mut running = self.running.lock().await;
            if !running.insert(user_id.to_string()) {
                return Ok("heartbeat already running".to_string());
            }
        }
        let result = self.run_for_user(user_id, true).await;
        self.running.lock().await.remove(user_id);
        result
    }

    fn checklist_prompt(checklist: &[String]) -> String {
        let body = if checklist.is_empty() {
            "- Check for important updates and only report action-required items.".to_string()
        } else {
            checklist
                .iter()
                .filter(|item| !item.trim().is_empty())
                .map(|item| format!("- {}", item.trim()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You are running the periodic heartbeat check.\n\
             Work through the checklist below item by item.\n\
             If nothing needs the user's attention, output exactly: {HEARTBEAT_OK}\n\
             Otherwise output a concise summary; prefix with [ACTION] when the \
             user must act.\n\n\
             # Heartbeat checklist\n{body}"
        )
    }

    async fn run_for_user(&self, user_id: &str, force: bool) -> Result<String> {
        let owner = format!("hb:{user_id}:{}", Local::now().timestamp());
        if !self.store.claim_lock(user_id, &owner).await? {
            return Ok("lock_busy".to_string());
        }

        let run = async {
            if !force && !self.store.should_run(user_id, Local::now()).await {
                return Ok::<String, anyhow::Error>("skipped".to_string());
            }

            let status = self.store.read_status(user_id).await;
            let prompt = Self::checklist_prompt(&status.checklist);

            let task = self
                .inbox
                .submit(
                    SubmitRequest::new(TaskSource::Heartbeat, &prompt, user_id)
                        .platform("heartbeat_daemon")
                        .requires_reply(false),
                )
                .await?;
            self.store.set_active_task(user_id, &task.task_id).await.ok();

            // Intermediate output is swallowed; only the graded result may
            // reach the delivery target below.
            let message =
                UnifiedMessage::text_message("heartbeat_daemon", user_id, user_id, "heartbeat");
            let ctx = UnifiedContext::new(
                message,
                &format!("heartbeat-{user_id}"),
                Arc::new(SilentAdapter),
            )
            .with_policy(HEARTBEAT_READONLY_POLICY);

            let final_text = self
                .orchestrator
                .handle_task(&ctx, &task.task_id)
                .await
                .unwrap_or_else(|e| format!("ERROR: {e}"));
            self.store.refresh_lock(user_id, &owner).await.ok();

            let grade = self.store.mark_run(user_id, &final_text).await?;
            if grade == HeartbeatGrade::Ok && self.config.heartbeat_suppress_ok {
                return Ok(HEARTBEAT_OK.to_string());
            }

            let Some(target) = status.delivery.filter(|t| !t.chat_id.is_empty()) else {
                info!("heartbeat result not pushed: no delivery target for user={user_id}");
                return Ok(final_text);
            };
            let push_text = if grade == HeartbeatGrade::Ok {
                final_text.clone()
            } else {
                format!("[{}] {}", grade.as_str(), final_text)
            };
            let push_message = UnifiedMessage::text_message(
                &target.platform,
                user_id,
                &target.chat_id,
                "heartbeat",
            );
            let push_ctx = UnifiedContext::new(
                push_message,
                &format!("heartbeat-{user_id}"),
                self.delivery.clone(),
            );
            if let Err(e) = push_ctx.reply(&push_text, None).await {
                warn!("heartbeat push failed: user={user_id} err={e}");
            }
            Ok(final_text)
        }
        .await;

        self.store.release_lock(user_id, &owner).await.ok();
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checklist_prompt_lists_items_and_sentinel() {
        let prompt = HeartbeatWorker::checklist_prompt(&[
            "Check RSS subscriptions".to_string(),
            "Sweep due reminders".to_string(),
        ]);
        assert!(prompt.contains("- Check RSS subscriptions"));
        assert!(prompt.contains("- Sweep due reminders"));
        assert!(prompt.contains(HEARTBEAT_OK));
    }

    #[test]
    fn empty_checklist_gets_a_default_item() {
        let prompt = HeartbeatWorker::checklist_prompt(&[]);
        assert!(prompt.contains("important updates"));
    }
}
