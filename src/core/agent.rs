//! Wires the subsystems into one runnable core: state store, inbox,
//! orchestrator, worker fleet, heartbeat and scheduler, plus the adapter
//! entry point that turns a `UnifiedMessage` into a completed task.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::heartbeat::{HeartbeatStore, HeartbeatWorker};
use crate::core::inbox::{SubmitRequest, TaskInbox, TaskPriority, TaskSource};
use crate::core::llm::LlmClient;
use crate::core::memory::MemoryClient;
use crate::core::orchestrator::Orchestrator;
use crate::core::platform::{PlatformAdapter, SilentAdapter, UnifiedContext, UnifiedMessage};
use crate::core::prompt::SoulStore;
use crate::core::scheduler::Scheduler;
use crate::core::skills::{ExtensionExecutor, SkillLoader};
use crate::core::state::{ChatLog, StateStore};
use crate::core::tools::ToolAccessStore;
use crate::core::worker::{WorkerRegistry, WorkerRuntime, WorkerTaskStore};

pub struct AgentCore {
    pub config: Config,
    pub store: Arc<StateStore>,
    pub chat: Arc<ChatLog>,
    pub inbox: Arc<TaskInbox>,
    pub orchestrator: Arc<Orchestrator>,
    pub heartbeat: Arc<HeartbeatWorker>,
    pub scheduler: Arc<Scheduler>,
    pub souls: Arc<SoulStore>,
    /// Adapter used for pushes that have no live conversation (cron results,
    /// heartbeat notices).
    delivery: Arc<dyn PlatformAdapter>,
}

impl AgentCore {
    pub async fn bootstrap(
        config: Config,
        llm: Arc<dyn LlmClient>,
        memory: Option<Arc<dyn MemoryClient>>,
        delivery: Arc<dyn PlatformAdapter>,
    ) -> Result<Arc<Self>> {
        let data_dir = config.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        let store = Arc::new(StateStore::new(&data_dir));
        let chat = Arc::new(ChatLog::new(&data_dir));
        let inbox = Arc::new(TaskInbox::open(&data_dir).await?);
        let access = Arc::new(ToolAccessStore::open(&data_dir));
        let skills = Arc::new(Mutex::new(SkillLoader::new(data_dir.join("skills"))));
        let extensions = Arc::new(ExtensionExecutor::new(&data_dir));

        let worker_registry = Arc::new(WorkerRegistry::new(&data_dir));
        worker_registry.ensure_default_worker().await?;
        let worker_tasks = Arc::new(WorkerTaskStore::new(&data_dir));
        let worker_runtime = Arc::new(WorkerRuntime::new(
            config.clone(),
            worker_registry,
            worker_tasks,
        ));

        let souls = Arc::new(SoulStore::new(store.clone()));
        souls.ensure_seeded().await;

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            llm,
            store.clone(),
            chat.clone(),
            inbox.clone(),
            access,
            skills,
            extensions,
            worker_runtime,
            souls.clone(),
            memory,
        ));

        let heartbeat_store = Arc::new(HeartbeatStore::new(&data_dir));
        let heartbeat = Arc::new(HeartbeatWorker::new(
            config.clone(),
            heartbeat_store,
            inbox.clone(),
            orchestrator.clone(),
            delivery.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(store.clone(), inbox.clone()));

        info!("Agent core bootstrapped at {}", data_dir.display());
        Ok(Arc::new(Self {
            config,
            store,
            chat,
            inbox,
            orchestrator,
            heartbeat,
            scheduler,
            souls,
            delivery,
        }))
    }

    /// Adapter entry point: submit a chat message as a task and run it to
    /// completion. The reply goes back through the supplied adapter.
    pub async fn handle_message(
        &self,
        message: UnifiedMessage,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> Result<String> {
        let source = if message.text.trim_start().starts_with('/') {
            TaskSource::UserCmd
        } else {
            TaskSource::UserChat
        };
        let session_id = self
            .chat
            .latest_session_id(&message.user.id)
            .await
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let task = self
            .inbox
            .submit(
                SubmitRequest::new(source, &message.text, &message.user.id)
                    .platform(&message.platform)
                    .priority(TaskPriority::Normal),
            )
            .await?;

        let ctx = UnifiedContext::new(message, &session_id, adapter);
        self.orchestrator.handle_task(&ctx, &task.task_id).await
    }

    /// One pass over pending envelopes from background sources. Heartbeat
    /// envelopes are executed by the heartbeat worker itself; cron and
    /// system tasks run here, yielding to an active chat for the same user.
    pub async fn dispatch_pending_once(&self) -> Result<usize> {
        let mut handled = 0;
        for task in self.inbox.list_pending(16).await {
            if matches!(task.source, TaskSource::Heartbeat) {
                continue;
            }
            if matches!(task.source, TaskSource::Cron)
                && self.inbox.has_active_chat_task(&task.user_id).await
            {
                continue;
            }
            let message = UnifiedMessage::text_message(
                if task.platform.is_empty() {
                    "system"
                } else {
                    &task.platform
                },
                &task.user_id,
                &task.user_id,
                &task.goal,
            );
            let ctx = UnifiedContext::new(
                message,
                &format!("{}-{}", task.source_label(), task.user_id),
                self.delivery.clone(),
            );
            if let Err(e) = self.orchestrator.handle_task(&ctx, &task.task_id).await {
                warn!("background task {} failed: {e:#}", task.task_id);
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Spawn the long-running loops: heartbeat dispatcher, scheduler tick,
    /// and the background task pump.
    pub fn start_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.heartbeat.start(), self.scheduler.start()];
        let core = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tick.tick().await;
                if let Err(e) = core.dispatch_pending_once().await {
                    warn!("task pump error: {e:#}");
                }
            }
        }));
        handles
    }

    /// Run until interrupted.
    pub async fn run_forever(self: &Arc<Self>) -> Result<()> {
        let handles = self.start_background();
        tokio::signal::ctrl_c().await?;
        info!("Shutting down agent core");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}

impl crate::core::inbox::TaskEnvelope {
    fn source_label(&self) -> &'static str {
        match self.source {
            TaskSource::UserChat => "chat",
            TaskSource::UserCmd => "cmd",
            TaskSource::Heartbeat => "heartbeat",
            TaskSource::Cron => "cron",
            TaskSource::System => "system",
        }
    }
}

/// Convenience bootstrap for tests and headless tools: silent delivery, no
/// memory service.
pub async fn bootstrap_headless(config: Config, llm: Arc<dyn LlmClient>) -> Result<Arc<AgentCore>> {
    AgentCore::bootstrap(config, llm, None, Arc::new(SilentAdapter)).await
}
