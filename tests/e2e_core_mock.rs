//! End-to-end scenarios against a scripted model: direct answer, primitive
//! shell, extension invocation, worker dispatch, loop guards, permission
//! gating, heartbeat suppression, and serial session ordering.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use xbot::core::agent::AgentCore;
use xbot::core::config::Config;
use xbot::core::inbox::{SubmitRequest, TaskSource, TaskStatus};
use xbot::core::llm::mock::MockLlm;
use xbot::core::llm::{ChatTurn, LlmClient, LlmReply, MessagePart, ToolDefinition};
use xbot::core::platform::{RecordingAdapter, UnifiedMessage};
use xbot::core::worker::CoreAgentBackend;

fn write_skill(data_dir: &Path, kind: &str, name: &str, script: &str) {
    let dir = data_dir.join("skills").join(kind).join(name);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    let manifest = format!(
        "---\n\
         name: {name}\n\
         api_version: v3\n\
         description: test skill {name}\n\
         triggers:\n  - {name}\n\
         input_schema:\n\
         \x20 type: object\n\
         \x20 properties:\n\
         \x20   url:\n\
         \x20     type: string\n\
         \x20 required:\n\
         \x20   - url\n\
         permissions:\n\
         \x20 filesystem: workspace\n\
         \x20 shell: false\n\
         \x20 network: limited\n\
         entrypoint: scripts/execute.sh\n\
         ---\n\n# {name}\n"
    );
    std::fs::write(dir.join("SKILL.md"), manifest).unwrap();
    std::fs::write(dir.join("scripts/execute.sh"), script).unwrap();
}

async fn core_with_script(
    data_dir: &Path,
    replies: Vec<LlmReply>,
) -> (Arc<AgentCore>, Arc<MockLlm>, Arc<RecordingAdapter>) {
    let llm = Arc::new(MockLlm::scripted(replies));
    let delivery = Arc::new(RecordingAdapter::default());
    let core = AgentCore::bootstrap(
        Config::for_data_dir(data_dir),
        llm.clone(),
        None,
        delivery.clone(),
    )
    .await
    .unwrap();
    (core, llm, delivery)
}

#[tokio::test]
async fn direct_answer_finishes_in_one_turn_without_tools() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, llm, _) = core_with_script(
        tmp.path(),
        vec![LlmReply::Text("你好！有什么可以帮你？".into())],
    )
    .await;

    let adapter = Arc::new(RecordingAdapter::default());
    let message = UnifiedMessage::text_message("telegram", "1", "1", "你好");
    let output = core.handle_message(message, adapter.clone()).await.unwrap();

    assert!(!output.is_empty());
    assert_eq!(llm.call_count(), 1);
    assert_eq!(adapter.replies.lock().unwrap().len(), 1);

    let task = &core.inbox.list_recent(Some("1"), 1).await[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.final_output, output);
    assert_eq!(task.result.get("tool_calls"), Some(&json!(0)));
}

#[tokio::test]
async fn bash_primitive_roundtrips_through_the_loop() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, llm, _) = core_with_script(
        tmp.path(),
        vec![
            LlmReply::FunctionCall {
                name: "bash".into(),
                args: json!({"command": "echo hello"}),
            },
            LlmReply::Text("The command printed: hello".into()),
        ],
    )
    .await;

    let adapter = Arc::new(RecordingAdapter::default());
    let message = UnifiedMessage::text_message("telegram", "1", "1", "echo hello");
    let output = core.handle_message(message, adapter).await.unwrap();
    assert!(output.contains("hello"));

    // The second model call must have seen an ok observation with the output.
    let calls = llm.calls.lock().unwrap();
    let history = &calls[1].history;
    let observation = history
        .iter()
        .flat_map(|t| &t.parts)
        .find_map(|p| match p {
            MessagePart::FunctionResponse { name, content } if name == "bash" => Some(content),
            _ => None,
        })
        .expect("bash observation present");
    assert_eq!(observation["ok"], true);
    assert!(observation["data"]["output"]
        .as_str()
        .unwrap()
        .contains("hello"));
}

#[tokio::test]
async fn extension_runs_and_delivers_emitted_files() {
    let tmp = tempfile::tempdir().unwrap();
    write_skill(
        tmp.path(),
        "builtin",
        "download_video",
        "touch \"$EXT_OUT_DIR/video.mp4\"\n\
         echo '{\"ok\": true, \"text\": \"downloaded\", \"ui\": {\"send_files\": true}, \"files\": [\"video.mp4\"]}'\n",
    );
    let (core, _llm, _) = core_with_script(
        tmp.path(),
        vec![
            LlmReply::FunctionCall {
                name: "run_extension".into(),
                args: json!({
                    "skill_name": "download_video",
                    "args": {"url": "https://example.com/video.mp4"},
                }),
            },
            LlmReply::Text("已下载视频。".into()),
        ],
    )
    .await;

    let adapter = Arc::new(RecordingAdapter::default());
    let message =
        UnifiedMessage::text_message("telegram", "1", "1", "下载 https://example.com/video.mp4");
    let output = core.handle_message(message, adapter.clone()).await.unwrap();
    assert!(output.contains("下载"));

    let documents = adapter.documents.lock().unwrap();
    assert_eq!(documents.len(), 1);
    assert!(documents[0].ends_with("video.mp4"));
}

#[tokio::test]
async fn worker_dispatch_runs_a_nested_loop_and_reports_back() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, llm, _) = core_with_script(
        tmp.path(),
        vec![
            LlmReply::FunctionCall {
                name: "list_workers".into(),
                args: json!({}),
            },
            LlmReply::FunctionCall {
                name: "dispatch_worker".into(),
                args: json!({
                    "worker_id": "worker-main",
                    "instruction": "deploy uptime-kuma, then verify_access",
                }),
            },
            // Nested worker loop: terminal structured result.
            LlmReply::Text("verify_access passed; uptime-kuma listening at http://host:20001".into()),
            // Manager paraphrases the worker's structured result.
            LlmReply::Text("部署完成：http://host:20001".into()),
        ],
    )
    .await;

    let adapter = Arc::new(RecordingAdapter::default());
    let message = UnifiedMessage::text_message("telegram", "1", "1", "部署 uptime-kuma");
    let output = core.handle_message(message, adapter).await.unwrap();
    assert!(output.contains("20001"));
    assert_eq!(llm.call_count(), 4);

    // The worker task log has a completed entry with the structured result.
    let tasks = core
        .orchestrator
        .workers()
        .task_store()
        .list_recent(Some("worker-main"), 5)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, "done");
    assert!(tasks[0].result.contains("verify_access"));

    // The envelope records the assignment.
    let task = &core.inbox.list_recent(Some("1"), 1).await[0];
    assert_eq!(task.assigned_worker_id, "worker-main");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn three_identical_tool_calls_trip_the_circuit_breaker() {
    let tmp = tempfile::tempdir().unwrap();
    let call = LlmReply::FunctionCall {
        name: "bash".into(),
        args: json!({"command": "echo loop"}),
    };
    let (core, llm, _) = core_with_script(
        tmp.path(),
        vec![call.clone(), call.clone(), call.clone(), call],
    )
    .await;

    let adapter = Arc::new(RecordingAdapter::default());
    let message = UnifiedMessage::text_message("telegram", "1", "1", "loop forever");
    let err = core.handle_message(message, adapter).await.unwrap_err();
    assert!(err.to_string().contains("loop_detected"));
    // Terminates within one further turn of the third identical call.
    assert_eq!(llm.call_count(), 3);

    let task = &core.inbox.list_recent(Some("1"), 1).await[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
}

#[tokio::test]
async fn turn_budget_exhaustion_fails_the_task() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::for_data_dir(tmp.path());
    config.max_turns = 2;
    let replies: Vec<LlmReply> = (0..2)
        .map(|i| LlmReply::FunctionCall {
            name: "bash".into(),
            args: json!({"command": format!("echo step-{i}")}),
        })
        .collect();
    let llm = Arc::new(MockLlm::scripted(replies));
    let core = AgentCore::bootstrap(config, llm, None, Arc::new(RecordingAdapter::default()))
        .await
        .unwrap();

    let adapter = Arc::new(RecordingAdapter::default());
    let message = UnifiedMessage::text_message("telegram", "1", "1", "never finish");
    let err = core.handle_message(message, adapter).await.unwrap_err();
    assert!(err.to_string().contains("turn_budget_exhausted"));
}

#[tokio::test]
async fn worker_profile_cannot_reach_manager_only_tools() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, llm, _) = core_with_script(
        tmp.path(),
        vec![
            LlmReply::FunctionCall {
                name: "dispatch_worker".into(),
                args: json!({"worker_id": "worker-main", "instruction": "recurse"}),
            },
            LlmReply::Text("understood, finishing without dispatch".into()),
        ],
    )
    .await;

    let worker = core
        .orchestrator
        .workers()
        .registry()
        .get_worker("worker-main")
        .await
        .unwrap();
    let result = core
        .orchestrator
        .run_worker_task(&worker, "try to dispatch another worker")
        .await
        .unwrap();
    assert!(result.contains("finishing"));

    // The rejected call produced an unauthorized observation and the tool
    // itself never executed (no worker task log entry was created).
    let calls = llm.calls.lock().unwrap();
    let observation = calls[1]
        .history
        .iter()
        .flat_map(|t| &t.parts)
        .find_map(|p| match p {
            MessagePart::FunctionResponse { content, .. } => Some(content),
            _ => None,
        })
        .expect("observation present");
    assert_eq!(observation["ok"], false);
    assert_eq!(observation["error_code"], "unauthorized");

    let tasks = core
        .orchestrator
        .workers()
        .task_store()
        .list_recent(None, 10)
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn heartbeat_ok_is_suppressed_and_notice_is_delivered() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, _llm, delivery) = core_with_script(
        tmp.path(),
        vec![
            LlmReply::Text("HEARTBEAT_OK".into()),
            LlmReply::Text("2 new RSS items in your subscriptions".into()),
        ],
    )
    .await;

    core.heartbeat
        .store()
        .enable_user(
            "7",
            60,
            vec!["Check RSS subscriptions".into()],
            Some(xbot::core::heartbeat::DeliveryTarget {
                platform: "telegram".into(),
                chat_id: "7".into(),
            }),
        )
        .await
        .unwrap();

    // Quiet tick: sentinel output, nothing delivered.
    let result = core.heartbeat.run_user_now("7").await.unwrap();
    assert_eq!(result, "HEARTBEAT_OK");
    assert!(delivery.replies.lock().unwrap().is_empty());

    // Tick with findings: a graded NOTICE is pushed to the target.
    let result = core.heartbeat.run_user_now("7").await.unwrap();
    assert!(result.contains("RSS"));
    let pushed = delivery.replies.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    assert!(pushed[0].starts_with("[NOTICE]"));

    // Both runs were graded into the heartbeat log.
    let log = std::fs::read_to_string(
        core.heartbeat.store().heartbeat_log_path("7"),
    )
    .unwrap();
    assert!(log.contains("[OK]"));
    assert!(log.contains("[NOTICE]"));
}

/// Model double that delays each reply, to make ordering observable.
struct SlowLlm {
    delay: Duration,
    replies: Mutex<VecDeque<LlmReply>>,
}

#[async_trait]
impl LlmClient for SlowLlm {
    async fn generate(
        &self,
        _system_prompt: &str,
        _history: &[ChatTurn],
        _tools: &[ToolDefinition],
    ) -> Result<LlmReply> {
        tokio::time::sleep(self.delay).await;
        self.replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
}

#[tokio::test]
async fn same_session_tasks_complete_in_submission_order() {
    let tmp = tempfile::tempdir().unwrap();
    let llm = Arc::new(SlowLlm {
        delay: Duration::from_millis(150),
        replies: Mutex::new(
            vec![
                LlmReply::Text("first answer".into()),
                LlmReply::Text("second answer".into()),
            ]
            .into(),
        ),
    });
    let core = AgentCore::bootstrap(
        Config::for_data_dir(tmp.path()),
        llm,
        None,
        Arc::new(RecordingAdapter::default()),
    )
    .await
    .unwrap();

    let first = core
        .inbox
        .submit(SubmitRequest::new(TaskSource::UserChat, "one", "1"))
        .await
        .unwrap();
    let second = core
        .inbox
        .submit(SubmitRequest::new(TaskSource::UserChat, "two", "1"))
        .await
        .unwrap();

    let completions = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for task in [first.clone(), second.clone()] {
        let core = core.clone();
        let completions = completions.clone();
        handles.push(tokio::spawn(async move {
            let adapter = Arc::new(RecordingAdapter::default());
            let message =
                UnifiedMessage::text_message("telegram", &task.user_id, "1", &task.goal);
            let ctx = xbot::core::platform::UnifiedContext::new(message, "s1", adapter);
            core.orchestrator.handle_task(&ctx, &task.task_id).await.unwrap();
            completions.lock().await.push(task.task_id.clone());
        }));
        // Stagger the spawns so the first grabs the session lock first.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let order = completions.lock().await.clone();
    assert_eq!(order, vec![first.task_id, second.task_id]);
}

#[tokio::test]
async fn cancelled_pending_task_never_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let (core, llm, _) = core_with_script(tmp.path(), vec![]).await;
    let task = core
        .inbox
        .submit(SubmitRequest::new(TaskSource::Cron, "later", "1"))
        .await
        .unwrap();
    core.inbox.cancel(&task.task_id).await.unwrap();

    // The pump skips it: it is no longer pending.
    assert_eq!(core.dispatch_pending_once().await.unwrap(), 0);
    assert_eq!(llm.call_count(), 0);
    let task = core.inbox.get(&task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
}
