//! Operational CLI. Exit codes: 0 success, 2 user error, 3 state corruption
//! requiring manual review.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use console::style;

use crate::core::agent::AgentCore;
use crate::core::config::Config;
use crate::core::inbox::TaskInbox;
use crate::core::llm::openai::OpenAiClient;
use crate::core::platform::SilentAdapter;
use crate::core::state::{StateError, StateStore};
use crate::core::worker::{WorkerRegistry, WorkerTaskStore};
use crate::logging::init_logging;

const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 2;
const EXIT_STATE_CORRUPT: i32 = 3;

fn print_help() {
    println!("{}", style("xbot - agentic core").bold());
    println!();
    println!("  {}", style("Core").bold());
    println!("    daemon                     Run the agent core");
    println!();
    println!("  {}", style("Operations").bold());
    println!("    list-tasks [--limit N]     Show recent task envelopes");
    println!("    inspect-worker <id>        Show a worker and its recent tasks");
    println!("    replay-task <id>           Resubmit a past task's goal");
    println!("    cancel-task <id>           Cancel a pending or running task");
    println!("    migrate-state --apply|--dry-run");
    println!("                               Rewrite legacy state files as canonical");
    println!();
    println!(
        "  {} {} <command> [args]",
        style("Usage:").bold(),
        style("xbot").green()
    );
}

fn parse_limit(args: &[String], default: usize) -> usize {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--limit" && i + 1 < args.len() {
            return args[i + 1].parse().unwrap_or(default);
        }
        i += 1;
    }
    default
}

pub async fn run_main() -> Result<i32> {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_help();
        return Ok(EXIT_OK);
    };

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(EXIT_OK)
        }
        "daemon" => run_daemon().await,
        "list-tasks" => list_tasks(parse_limit(&args[1..], 30)).await,
        "inspect-worker" => match args.get(1) {
            Some(worker_id) => inspect_worker(worker_id).await,
            None => {
                eprintln!("usage: xbot inspect-worker <id>");
                Ok(EXIT_USER_ERROR)
            }
        },
        "replay-task" => match args.get(1) {
            Some(task_id) => replay_task(task_id).await,
            None => {
                eprintln!("usage: xbot replay-task <id>");
                Ok(EXIT_USER_ERROR)
            }
        },
        "cancel-task" => match args.get(1) {
            Some(task_id) => cancel_task(task_id).await,
            None => {
                eprintln!("usage: xbot cancel-task <id>");
                Ok(EXIT_USER_ERROR)
            }
        },
        "migrate-state" => {
            let apply = args.iter().any(|a| a == "--apply");
            let dry_run = args.iter().any(|a| a == "--dry-run");
            if apply == dry_run {
                eprintln!("usage: xbot migrate-state --apply|--dry-run");
                return Ok(EXIT_USER_ERROR);
            }
            migrate_state(apply).await
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            Ok(EXIT_USER_ERROR)
        }
    }
}

async fn run_daemon() -> Result<i32> {
    let config = Config::from_env()?;
    let llm = Arc::new(OpenAiClient::new(
        &config.llm_api_base,
        &config.llm_api_key,
        &config.llm_model,
    ));
    let core = AgentCore::bootstrap(config, llm, None, Arc::new(SilentAdapter)).await?;
    core.run_forever().await?;
    Ok(EXIT_OK)
}

async fn list_tasks(limit: usize) -> Result<i32> {
    let config = Config::from_env()?;
    let inbox = TaskInbox::open(&config.data_dir).await?;
    let tasks = inbox.list_recent(None, limit).await;
    if tasks.is_empty() {
        println!("no tasks recorded");
        return Ok(EXIT_OK);
    }
    for task in tasks {
        println!(
            "{}  {:<10} {:<9} user={:<8} {}",
            style(&task.task_id[..8.min(task.task_id.len())]).dim(),
            format!("{:?}", task.source).to_lowercase(),
            style(format!("{:?}", task.status).to_lowercase()).cyan(),
            task.user_id,
            task.goal.chars().take(60).collect::<String>()
        );
    }
    Ok(EXIT_OK)
}

async fn inspect_worker(worker_id: &str) -> Result<i32> {
    let config = Config::from_env()?;
    let registry = WorkerRegistry::new(&config.data_dir);
    let Some(worker) = registry.get_worker(worker_id).await else {
        eprintln!("worker not found: {worker_id}");
        return Ok(EXIT_USER_ERROR);
    };
    println!("{}", style(&worker.name).bold());
    println!("  id:         {}", worker.worker_id);
    println!("  backend:    {}", worker.backend.as_str());
    println!("  status:     {:?}", worker.status);
    println!("  workspace:  {}", worker.workspace_path.display());
    if !worker.capabilities.is_empty() {
        println!("  skills:     {}", worker.capabilities.join(", "));
    }
    if !worker.last_error.is_empty() {
        println!("  last error: {}", style(&worker.last_error).red());
    }

    let tasks = WorkerTaskStore::new(&config.data_dir);
    let recent = tasks.list_recent(Some(&worker.worker_id), 10).await?;
    if !recent.is_empty() {
        println!("\n  {}", style("recent tasks").bold());
        for task in recent {
            println!(
                "    {}  {:<8} {}",
                style(&task.task_id).dim(),
                task.status,
                task.instruction.chars().take(60).collect::<String>()
            );
        }
    }
    Ok(EXIT_OK)
}

async fn replay_task(task_id: &str) -> Result<i32> {
    let config = Config::from_env()?;
    let inbox = TaskInbox::open(&config.data_dir).await?;
    let Some(task) = inbox.get(task_id).await else {
        eprintln!("task not found: {task_id}");
        return Ok(EXIT_USER_ERROR);
    };
    let replay = inbox
        .submit(
            crate::core::inbox::SubmitRequest::new(task.source, &task.goal, &task.user_id)
                .platform(&task.platform)
                .priority(task.priority)
                .requires_reply(task.requires_reply),
        )
        .await?;
    println!(
        "resubmitted {} as {}",
        style(task_id).dim(),
        style(&replay.task_id).green()
    );
    Ok(EXIT_OK)
}

async fn cancel_task(task_id: &str) -> Result<i32> {
    let config = Config::from_env()?;
    let inbox = TaskInbox::open(&config.data_dir).await?;
    match inbox.cancel(task_id).await {
        Ok(task) => {
            println!("cancelled {}", style(&task.task_id).green());
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("cannot cancel: {e}");
            Ok(EXIT_USER_ERROR)
        }
    }
}

fn collect_state_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            // Chat transcripts and heartbeat logs are outside the protocol.
            if name == "chat" || name == "heartbeat" || name == "ext" {
                continue;
            }
            collect_state_files(&path, out);
        } else if (name.ends_with(".md") || name.ends_with(".MD"))
            && !name.contains(".bak-")
            && name != "HEARTBEAT.md"
        {
            out.push(path);
        }
    }
}

async fn migrate_state(apply: bool) -> Result<i32> {
    let config = Config::from_env()?;
    let store = StateStore::new(&config.data_dir);

    let mut candidates = Vec::new();
    for sub in ["users", "system", "kernel"] {
        collect_state_files(&config.data_dir.join(sub), &mut candidates);
    }

    let mut migrated = 0usize;
    let mut corrupt = Vec::new();
    for path in candidates {
        match store.migrate_file(&path, apply).await {
            Ok(Some(kind)) => {
                migrated += 1;
                println!(
                    "{} {} ({kind:?})",
                    if apply {
                        style("migrated").green()
                    } else {
                        style("would migrate").yellow()
                    },
                    path.display()
                );
            }
            Ok(None) => {}
            Err(StateError::Parse { path }) => {
                corrupt.push(path.clone());
                println!("{} {}", style("corrupt").red(), path.display());
            }
            Err(StateError::Io { path, source }) => {
                eprintln!("io error at {}: {source}", path.display());
            }
        }
    }

    println!(
        "{migrated} file(s) {}, {} corrupt",
        if apply { "migrated" } else { "pending migration" },
        corrupt.len()
    );
    if !corrupt.is_empty() {
        eprintln!("corrupt state files need manual review:");
        for path in &corrupt {
            eprintln!("  {}", path.display());
        }
        return Ok(EXIT_STATE_CORRUPT);
    }
    Ok(EXIT_OK)
}
