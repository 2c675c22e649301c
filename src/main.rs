//! taskrelay: operator CLI over the task and transcript APIs.
//!
//! Loads configuration, builds the HTTP collaborators, and runs one command
//! against them. `watch` keeps the background status poller running and
//! prints its notifications until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info};

use taskrelay::constants::{APP_NAME, APP_VERSION};
use taskrelay::logging;
use taskrelay::{
    FollowUpOutcome, HttpApi, MessageKind, Reconciliation, RelayConfig, SessionTracker,
    StatusPoller, TaskEvent, TaskId, TaskStore,
};

const USAGE: &str = "\
usage: taskrelay [-v] <command>

commands:
  list                    list tasks, newest first
  status <id>             show a task and its remote status
  transcript <id>         print the transcript of a task's current session
  follow-up <id> <text>   send a follow-up instruction to a task's session
  watch                   poll background tasks and print notifications
  help                    show this message
  version                 print the version";

// ── Entry point ──────────────────────────────────────────────────────

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = take_flag(&mut args, &["-v", "--verbose"]);

    if let Err(error) = logging::init(verbose) {
        eprintln!("{error:#}");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    let before = args.len();
    args.retain(|arg| !names.contains(&arg.as_str()));
    args.len() != before
}

fn run(args: Vec<String>) -> Result<()> {
    let mut parts = args.iter().map(String::as_str);
    let cmd = parts.next().unwrap_or("help");
    let rest: Vec<&str> = parts.collect();

    match cmd {
        "help" | "-h" | "--help" => {
            println!("{USAGE}");
            return Ok(());
        }
        "version" | "-V" | "--version" => {
            println!("{APP_NAME} {APP_VERSION}");
            return Ok(());
        }
        _ => {}
    }

    let (config, source) = RelayConfig::load()?;
    debug!(source = %source.label(), api = %config.api_base_url, "configuration loaded");
    let relay = Relay::new(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;

    runtime.block_on(async move {
        match cmd {
            "list" => relay.list().await,
            "status" => relay.status(task_arg(&rest)?).await,
            "transcript" => relay.transcript(task_arg(&rest)?).await,
            "follow-up" | "followup" => {
                let id = task_arg(&rest)?;
                let text = rest[1..].join(" ");
                if text.trim().is_empty() {
                    bail!("follow-up needs an instruction\n\n{USAGE}");
                }
                relay.follow_up(id, &text).await
            }
            "watch" => relay.watch().await,
            other => bail!("unknown command: {other}\n\n{USAGE}"),
        }
    })
}

fn task_arg(rest: &[&str]) -> Result<TaskId> {
    match rest.first() {
        Some(id) => Ok(TaskId::from(*id)),
        None => bail!("missing task id\n\n{USAGE}"),
    }
}

// ── Commands ─────────────────────────────────────────────────────────

struct Relay {
    config: RelayConfig,
    store: Arc<TaskStore>,
    tracker: SessionTracker,
}

impl Relay {
    fn new(config: RelayConfig) -> Result<Self> {
        let api = Arc::new(HttpApi::from_config(&config)?);
        let store = Arc::new(TaskStore::new(api.clone()));
        let tracker = SessionTracker::new(
            store.clone(),
            api,
            config.container_path.clone(),
            config.retry_policy(),
        );
        Ok(Self {
            config,
            store,
            tracker,
        })
    }

    async fn list(&self) -> Result<()> {
        self.store.refresh().await?;
        for task in self.store.list() {
            let last_run = task
                .last_run
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            let enabled = if task.enabled { "" } else { " (disabled)" };
            println!(
                "{:<12} {:<10} {:<11} {:<16} {}{}",
                task.id,
                task.status,
                format!("{:?}", task.execution_mode).to_lowercase(),
                last_run,
                task.name,
                enabled
            );
        }
        Ok(())
    }

    async fn status(&self, id: TaskId) -> Result<()> {
        self.store.refresh().await?;
        let Some(task) = self.store.get(&id) else {
            bail!("task {id} not found");
        };
        let report = self.store.api().status(&id).await?;
        println!("{}  {}", task.id, task.name);
        println!("  goal:     {}", task.goal);
        println!("  status:   {}", report.status);
        println!(
            "  session:  {}",
            task.session_id
                .as_ref()
                .map_or("none", |session_id| session_id.as_str())
        );
        if let Some(pointer) = report.result_pointer.as_deref() {
            println!("  result:   {pointer}");
        }
        Ok(())
    }

    async fn transcript(&self, id: TaskId) -> Result<()> {
        self.store.refresh().await?;
        for message in self.tracker.load(&id).await? {
            let who = match message.kind {
                MessageKind::User => "user",
                MessageKind::Assistant => "assistant",
            };
            let at = message.timestamp.format("%H:%M:%S");
            if message.is_tool_invocation() {
                let state = match (message.tool_error, message.is_pending()) {
                    (_, true) => "pending",
                    (Some(true), _) => "error",
                    _ => "ok",
                };
                println!("[{at}] {who} ⚙ {} ({state})", message.content);
            } else {
                println!("[{at}] {who}: {}", message.content);
            }
        }
        Ok(())
    }

    async fn follow_up(&self, id: TaskId, text: &str) -> Result<()> {
        self.store.refresh().await?;
        let outcome = self
            .tracker
            .follow_up(&id, text, self.config.notification_settings.clone())
            .await?;
        match outcome {
            FollowUpOutcome::Applied {
                response,
                reconciliation,
            } => {
                println!("follow-up sent on session {}", response.session_id);
                if let Reconciliation::Superseded {
                    previous,
                    persisted,
                    ..
                } = reconciliation
                {
                    let previous = previous.map(|s| s.to_string()).unwrap_or_default();
                    println!("  session changed from {previous} (persisted: {persisted})");
                }
            }
            FollowUpOutcome::Stale => println!("session moved on; response ignored"),
        }
        Ok(())
    }

    async fn watch(&self) -> Result<()> {
        let count = self.store.refresh().await?;
        let running = self.store.running_background().len();
        info!(count, running, "watching background tasks");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = Arc::new(StatusPoller::new(self.store.clone(), tx));
        let handle = poller.spawn(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = rx.recv() => match event {
                    Some(event) => print_event(&event),
                    None => break,
                },
            }
        }

        handle.stop().await;
        Ok(())
    }
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::Completed {
            task_name,
            result_pointer,
            timestamp,
            ..
        } => {
            let at = timestamp.format("%H:%M:%S");
            match result_pointer {
                Some(pointer) => println!("[{at}] ✔ {task_name} completed → {pointer}"),
                None => println!("[{at}] ✔ {task_name} completed"),
            }
        }
        TaskEvent::Failed {
            task_name,
            reason,
            timestamp,
            ..
        } => {
            let at = timestamp.format("%H:%M:%S");
            let reason = reason.as_deref().unwrap_or("see task log");
            println!("[{at}] ✘ {task_name} failed: {reason}");
        }
        TaskEvent::DetailChanged { task_id } => debug!(%task_id, "task detail changed"),
        TaskEvent::Output { task_id, data } => println!("{task_id}: {data}"),
    }
}
