//! CLI command handlers.
//!
//! Every command except `run` works on the files directly, without starting
//! a scheduler, so nothing is dispatched as a side effect.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use deferq_core::{Clock, Error, SystemClock};
use deferq_queue::{HandlerError, PersistedTask, PersistentQueue, QueueConfig, TaskMap, handler_fn};
use deferq_snapshot::durable::recover_snapshot;
use deferq_snapshot::{LocalFileStorage, Recovery, SnapshotStore};
use tokio::signal;
use tracing::{error, info};
use uuid::Uuid;

use crate::cli::{Cli, Commands};

/// Execute a CLI command.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.file).await?;

    match cli.command {
        Commands::Inspect { expired, json } => cmd_inspect(&config, expired, json).await,
        Commands::Stats { json } => cmd_stats(&config, json).await,
        Commands::Recover => cmd_recover(&config).await,
        Commands::Enqueue {
            key,
            payload,
            delay_secs,
            id,
        } => {
            let id = enqueue_task(&config, id, key, payload, delay_secs).await?;
            println!("{id}");
            Ok(())
        }
        Commands::Run { patterns } => cmd_run(config, patterns).await,
    }
}

/// Load the configuration file if given, then apply `--file`.
async fn resolve_config(path: Option<&Path>, file: Option<String>) -> Result<QueueConfig> {
    let mut config = match path {
        Some(path) => QueueConfig::load(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => QueueConfig::default(),
    };

    if let Some(file) = file {
        config.pending_file = file;
    }

    config
        .validate()
        .context("No usable queue configuration; pass --file or --config")?;
    Ok(config)
}

/// Read a task file, recovering an interrupted save first.
async fn load_tasks(file: &str) -> Result<Vec<PersistedTask>> {
    let store = SnapshotStore::<TaskMap>::open(file)
        .await
        .with_context(|| format!("Failed to open {file}"))?;

    let mut tasks: Vec<PersistedTask> = store.read(|tasks| tasks.values().cloned().collect()).await;
    tasks.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
    Ok(tasks)
}

/// List tasks in the pending or expired file.
async fn cmd_inspect(config: &QueueConfig, expired: bool, json: bool) -> Result<()> {
    let file = if expired {
        config.expired_file_name()
    } else {
        config.pending_file.clone()
    };
    let tasks = load_tasks(&file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks in {file}");
        return Ok(());
    }

    let now = Utc::now();
    for task in &tasks {
        let state = if task.is_due(now) { "due" } else { "waiting" };
        println!(
            "{}  {:<7}  {}  {}  ({} bytes)",
            task.due_at.to_rfc3339(),
            state,
            task.id,
            task.routing_key,
            task.payload.len()
        );
    }
    Ok(())
}

async fn cmd_stats(config: &QueueConfig, json: bool) -> Result<()> {
    let pending = load_tasks(&config.pending_file).await?.len();
    let expired = load_tasks(&config.expired_file_name()).await?.len();

    if json {
        let stats = serde_json::json!({ "pending": pending, "expired": expired });
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Pending: {pending}");
        println!("Expired: {expired}");
    }
    Ok(())
}

/// Recover both files of a queue.
async fn cmd_recover(config: &QueueConfig) -> Result<()> {
    for (file, recovery) in recover_files(config).await? {
        println!("{file}: {}", describe(recovery));
    }
    Ok(())
}

async fn recover_files(config: &QueueConfig) -> Result<Vec<(String, Recovery)>> {
    let storage = LocalFileStorage::default();
    let mut outcomes = Vec::new();

    for file in [config.pending_file.clone(), config.expired_file_name()] {
        let recovery = recover_snapshot(&storage, &file)
            .await
            .with_context(|| format!("Failed to recover {file}"))?;
        outcomes.push((file, recovery));
    }
    Ok(outcomes)
}

const fn describe(recovery: Recovery) -> &'static str {
    match recovery {
        Recovery::Clean => "clean",
        Recovery::RestoredFromBackup => "restored from backup",
        Recovery::DiscardedStaleBackup => "discarded stale backup",
    }
}

/// Write a task straight into the pending file. It is armed the next time a
/// queue opens the file.
async fn enqueue_task(
    config: &QueueConfig,
    id: Option<String>,
    key: String,
    payload: Option<String>,
    delay_secs: u64,
) -> Result<String> {
    if key.is_empty() {
        bail!("Routing key must not be empty");
    }
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if id.is_empty() {
        bail!("Task id must not be empty");
    }

    let due_at = SystemClock.deadline(Duration::from_secs(delay_secs));
    let task = PersistedTask::new(
        id.clone(),
        key,
        payload.map(String::into_bytes).unwrap_or_default(),
        due_at,
    );

    let expired = load_tasks(&config.expired_file_name()).await?;
    if expired.iter().any(|parked| parked.id == id) {
        return Err(Error::already_exists("task", id)).context("Task id is taken by an expired task");
    }

    let store = SnapshotStore::<TaskMap>::open(config.pending_file.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.pending_file))?;

    store
        .change(|tasks| {
            if tasks.contains_key(&task.id) {
                return Err(Error::already_exists("task", task.id.clone()));
            }
            tasks.insert(task.id.clone(), task.clone());
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to enqueue task {id}"))?;

    info!(task_id = %id, routing_key = %task.routing_key, due_at = %due_at, "Task written");
    Ok(id)
}

/// Run a worker that logs deliveries until Ctrl+C.
async fn cmd_run(config: QueueConfig, patterns: Vec<String>) -> Result<()> {
    let mut builder = PersistentQueue::builder(config);
    for pattern in patterns {
        builder = builder.handler(
            pattern,
            handler_fn(|_ctx, task: PersistedTask| async move {
                info!(
                    task_id = %task.id,
                    routing_key = %task.routing_key,
                    payload_bytes = task.payload.len(),
                    "Task delivered"
                );
                Ok::<(), HandlerError>(())
            }),
        );
    }

    let queue = builder.open().await.context("Failed to open queue")?;
    let stats = queue.stats().await;
    let handlers = queue.handler_patterns().await;
    info!(
        pending = stats.pending,
        expired = stats.expired,
        handlers = ?handlers,
        "deferq is running. Press Ctrl+C to stop."
    );

    wait_for_shutdown().await;

    queue.stop().await.context("Failed to stop queue cleanly")?;
    info!("deferq stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use deferq_core::ErrorKind;
    use deferq_snapshot::durable::backup_name;
    use tempfile::TempDir;

    use super::*;

    fn pending_path(dir: &TempDir) -> String {
        dir.path().join("queue.json").to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_file_flag_is_enough() {
        let config = resolve_config(None, Some("jobs.json".into())).await.unwrap();
        assert_eq!(config.pending_file, "jobs.json");
        assert_eq!(config.expired_file_name(), "jobs.json.expired");
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        assert!(resolve_config(None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_file_flag_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deferq.toml");
        std::fs::write(&path, "pending_file = \"a.json\"\nsweep_delay_ms = 10\n").unwrap();

        let config = resolve_config(Some(&path), Some("b.json".into())).await.unwrap();
        assert_eq!(config.pending_file, "b.json");
        assert_eq!(config.sweep_delay_ms, 10);
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_file() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new(pending_path(&dir));

        let late = enqueue_task(&config, Some("late".into()), "report:weekly".into(), None, 600)
            .await
            .unwrap();
        let soon = enqueue_task(&config, None, "email:welcome".into(), Some("hi".into()), 0)
            .await
            .unwrap();

        let tasks = load_tasks(&config.pending_file).await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, [soon.as_str(), late.as_str()]);
        assert_eq!(tasks[0].payload, b"hi");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_id() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new(pending_path(&dir));

        enqueue_task(&config, Some("t1".into()), "k".into(), None, 60).await.unwrap();
        let err = enqueue_task(&config, Some("t1".into()), "k".into(), None, 60)
            .await
            .unwrap_err();

        let cause = err.downcast_ref::<Error>().expect("queue error");
        assert_eq!(cause.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_id_of_expired_task() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new(pending_path(&dir));

        let mut parked = TaskMap::new();
        parked.insert(
            "late".into(),
            PersistedTask::new("late", "report:weekly", Vec::new(), Utc::now()),
        );
        std::fs::write(config.expired_file_name(), serde_json::to_vec(&parked).unwrap()).unwrap();

        let err = enqueue_task(&config, Some("late".into()), "k".into(), None, 0)
            .await
            .unwrap_err();

        let cause = err.downcast_ref::<Error>().expect("queue error");
        assert_eq!(cause.kind(), ErrorKind::AlreadyExists);
        assert!(load_tasks(&config.pending_file).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_key() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new(pending_path(&dir));
        assert!(enqueue_task(&config, None, String::new(), None, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_restores_orphaned_backup() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new(pending_path(&dir));
        std::fs::write(backup_name(&config.pending_file), b"{}").unwrap();

        let outcomes = recover_files(&config).await.unwrap();

        assert_eq!(outcomes[0].1, Recovery::RestoredFromBackup);
        assert_eq!(outcomes[1].1, Recovery::Clean);
        assert_eq!(std::fs::read(&config.pending_file).unwrap(), b"{}");
    }
}
