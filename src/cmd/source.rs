//! Task source and task commands: `add-source`, `sync`, `enqueue`, `tasks`,
//! `recover`, `init-db`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use ticketflow::config::FlowConfig;
use ticketflow::lifecycle::{LifecycleTracker, Transition};
use ticketflow::models::{Phase, Provider, Subject, TaskType};
use ticketflow::orchestrator::Enqueuer;
use ticketflow::scheduler::Scheduler;
use ticketflow::store::FlowDb;
use ticketflow::sync::{GitHubIssueSource, StaticCredentials, SyncEngine};

use super::{broker_manager, open_db, resolve_source};

pub fn cmd_init_db(config: &FlowConfig) -> Result<()> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    FlowDb::new(path)?;
    println!("Database initialized at {}", path.display());
    Ok(())
}

pub async fn cmd_add_source(
    config: &FlowConfig,
    name: &str,
    repository: &str,
    label: Option<&str>,
) -> Result<()> {
    if repository.split('/').filter(|s| !s.is_empty()).count() != 2 {
        anyhow::bail!("Repository must be owner/repo, got '{}'", repository);
    }
    let db = open_db(config)?;
    let (name, repository, label) = (name.to_string(), repository.to_string(), label.map(String::from));
    let source = db
        .call(move |db| {
            if db.find_task_source_by_name(&name)?.is_some() {
                anyhow::bail!("Task source '{}' already exists", name);
            }
            db.create_task_source(&name, Provider::Github, &repository, label.as_deref(), Utc::now())
        })
        .await?;
    println!(
        "Added source {}: {} ({}{})",
        source.id,
        source.name,
        source.repository,
        source
            .filter
            .as_deref()
            .map(|l| format!(", label {}", l))
            .unwrap_or_default()
    );
    Ok(())
}

/// Enqueue a sync, or with `now` run the pass in-process and print the
/// report.
pub async fn cmd_sync(config: &FlowConfig, key: &str, now: bool) -> Result<()> {
    let db = open_db(config)?;
    let source = resolve_source(&db, key).await?;

    if !now {
        let manager = broker_manager(config, "ticketflow-cli");
        let enqueued = Enqueuer::new(db, manager.clone())
            .enqueue_sync(source.id)
            .await?;
        manager.close().await?;
        if enqueued {
            println!("Sync enqueued for {}", source.name);
        } else {
            println!("Sync already in flight for {}", source.name);
        }
        return Ok(());
    }

    let tracker = LifecycleTracker::new(db.clone());
    let subject = Subject::Source(source.id);
    tracker.transition(subject, Transition::Enqueue).await?;
    tracker.transition(subject, Transition::Start).await?;

    let credentials = Arc::new(StaticCredentials::new(config.github.token.clone()));
    let engine = SyncEngine::new(db.clone())
        .with_source(Arc::new(GitHubIssueSource::new(&config.github.api_url, credentials)));
    let started_at = Utc::now();
    match engine.run_pass_at(source.id, started_at).await {
        Ok(report) => {
            tracker.transition(subject, Transition::Complete).await?;
            let id = source.id;
            db.call(move |db| db.record_sync_success(id, started_at)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.changed_tasks.is_empty() {
                println!();
                println!(
                    "{} task(s) changed. Use `ticketflow enqueue <id>` to evaluate them.",
                    report.changed_tasks.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            tracker.fail(subject, e.to_string()).await?;
            Err(e).with_context(|| format!("Sync of {} failed", source.name))
        }
    }
}

pub async fn cmd_enqueue(config: &FlowConfig, task_id: i64, task_type: TaskType) -> Result<()> {
    let db = open_db(config)?;
    let manager = broker_manager(config, "ticketflow-cli");
    let enqueuer = Enqueuer::new(db, manager.clone());
    let result = match task_type {
        TaskType::Evaluation => enqueuer.enqueue_evaluation(task_id).await.map(|queued| {
            if queued {
                println!("Evaluation enqueued for task {}", task_id);
            } else {
                println!("Evaluation already queued or running for task {}", task_id);
            }
        }),
        TaskType::Implementation => enqueuer
            .enqueue_implementation(task_id)
            .await
            .map(|()| println!("Implementation enqueued for task {}", task_id)),
    };
    manager.close().await?;
    Ok(result?)
}

pub async fn cmd_tasks(config: &FlowConfig, source: Option<&str>) -> Result<()> {
    let db = open_db(config)?;
    let source_id = match source {
        Some(key) => Some(resolve_source(&db, key).await?.id),
        None => None,
    };
    let tasks = db.call(move |db| db.list_tasks(source_id)).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:>5}  {:>8}  {:<10}  {:<12}  {:<12}  {:<14}  TITLE",
        "ID", "ISSUE", "SYNC", "EVALUATION", "IMPL", "VERDICT"
    );
    for task in tasks {
        println!(
            "{:>5}  {:>8}  {:<10}  {:<12}  {:<12}  {:<14}  {}",
            task.id,
            task.external_issue_id,
            task.sync_status.label(Phase::Sync),
            task.ai_evaluation_status.label(Phase::Evaluation),
            task.ai_implementation_status.label(Phase::Implementation),
            task.evaluation_verdict.map(|v| v.as_str()).unwrap_or("-"),
            task.title
        );
    }
    Ok(())
}

/// One stuck-state recovery pass.
pub async fn cmd_recover(config: &FlowConfig) -> Result<()> {
    let db = open_db(config)?;
    let manager = broker_manager(config, "ticketflow-cli");
    let scheduler = Scheduler::new(
        db.clone(),
        Enqueuer::new(db, manager.clone()),
        config.sync.clone(),
        config.poll.clone(),
    );
    let report = scheduler.recover_stuck(Utc::now()).await?;
    let offline = scheduler.sweep_workers(Utc::now()).await?;
    manager.close().await?;
    println!(
        "Requeued {} source(s), {} evaluation(s), {} implementation(s); {} worker(s) marked offline",
        report.sources.len(),
        report.evaluations.len(),
        report.implementations.len(),
        offline.len()
    );
    Ok(())
}
