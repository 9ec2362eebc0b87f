//! Orchestrator process: `ticketflow serve`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use ticketflow::api::{self, AppState};
use ticketflow::config::FlowConfig;
use ticketflow::dispatch::{BrokerDispatcher, PollDispatcher, PollService, TaskDispatch};
use ticketflow::models::{Provider, TaskType, WorkerMode};
use ticketflow::orchestrator::Orchestrator;
use ticketflow::scheduler::{Scheduler, shutdown_channel, supervise};
use ticketflow::sync::{CredentialProvider, GitHubIssueSource, StaticCredentials, SyncEngine};

use super::{broker_manager, open_db, stop_on_ctrl_c};

pub async fn cmd_serve(config: FlowConfig) -> Result<()> {
    let db = open_db(&config)?;
    let manager = broker_manager(&config, "ticketflow-serve");

    let credentials = Arc::new(StaticCredentials::new(config.github.token.clone()));
    let reference = credentials.reference(Provider::Github);
    let engine = SyncEngine::new(db.clone()).with_source(Arc::new(GitHubIssueSource::new(
        &config.github.api_url,
        credentials,
    )));
    let dispatcher: Arc<dyn TaskDispatch> = match config.dispatch.mode {
        WorkerMode::Broker => Arc::new(BrokerDispatcher::new(manager.clone())),
        WorkerMode::Poll => Arc::new(PollDispatcher::new(db.clone())),
    };
    let orchestrator = Arc::new(
        Orchestrator::new(
            db.clone(),
            manager.clone(),
            engine,
            dispatcher,
            config.dispatch.auto_implement,
        )
        .with_credential_reference(reference)
        .with_prefetch(config.queues.prefetch),
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut handles = Vec::new();

    let o = orchestrator.clone();
    handles.push(tokio::spawn(supervise("task-sync", shutdown_rx.clone(), move || {
        o.clone().consume_sync()
    })));
    let o = orchestrator.clone();
    handles.push(tokio::spawn(supervise("task-eval", shutdown_rx.clone(), move || {
        o.clone().consume_tasks(TaskType::Evaluation)
    })));
    let o = orchestrator.clone();
    handles.push(tokio::spawn(supervise("task-impl", shutdown_rx.clone(), move || {
        o.clone().consume_tasks(TaskType::Implementation)
    })));
    let o = orchestrator.clone();
    handles.push(tokio::spawn(supervise(
        "worker-responses",
        shutdown_rx.clone(),
        move || o.clone().consume_responses(),
    )));

    let scheduler = Scheduler::new(
        db.clone(),
        orchestrator.enqueuer().clone(),
        config.sync.clone(),
        config.poll.clone(),
    );
    handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    info!(
        mode = %config.dispatch.mode,
        auto_implement = config.dispatch.auto_implement,
        bind = %config.server.bind,
        "ticketflow serving"
    );
    stop_on_ctrl_c(shutdown_tx.clone());

    let state = Arc::new(AppState {
        poll: PollService::new(db.clone(), orchestrator.responses().clone()),
    });
    let served = api::start_server(&config.server.bind, state, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task panicked");
        }
    }
    if let Err(e) = manager.close().await {
        warn!(error = %e, "failed to close broker connection");
    }
    served
}
