//! Background loops hosted by `serve`: the sync timer, stuck-state recovery,
//! the poll-worker liveness sweep, and the supervisor that keeps queue
//! consumers alive across broker failures.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{PollSection, SyncSection};
use crate::errors::{LifecycleError, QueueError};
use crate::lifecycle::{LifecycleTracker, Transition};
use crate::models::{Phase, Subject, TaskType};
use crate::orchestrator::Enqueuer;
use crate::store::DbHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Shutdown signal shared by every background loop. Flip it with
/// `send(true)`; dropping the sender also stops the loops.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Run a consumer produced by `factory` until shutdown, restarting it with
/// exponential backoff whenever it returns.
pub async fn supervise<F, Fut>(name: &'static str, mut shutdown: watch::Receiver<bool>, mut factory: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), QueueError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let started = Instant::now();
        tokio::select! {
            result = factory() => match result {
                Ok(()) => info!(consumer = name, "consumer returned, restarting"),
                Err(e) => warn!(consumer = name, error = %e, "consumer failed, restarting"),
            },
            _ = shutdown.changed() => return,
        }

        // A consumer that ran for a while earned a fresh backoff.
        if started.elapsed() > MAX_BACKOFF {
            backoff = INITIAL_BACKOFF;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// What one recovery pass put back on the queues.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub sources: Vec<i64>,
    pub evaluations: Vec<i64>,
    pub implementations: Vec<i64>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.evaluations.is_empty() && self.implementations.is_empty()
    }
}

pub struct Scheduler {
    db: DbHandle,
    tracker: LifecycleTracker,
    enqueuer: Enqueuer,
    sync: SyncSection,
    poll: PollSection,
}

fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero())
}

impl Scheduler {
    pub fn new(db: DbHandle, enqueuer: Enqueuer, sync: SyncSection, poll: PollSection) -> Self {
        Self {
            tracker: LifecycleTracker::new(db.clone()),
            db,
            enqueuer,
            sync,
            poll,
        }
    }

    /// Enqueue a sync for every source whose last sync is older than the
    /// staleness threshold. Returns the sources actually enqueued.
    pub async fn trigger_due_syncs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<i64>> {
        let cutoff = before(now, self.sync.staleness_threshold());
        let due = self
            .db
            .call(move |db| db.list_sources_due_for_sync(cutoff))
            .await?;
        let mut enqueued = Vec::new();
        for source in due {
            match self.enqueuer.enqueue_sync(source.id).await {
                Ok(true) => enqueued.push(source.id),
                Ok(false) => {}
                Err(e) => warn!(task_source_id = source.id, error = %e, "failed to enqueue sync"),
            }
        }
        Ok(enqueued)
    }

    /// Requeue sources and task phases stuck in queued/active beyond the
    /// stuck timeout and publish their requests again. Poll claims on the
    /// requeued work are released so another worker can take it.
    pub async fn recover_stuck(&self, now: DateTime<Utc>) -> anyhow::Result<RecoveryReport> {
        let cutoff = before(now, self.sync.stuck_timeout());
        let mut report = RecoveryReport::default();

        let sources = self.db.call(move |db| db.list_stuck_sources(cutoff)).await?;
        for source in sources {
            if self.requeue(Subject::Source(source.id)).await? {
                report.sources.push(source.id);
            }
        }

        for task_type in [TaskType::Evaluation, TaskType::Implementation] {
            let phase = task_type.phase();
            let tasks = self
                .db
                .call(move |db| db.list_stuck_tasks(phase, cutoff))
                .await?;
            for task in tasks {
                let task_id = task.id;
                self.db
                    .call(move |db| db.delete_poll_dispatch_for_task(task_id, task_type))
                    .await?;
                if self.requeue(Subject::Task { id: task_id, phase }).await? {
                    match phase {
                        Phase::Implementation => report.implementations.push(task_id),
                        _ => report.evaluations.push(task_id),
                    }
                }
            }
        }

        if !report.is_empty() {
            info!(
                sources = report.sources.len(),
                evaluations = report.evaluations.len(),
                implementations = report.implementations.len(),
                "requeued stuck work"
            );
        }
        Ok(report)
    }

    async fn requeue(&self, subject: Subject) -> anyhow::Result<bool> {
        match self.tracker.transition(subject, Transition::Requeue).await {
            Ok(_) => {}
            // Finished between the query and the transition.
            Err(LifecycleError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.enqueuer.republish(subject).await?;
        warn!(%subject, "requeued stuck work");
        Ok(true)
    }

    /// Mark poll workers without a recent heartbeat offline.
    pub async fn sweep_workers(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<i64>> {
        let cutoff = before(now, self.poll.offline_after());
        let ids = self
            .db
            .call(move |db| db.mark_stale_workers_offline(cutoff))
            .await?;
        for id in &ids {
            info!(worker_id = id, "poll worker marked offline");
        }
        Ok(ids)
    }

    /// Sync trigger and recovery every `sync.check_interval`; liveness sweep
    /// every `poll.heartbeat_interval`. Runs until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sync_ticker = tokio::time::interval(self.sync.check_interval().max(Duration::from_secs(1)));
        let mut liveness_ticker =
            tokio::time::interval(self.poll.heartbeat_interval().max(Duration::from_secs(1)));
        info!(
            check_interval_secs = self.sync.check_interval_secs,
            sync_enabled = self.sync.enabled,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = sync_ticker.tick() => {
                    let now = Utc::now();
                    if self.sync.enabled {
                        match self.trigger_due_syncs(now).await {
                            Ok(ids) if !ids.is_empty() => debug!(count = ids.len(), "scheduled syncs"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "sync trigger failed"),
                        }
                    }
                    if let Err(e) = self.recover_stuck(now).await {
                        error!(error = %e, "stuck recovery failed");
                    }
                }
                _ = liveness_ticker.tick() => {
                    if let Err(e) = self.sweep_workers(Utc::now()).await {
                        error!(error = %e, "liveness sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExternalIssue, LifecycleStatus, Provider};
    use crate::queue::memory::MemoryBroker;
    use crate::queue::{BrokerManager, Topology};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        db: DbHandle,
        broker: MemoryBroker,
        scheduler: Scheduler,
        source_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = DbHandle::in_memory().unwrap();
        let source_id = db
            .call(|db| Ok(db.create_task_source("web", Provider::Github, "o/r", None, Utc::now())?.id))
            .await
            .unwrap();
        let broker = MemoryBroker::new();
        let manager = Arc::new(BrokerManager::new(Arc::new(broker.clone()), Topology::default()));
        let scheduler = Scheduler::new(
            db.clone(),
            Enqueuer::new(db.clone(), manager),
            SyncSection::default(),
            PollSection::default(),
        );
        Fixture {
            db,
            broker,
            scheduler,
            source_id,
        }
    }

    #[tokio::test]
    async fn test_due_sources_are_enqueued_once() {
        let f = fixture().await;
        let now = Utc::now();
        assert_eq!(f.scheduler.trigger_due_syncs(now).await.unwrap(), vec![f.source_id]);
        assert!(f.scheduler.trigger_due_syncs(now).await.unwrap().is_empty());
        assert_eq!(f.broker.depth("task-sync"), 1);
    }

    #[tokio::test]
    async fn test_recently_synced_source_is_not_due() {
        let f = fixture().await;
        let id = f.source_id;
        f.db.call(move |db| db.record_sync_success(id, Utc::now()))
            .await
            .unwrap();
        assert!(f.scheduler.trigger_due_syncs(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_source_and_task_are_requeued() {
        let f = fixture().await;
        let id = f.source_id;
        let task_id = f
            .db
            .call(move |db| {
                let issue = ExternalIssue {
                    external_id: "1".into(),
                    title: "t".into(),
                    body: String::new(),
                    url: None,
                    state: "open".into(),
                    updated_at: Utc::now(),
                };
                Ok(db.upsert_task(id, &issue, Utc::now())?.0.id)
            })
            .await
            .unwrap();
        let tracker = LifecycleTracker::new(f.db.clone());
        tracker
            .transition(Subject::Source(id), Transition::Enqueue)
            .await
            .unwrap();
        let eval = Subject::Task {
            id: task_id,
            phase: Phase::Evaluation,
        };
        tracker.transition(eval, Transition::Enqueue).await.unwrap();
        tracker.transition(eval, Transition::Start).await.unwrap();

        // Nothing is stuck yet.
        assert!(f.scheduler.recover_stuck(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::hours(1);
        let report = f.scheduler.recover_stuck(later).await.unwrap();
        assert_eq!(report.sources, vec![id]);
        assert_eq!(report.evaluations, vec![task_id]);
        assert!(report.implementations.is_empty());
        assert_eq!(tracker.status(eval).await.unwrap(), LifecycleStatus::Queued);
        assert_eq!(f.broker.depth("task-sync"), 1);
        assert_eq!(f.broker.depth("task-eval"), 1);
    }

    #[tokio::test]
    async fn test_liveness_sweep_marks_silent_workers_offline() {
        let f = fixture().await;
        let worker = f
            .db
            .call(|db| {
                let w = db.register_worker("w1", "hash", &[TaskType::Evaluation], None, Utc::now())?;
                db.record_heartbeat(w.id, crate::models::WorkerStatus::Online, None, Utc::now())
            })
            .await
            .unwrap();
        assert!(f.scheduler.sweep_workers(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(f.scheduler.sweep_workers(later).await.unwrap(), vec![worker.id]);
    }

    #[tokio::test]
    async fn test_supervisor_restarts_until_shutdown() {
        let (tx, rx) = shutdown_channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = tokio::spawn(supervise("test", rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::StreamEnded("test".into()))
            }
        }));
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
