use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::models::{ExternalIssue, SyncStateEntry, TaskSource};
use crate::store::{DbHandle, at_stored_precision};

use super::IssueSource;

/// Result of one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Sync-state rows not seen in this pass. Reported, never closed.
    pub stale: Vec<SyncStateEntry>,
    /// Tasks created or refreshed by this pass.
    pub changed_tasks: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemChange {
    Created,
    Updated,
    Unchanged,
}

/// Diffs a provider's item list against persisted sync state.
#[derive(Clone)]
pub struct SyncEngine {
    db: DbHandle,
    sources: Vec<Arc<dyn IssueSource>>,
}

impl SyncEngine {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn IssueSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub async fn run_pass(&self, task_source_id: i64) -> Result<SyncReport, SyncError> {
        self.run_pass_at(task_source_id, Utc::now()).await
    }

    /// Run one pass whose start time is `started_at`. Every item fetched is
    /// marked seen at `started_at`; anything older is a stale candidate.
    pub async fn run_pass_at(
        &self,
        task_source_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<SyncReport, SyncError> {
        let source = self
            .db
            .call(move |db| db.get_task_source(task_source_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::SourceNotFound { id: task_source_id })?;
        let adapter = self
            .sources
            .iter()
            .find(|s| s.provider() == source.provider)
            .ok_or_else(|| SyncError::UnsupportedProvider(source.provider.to_string()))?;

        let items = adapter.fetch(&source).await?;
        let mut report = SyncReport {
            fetched: items.len(),
            ..Default::default()
        };

        for item in items {
            let external_id = item.external_id.clone();
            let (change, task_id) = self.apply_item(&source, item, started_at).await?;
            debug!(task_source_id, external_id = %external_id, ?change, "sync item");
            match change {
                ItemChange::Created => report.created += 1,
                ItemChange::Updated => report.updated += 1,
                ItemChange::Unchanged => report.unchanged += 1,
            }
            if let Some(id) = task_id {
                report.changed_tasks.push(id);
            }
        }

        report.stale = self
            .db
            .call(move |db| db.list_stale_sync_state(task_source_id, started_at))
            .await
            .map_err(SyncError::Database)?;
        if !report.stale.is_empty() {
            warn!(
                task_source_id,
                stale = report.stale.len(),
                "items missing from source since last pass"
            );
        }
        info!(
            task_source_id,
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn apply_item(
        &self,
        source: &TaskSource,
        item: ExternalIssue,
        seen_at: DateTime<Utc>,
    ) -> Result<(ItemChange, Option<i64>), SyncError> {
        let source_id = source.id;
        self.db
            .call(move |db| {
                let state = db.get_sync_state(source_id, &item.external_id)?;
                let advanced = state
                    .as_ref()
                    .is_none_or(|s| at_stored_precision(item.updated_at) > s.issue_updated_at);
                if !advanced {
                    db.touch_sync_state(source_id, &item.external_id, seen_at)?;
                    return Ok((ItemChange::Unchanged, None));
                }
                let (task, created) = db.upsert_task(source_id, &item, Utc::now())?;
                db.upsert_sync_state(source_id, &item.external_id, item.updated_at, seen_at)?;
                let change = if created {
                    ItemChange::Created
                } else {
                    ItemChange::Updated
                };
                Ok((change, Some(task.id)))
            })
            .await
            .map_err(SyncError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use async_trait::async_trait;
    use chrono::{Duration, SubsecRound};
    use std::sync::Mutex;

    /// Serves whatever list the test last set.
    struct FakeSource {
        items: Mutex<Vec<ExternalIssue>>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, items: Vec<ExternalIssue>) {
            *self.items.lock().unwrap() = items;
        }
    }

    #[async_trait]
    impl IssueSource for FakeSource {
        fn provider(&self) -> Provider {
            Provider::Github
        }

        async fn fetch(&self, _source: &TaskSource) -> Result<Vec<ExternalIssue>, SyncError> {
            Ok(self.items.lock().unwrap().clone())
        }
    }

    fn item(id: &str, updated_at: DateTime<Utc>) -> ExternalIssue {
        ExternalIssue {
            external_id: id.into(),
            title: format!("Issue {}", id),
            body: String::new(),
            url: None,
            state: "open".into(),
            updated_at,
        }
    }

    async fn setup() -> (SyncEngine, Arc<FakeSource>, DbHandle, i64) {
        let db = DbHandle::in_memory().unwrap();
        let source_id = db
            .call(|db| Ok(db.create_task_source("web", Provider::Github, "o/r", None, Utc::now())?.id))
            .await
            .unwrap();
        let fake = FakeSource::new();
        let engine = SyncEngine::new(db.clone()).with_source(fake.clone());
        (engine, fake, db, source_id)
    }

    #[tokio::test]
    async fn test_second_pass_over_unchanged_list_only_touches_seen() {
        let (engine, fake, db, source_id) = setup().await;
        let t0 = Utc::now().trunc_subsecs(0) - Duration::hours(2);
        fake.set(vec![item("1", t0), item("2", t0)]);

        let first = engine.run_pass_at(source_id, t0).await.unwrap();
        assert_eq!((first.created, first.updated, first.unchanged), (2, 0, 0));
        let tasks_before = db.call(|db| db.list_tasks(None)).await.unwrap();

        let t1 = t0 + Duration::minutes(10);
        let second = engine.run_pass_at(source_id, t1).await.unwrap();
        assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 2));
        assert!(second.changed_tasks.is_empty());
        assert!(second.stale.is_empty());

        let tasks_after = db.call(|db| db.list_tasks(None)).await.unwrap();
        assert_eq!(tasks_after.len(), 2);
        for (before, after) in tasks_before.iter().zip(&tasks_after) {
            assert_eq!(before.updated_at, after.updated_at);
        }
        let state = db.call(move |db| db.list_sync_state(source_id)).await.unwrap();
        assert!(state.iter().all(|s| s.last_seen_at == t1 && s.issue_updated_at == t0));
    }

    #[tokio::test]
    async fn test_sub_microsecond_timestamp_is_not_an_advance() {
        let (engine, fake, _db, source_id) = setup().await;
        let t0 = Utc::now().trunc_subsecs(0) - Duration::hours(1) + Duration::nanoseconds(123_456_789);
        fake.set(vec![item("3", t0)]);

        let first = engine.run_pass_at(source_id, t0).await.unwrap();
        assert_eq!(first.created, 1);
        let second = engine
            .run_pass_at(source_id, t0 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!((second.updated, second.unchanged), (0, 1));
        assert!(second.changed_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_advanced_timestamp_updates_task() {
        let (engine, fake, db, source_id) = setup().await;
        let t0 = Utc::now().trunc_subsecs(0) - Duration::hours(1);
        fake.set(vec![item("7", t0)]);
        engine.run_pass_at(source_id, t0).await.unwrap();

        let mut edited = item("7", t0 + Duration::minutes(5));
        edited.title = "Renamed".into();
        fake.set(vec![edited]);
        let report = engine
            .run_pass_at(source_id, t0 + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.changed_tasks.len(), 1);

        let task = db
            .call(move |db| db.find_task(source_id, "7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.title, "Renamed");
        assert_eq!(db.call(|db| db.count_tasks()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_set_is_exactly_items_not_seen_this_pass() {
        let (engine, fake, db, source_id) = setup().await;
        let base = Utc::now().trunc_subsecs(0) - Duration::hours(3);
        let t1 = base;
        let t2 = base + Duration::hours(1);
        let pass_start = base + Duration::hours(2);
        db.call(move |db| {
            db.upsert_sync_state(source_id, "old", base, t1)?;
            db.upsert_sync_state(source_id, "recent", base, t2)
        })
        .await
        .unwrap();

        fake.set(vec![item("recent", base)]);
        let report = engine.run_pass_at(source_id, pass_start).await.unwrap();
        let stale: Vec<&str> = report
            .stale
            .iter()
            .map(|s| s.external_issue_id.as_str())
            .collect();
        assert_eq!(stale, vec!["old"]);
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn test_removed_issue_is_reported_stale_without_task_mutation() {
        let (engine, fake, db, source_id) = setup().await;
        let t0 = Utc::now().trunc_subsecs(0) - Duration::hours(1);
        fake.set(vec![item("I1", t0)]);
        let first = engine.run_pass_at(source_id, t0).await.unwrap();
        assert_eq!(first.created, 1);
        let task_before = db
            .call(move |db| db.find_task(source_id, "I1"))
            .await
            .unwrap()
            .unwrap();

        fake.set(vec![]);
        let t1 = t0 + Duration::minutes(30);
        let second = engine.run_pass_at(source_id, t1).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.stale.len(), 1);
        assert_eq!(second.stale[0].external_issue_id, "I1");
        assert_eq!(second.stale[0].last_seen_at, t0);

        let task_after = db
            .call(move |db| db.find_task(source_id, "I1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task_after.updated_at, task_before.updated_at);
        assert_eq!(task_after.external_state, "open");
    }

    #[tokio::test]
    async fn test_unknown_source_and_missing_adapter() {
        let (engine, _fake, db, source_id) = setup().await;
        assert!(matches!(
            engine.run_pass(999).await,
            Err(SyncError::SourceNotFound { id: 999 })
        ));
        let bare = SyncEngine::new(db);
        assert!(matches!(
            bare.run_pass(source_id).await,
            Err(SyncError::UnsupportedProvider(_))
        ));
    }
}
