use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Params, params, params_from_iter};

use crate::models::*;

/// Async-safe handle to the ticketflow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(FlowDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(FlowDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`). The closure holds
    /// the lock for its whole body, so multi-statement sequences inside one
    /// call are not interleaved with other callers.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FlowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// one-shots and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FlowDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Fixed-width RFC 3339 so that text comparison in SQL orders correctly.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `at` as it reads back after a round trip through [`ts`].
pub fn at_stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("Invalid JSON column")
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str, what: &str) -> Result<T> {
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

/// Table, status column and timestamp column addressed by a subject.
fn status_location(subject: Subject) -> (&'static str, &'static str, &'static str) {
    match subject {
        Subject::Source(_) => ("task_sources", "sync_status", "sync_status_updated_at"),
        Subject::Task { phase, .. } => match phase {
            Phase::Sync => ("tasks", "sync_status", "sync_status_updated_at"),
            Phase::Evaluation => (
                "tasks",
                "ai_evaluation_status",
                "evaluation_status_updated_at",
            ),
            Phase::Implementation => (
                "tasks",
                "ai_implementation_status",
                "implementation_status_updated_at",
            ),
        },
    }
}

/// A claimable unit of poll-mode work.
#[derive(Debug, Clone, PartialEq)]
pub struct PollDispatch {
    pub session_id: String,
    pub task_id: i64,
    pub task_type: TaskType,
    /// Serialized `WorkerTaskMessage`
    pub payload: String,
    pub claimed_by: Option<i64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct FlowDb {
    conn: Connection,
}

const SOURCE_COLUMNS: &str = "id, name, provider, repository, filter, sync_status, \
     sync_status_updated_at, last_synced_at, last_sync_error, created_at";

const TASK_COLUMNS: &str = "id, task_source_id, external_issue_id, title, body, url, \
     external_state, sync_status, ai_evaluation_status, evaluation_verdict, evaluation_result, \
     ai_implementation_status, implementation_result, last_error, sync_status_updated_at, \
     evaluation_status_updated_at, implementation_status_updated_at, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "id, task_id, task_type, correlation_id, worker_mode, worker_id, created_at";

const WORKER_COLUMNS: &str =
    "id, name, capabilities, status, last_heartbeat_at, metadata, created_at";

const MESSAGE_COLUMNS: &str = "id, task_id, worker_id, message_type, payload, created_at";

const POLL_COLUMNS: &str =
    "session_id, task_id, task_type, payload, claimed_by, claimed_at, created_at";

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS task_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                repository TEXT NOT NULL,
                filter TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                sync_status_updated_at TEXT NOT NULL,
                last_synced_at TEXT,
                last_sync_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_source_id INTEGER NOT NULL REFERENCES task_sources(id) ON DELETE CASCADE,
                external_issue_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                url TEXT,
                external_state TEXT NOT NULL DEFAULT 'open',
                sync_status TEXT NOT NULL DEFAULT 'pending',
                ai_evaluation_status TEXT NOT NULL DEFAULT 'pending',
                evaluation_verdict TEXT,
                evaluation_result TEXT,
                ai_implementation_status TEXT NOT NULL DEFAULT 'pending',
                implementation_result TEXT,
                last_error TEXT,
                sync_status_updated_at TEXT NOT NULL,
                evaluation_status_updated_at TEXT NOT NULL,
                implementation_status_updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(task_source_id, external_issue_id)
            );

            CREATE TABLE IF NOT EXISTS task_source_sync_state (
                task_source_id INTEGER NOT NULL REFERENCES task_sources(id) ON DELETE CASCADE,
                external_issue_id TEXT NOT NULL,
                issue_updated_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                PRIMARY KEY (task_source_id, external_issue_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                task_type TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                worker_mode TEXT NOT NULL,
                worker_id INTEGER REFERENCES sdk_workers(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sdk_workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                capabilities TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'offline',
                last_heartbeat_at TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                worker_id INTEGER REFERENCES sdk_workers(id) ON DELETE SET NULL,
                message_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS poll_dispatch (
                session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                claimed_by INTEGER REFERENCES sdk_workers(id) ON DELETE SET NULL,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_source ON tasks(task_source_id);
            CREATE INDEX IF NOT EXISTS idx_sync_state_seen ON task_source_sync_state(task_source_id, last_seen_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id, task_type);
            CREATE INDEX IF NOT EXISTS idx_task_messages_task ON task_messages(task_id);
            CREATE INDEX IF NOT EXISTS idx_poll_dispatch_unclaimed ON poll_dispatch(claimed_by, created_at);
            ",
        )?;
        Ok(())
    }

    // ── Task sources ──────────────────────────────────────────────────

    pub fn create_task_source(
        &self,
        name: &str,
        provider: Provider,
        repository: &str,
        filter: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TaskSource> {
        let now = ts(now);
        self.conn
            .execute(
                "INSERT INTO task_sources (name, provider, repository, filter, sync_status_updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![name, provider.as_str(), repository, filter, now],
            )
            .context("Failed to insert task source")?;
        let id = self.conn.last_insert_rowid();
        self.get_task_source(id)?
            .context("Task source not found after insert")
    }

    pub fn get_task_source(&self, id: i64) -> Result<Option<TaskSource>> {
        let sql = format!("SELECT {} FROM task_sources WHERE id = ?1", SOURCE_COLUMNS);
        Ok(self.query_sources(&sql, params![id])?.into_iter().next())
    }

    pub fn find_task_source_by_name(&self, name: &str) -> Result<Option<TaskSource>> {
        let sql = format!("SELECT {} FROM task_sources WHERE name = ?1", SOURCE_COLUMNS);
        Ok(self.query_sources(&sql, params![name])?.into_iter().next())
    }

    pub fn list_task_sources(&self) -> Result<Vec<TaskSource>> {
        let sql = format!("SELECT {} FROM task_sources ORDER BY id", SOURCE_COLUMNS);
        self.query_sources(&sql, [])
    }

    /// Sources never synced, or last synced before `older_than`, that are
    /// not already queued or syncing.
    pub fn list_sources_due_for_sync(&self, older_than: DateTime<Utc>) -> Result<Vec<TaskSource>> {
        let sql = format!(
            "SELECT {} FROM task_sources
             WHERE (last_synced_at IS NULL OR last_synced_at < ?1)
               AND sync_status NOT IN ('queued', 'syncing')
             ORDER BY id",
            SOURCE_COLUMNS
        );
        self.query_sources(&sql, params![ts(older_than)])
    }

    pub fn list_stuck_sources(&self, older_than: DateTime<Utc>) -> Result<Vec<TaskSource>> {
        let sql = format!(
            "SELECT {} FROM task_sources
             WHERE sync_status IN ('queued', 'syncing') AND sync_status_updated_at < ?1
             ORDER BY id",
            SOURCE_COLUMNS
        );
        self.query_sources(&sql, params![ts(older_than)])
    }

    pub fn record_sync_success(&self, id: i64, synced_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE task_sources SET last_synced_at = ?1, last_sync_error = NULL WHERE id = ?2",
                params![ts(synced_at), id],
            )
            .context("Failed to record sync success")?;
        Ok(())
    }

    pub fn record_sync_error(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE task_sources SET last_sync_error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to record sync error")?;
        Ok(())
    }

    fn query_sources<P: Params>(&self, sql: &str, params: P) -> Result<Vec<TaskSource>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare task source query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(TaskSourceRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider: row.get(2)?,
                    repository: row.get(3)?,
                    filter: row.get(4)?,
                    sync_status: row.get(5)?,
                    sync_status_updated_at: row.get(6)?,
                    last_synced_at: row.get(7)?,
                    last_sync_error: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query task sources")?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row.context("Failed to read task source row")?.into_source()?);
        }
        Ok(sources)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(self.query_tasks(&sql, params![id])?.into_iter().next())
    }

    pub fn find_task(&self, task_source_id: i64, external_issue_id: &str) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE task_source_id = ?1 AND external_issue_id = ?2",
            TASK_COLUMNS
        );
        Ok(self
            .query_tasks(&sql, params![task_source_id, external_issue_id])?
            .into_iter()
            .next())
    }

    pub fn list_tasks(&self, task_source_id: Option<i64>) -> Result<Vec<Task>> {
        match task_source_id {
            Some(source) => {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE task_source_id = ?1 ORDER BY id",
                    TASK_COLUMNS
                );
                self.query_tasks(&sql, params![source])
            }
            None => {
                let sql = format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS);
                self.query_tasks(&sql, [])
            }
        }
    }

    pub fn count_tasks(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .context("Failed to count tasks")
    }

    /// Insert or refresh the task for `issue`, keyed by (source, external id).
    /// Returns the task and whether it was newly created. New tasks start
    /// with sync completed and evaluation/implementation pending.
    pub fn upsert_task(
        &self,
        task_source_id: i64,
        issue: &ExternalIssue,
        now: DateTime<Utc>,
    ) -> Result<(Task, bool)> {
        let existed = self.find_task(task_source_id, &issue.external_id)?.is_some();
        let now = ts(now);
        self.conn
            .execute(
                "INSERT INTO tasks (task_source_id, external_issue_id, title, body, url, external_state,
                    sync_status, sync_status_updated_at, evaluation_status_updated_at,
                    implementation_status_updated_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'completed', ?7, ?7, ?7, ?7, ?7)
                 ON CONFLICT(task_source_id, external_issue_id) DO UPDATE SET
                    title = excluded.title,
                    body = excluded.body,
                    url = excluded.url,
                    external_state = excluded.external_state,
                    updated_at = excluded.updated_at",
                params![
                    task_source_id,
                    issue.external_id,
                    issue.title,
                    issue.body,
                    issue.url,
                    issue.state,
                    now
                ],
            )
            .context("Failed to upsert task")?;
        let task = self
            .find_task(task_source_id, &issue.external_id)?
            .context("Task not found after upsert")?;
        Ok((task, !existed))
    }

    pub fn set_evaluation_outcome(
        &self,
        task_id: i64,
        verdict: EvaluationVerdict,
        result: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET evaluation_verdict = ?1, evaluation_result = ?2, last_error = NULL WHERE id = ?3",
                params![verdict.as_str(), result.to_string(), task_id],
            )
            .context("Failed to store evaluation outcome")?;
        Ok(())
    }

    pub fn set_implementation_result(&self, task_id: i64, result: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET implementation_result = ?1, last_error = NULL WHERE id = ?2",
                params![result.to_string(), task_id],
            )
            .context("Failed to store implementation result")?;
        Ok(())
    }

    pub fn set_last_error(&self, task_id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET last_error = ?1 WHERE id = ?2",
                params![error, task_id],
            )
            .context("Failed to store task error")?;
        Ok(())
    }

    /// Tasks whose `phase` status has sat in queued/active since before
    /// `older_than`.
    pub fn list_stuck_tasks(&self, phase: Phase, older_than: DateTime<Utc>) -> Result<Vec<Task>> {
        let (_, column, updated) = status_location(Subject::Task { id: 0, phase });
        let sql = format!(
            "SELECT {} FROM tasks WHERE {} IN ('queued', ?1) AND {} < ?2 ORDER BY id",
            TASK_COLUMNS, column, updated
        );
        self.query_tasks(&sql, params![phase.active_label(), ts(older_than)])
    }

    fn query_tasks<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    task_source_id: row.get(1)?,
                    external_issue_id: row.get(2)?,
                    title: row.get(3)?,
                    body: row.get(4)?,
                    url: row.get(5)?,
                    external_state: row.get(6)?,
                    sync_status: row.get(7)?,
                    ai_evaluation_status: row.get(8)?,
                    evaluation_verdict: row.get(9)?,
                    evaluation_result: row.get(10)?,
                    ai_implementation_status: row.get(11)?,
                    implementation_result: row.get(12)?,
                    last_error: row.get(13)?,
                    sync_status_updated_at: row.get(14)?,
                    evaluation_status_updated_at: row.get(15)?,
                    implementation_status_updated_at: row.get(16)?,
                    created_at: row.get(17)?,
                    updated_at: row.get(18)?,
                })
            })
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    // ── Phase status ──────────────────────────────────────────────────

    pub fn get_status(&self, subject: Subject) -> Result<Option<LifecycleStatus>> {
        let (table, column, _) = status_location(subject);
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE id = ?1", column, table),
                params![subject.id()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read status")?;
        raw.map(|s| LifecycleStatus::parse_for(subject.phase(), &s).map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    /// Move `subject` to `to` only if its current status is one of `from`.
    /// Returns whether a row changed.
    pub fn compare_and_set_status(
        &self,
        subject: Subject,
        from: &[LifecycleStatus],
        to: LifecycleStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let phase = subject.phase();
        let (table, column, updated) = status_location(subject);
        let touch_row = if table == "tasks" { ", updated_at = ?2" } else { "" };
        let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "UPDATE {table} SET {column} = ?1, {updated} = ?2{touch_row}
             WHERE id = ?3 AND {column} IN ({})",
            placeholders.join(", ")
        );

        let mut values = vec![
            Value::Text(to.label(phase).to_string()),
            Value::Text(ts(now)),
            Value::Integer(subject.id()),
        ];
        values.extend(from.iter().map(|s| Value::Text(s.label(phase).to_string())));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .context("Failed to update status")?;
        Ok(changed == 1)
    }

    // ── Sync state ────────────────────────────────────────────────────

    pub fn get_sync_state(
        &self,
        task_source_id: i64,
        external_issue_id: &str,
    ) -> Result<Option<SyncStateEntry>> {
        Ok(self
            .query_sync_state(
                "SELECT task_source_id, external_issue_id, issue_updated_at, last_seen_at
                 FROM task_source_sync_state WHERE task_source_id = ?1 AND external_issue_id = ?2",
                params![task_source_id, external_issue_id],
            )?
            .into_iter()
            .next())
    }

    pub fn list_sync_state(&self, task_source_id: i64) -> Result<Vec<SyncStateEntry>> {
        self.query_sync_state(
            "SELECT task_source_id, external_issue_id, issue_updated_at, last_seen_at
             FROM task_source_sync_state WHERE task_source_id = ?1 ORDER BY external_issue_id",
            params![task_source_id],
        )
    }

    /// Rows for this source not seen since `before`.
    pub fn list_stale_sync_state(
        &self,
        task_source_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<SyncStateEntry>> {
        self.query_sync_state(
            "SELECT task_source_id, external_issue_id, issue_updated_at, last_seen_at
             FROM task_source_sync_state
             WHERE task_source_id = ?1 AND last_seen_at < ?2
             ORDER BY external_issue_id",
            params![task_source_id, ts(before)],
        )
    }

    pub fn upsert_sync_state(
        &self,
        task_source_id: i64,
        external_issue_id: &str,
        issue_updated_at: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_source_sync_state (task_source_id, external_issue_id, issue_updated_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_source_id, external_issue_id) DO UPDATE SET
                    issue_updated_at = excluded.issue_updated_at,
                    last_seen_at = excluded.last_seen_at",
                params![task_source_id, external_issue_id, ts(issue_updated_at), ts(seen_at)],
            )
            .context("Failed to upsert sync state")?;
        Ok(())
    }

    pub fn touch_sync_state(
        &self,
        task_source_id: i64,
        external_issue_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE task_source_sync_state SET last_seen_at = ?1
                 WHERE task_source_id = ?2 AND external_issue_id = ?3",
                params![ts(seen_at), task_source_id, external_issue_id],
            )
            .context("Failed to touch sync state")?;
        Ok(())
    }

    fn query_sync_state<P: Params>(&self, sql: &str, params: P) -> Result<Vec<SyncStateEntry>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare sync state query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query sync state")?;
        let mut entries = Vec::new();
        for row in rows {
            let (task_source_id, external_issue_id, issue_updated_at, last_seen_at) =
                row.context("Failed to read sync state row")?;
            entries.push(SyncStateEntry {
                task_source_id,
                external_issue_id,
                issue_updated_at: parse_ts(&issue_updated_at)?,
                last_seen_at: parse_ts(&last_seen_at)?,
            });
        }
        Ok(entries)
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (id, task_id, task_type, correlation_id, worker_mode, worker_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.task_id,
                    session.task_type.as_str(),
                    session.correlation_id,
                    session.worker_mode.as_str(),
                    session.worker_id,
                    ts(session.created_at)
                ],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        Ok(self.query_sessions(&sql, params![id])?.into_iter().next())
    }

    /// Most recent session for a task and task type.
    pub fn latest_session(&self, task_id: i64, task_type: TaskType) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE task_id = ?1 AND task_type = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SESSION_COLUMNS
        );
        Ok(self
            .query_sessions(&sql, params![task_id, task_type.as_str()])?
            .into_iter()
            .next())
    }

    /// Remove a session that never reached a worker. Returns whether a row
    /// was deleted.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .context("Failed to delete session")?;
        Ok(deleted > 0)
    }

    /// Set the worker override fields when a poll worker claims the session.
    pub fn assign_session_worker(
        &self,
        session_id: &str,
        worker_mode: WorkerMode,
        worker_id: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET worker_mode = ?1, worker_id = ?2 WHERE id = ?3",
                params![worker_mode.as_str(), worker_id, session_id],
            )
            .context("Failed to assign session worker")?;
        Ok(())
    }

    fn query_sessions<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare session query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let (id, task_id, task_type, correlation_id, worker_mode, worker_id, created_at) =
                row.context("Failed to read session row")?;
            sessions.push(Session {
                id,
                task_id,
                task_type: parse_enum(&task_type, "session task type")?,
                correlation_id,
                worker_mode: parse_enum(&worker_mode, "session worker mode")?,
                worker_id,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(sessions)
    }

    // ── SDK workers ───────────────────────────────────────────────────

    pub fn register_worker(
        &self,
        name: &str,
        token_hash: &str,
        capabilities: &[TaskType],
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<SdkWorker> {
        let capabilities =
            serde_json::to_string(capabilities).context("Failed to encode capabilities")?;
        self.conn
            .execute(
                "INSERT INTO sdk_workers (name, token_hash, capabilities, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    name,
                    token_hash,
                    capabilities,
                    metadata.map(|m| m.to_string()),
                    ts(now)
                ],
            )
            .context("Failed to insert worker")?;
        let id = self.conn.last_insert_rowid();
        self.get_worker(id)?.context("Worker not found after insert")
    }

    pub fn get_worker(&self, id: i64) -> Result<Option<SdkWorker>> {
        let sql = format!("SELECT {} FROM sdk_workers WHERE id = ?1", WORKER_COLUMNS);
        Ok(self.query_workers(&sql, params![id])?.into_iter().next())
    }

    pub fn find_worker_by_token_hash(&self, token_hash: &str) -> Result<Option<SdkWorker>> {
        let sql = format!(
            "SELECT {} FROM sdk_workers WHERE token_hash = ?1",
            WORKER_COLUMNS
        );
        Ok(self.query_workers(&sql, params![token_hash])?.into_iter().next())
    }

    pub fn list_workers(&self) -> Result<Vec<SdkWorker>> {
        let sql = format!("SELECT {} FROM sdk_workers ORDER BY id", WORKER_COLUMNS);
        self.query_workers(&sql, [])
    }

    pub fn record_heartbeat(
        &self,
        id: i64,
        status: WorkerStatus,
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<SdkWorker> {
        self.conn
            .execute(
                "UPDATE sdk_workers SET status = ?1, last_heartbeat_at = ?2,
                    metadata = COALESCE(?3, metadata)
                 WHERE id = ?4",
                params![status.as_str(), ts(now), metadata.map(|m| m.to_string()), id],
            )
            .context("Failed to record heartbeat")?;
        self.get_worker(id)?
            .context("Worker not found after heartbeat")
    }

    /// Flip online workers whose last heartbeat predates `older_than` to
    /// offline. Returns the affected worker ids.
    pub fn mark_stale_workers_offline(&self, older_than: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "UPDATE sdk_workers SET status = 'offline'
                 WHERE status = 'online' AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)
                 RETURNING id",
            )
            .context("Failed to prepare liveness sweep")?;
        let rows = stmt
            .query_map(params![ts(older_than)], |row| row.get::<_, i64>(0))
            .context("Failed to run liveness sweep")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read worker id")?);
        }
        Ok(ids)
    }

    fn query_workers<P: Params>(&self, sql: &str, params: P) -> Result<Vec<SdkWorker>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare worker query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query workers")?;
        let mut workers = Vec::new();
        for row in rows {
            let (id, name, capabilities, status, last_heartbeat_at, metadata, created_at) =
                row.context("Failed to read worker row")?;
            workers.push(SdkWorker {
                id,
                name,
                capabilities: serde_json::from_str(&capabilities)
                    .context("Failed to parse worker capabilities")?,
                status: parse_enum(&status, "worker status")?,
                last_heartbeat_at: parse_opt_ts(last_heartbeat_at)?,
                metadata: parse_json(metadata)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(workers)
    }

    // ── Task messages ─────────────────────────────────────────────────

    pub fn insert_task_message(
        &self,
        task_id: i64,
        worker_id: Option<i64>,
        message_type: TaskMessageType,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<TaskMessage> {
        self.conn
            .execute(
                "INSERT INTO task_messages (task_id, worker_id, message_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id,
                    worker_id,
                    message_type.as_str(),
                    payload.to_string(),
                    ts(now)
                ],
            )
            .context("Failed to insert task message")?;
        let id = self.conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM task_messages WHERE id = ?1", MESSAGE_COLUMNS);
        self.query_messages(&sql, params![id])?
            .into_iter()
            .next()
            .context("Task message not found after insert")
    }

    pub fn list_task_messages(&self, task_id: i64) -> Result<Vec<TaskMessage>> {
        let sql = format!(
            "SELECT {} FROM task_messages WHERE task_id = ?1 ORDER BY id",
            MESSAGE_COLUMNS
        );
        self.query_messages(&sql, params![task_id])
    }

    fn query_messages<P: Params>(&self, sql: &str, params: P) -> Result<Vec<TaskMessage>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare task message query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query task messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, task_id, worker_id, message_type, payload, created_at) =
                row.context("Failed to read task message row")?;
            messages.push(TaskMessage {
                id,
                task_id,
                worker_id,
                message_type: parse_enum(&message_type, "task message type")?,
                payload: serde_json::from_str(&payload)
                    .context("Failed to parse task message payload")?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(messages)
    }

    // ── Poll dispatch ─────────────────────────────────────────────────

    pub fn insert_poll_dispatch(
        &self,
        session_id: &str,
        task_id: i64,
        task_type: TaskType,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO poll_dispatch (session_id, task_id, task_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, task_id, task_type.as_str(), payload, ts(now)],
            )
            .context("Failed to insert poll dispatch")?;
        Ok(())
    }

    /// Atomically claim the oldest unclaimed dispatch whose task type is in
    /// `capabilities`.
    pub fn claim_next_poll_dispatch(
        &self,
        worker_id: i64,
        capabilities: &[TaskType],
        now: DateTime<Utc>,
    ) -> Result<Option<PollDispatch>> {
        if capabilities.is_empty() {
            return Ok(None);
        }
        let placeholders: Vec<String> = (0..capabilities.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        let sql = format!(
            "UPDATE poll_dispatch SET claimed_by = ?1, claimed_at = ?2
             WHERE session_id = (
                SELECT session_id FROM poll_dispatch
                WHERE claimed_by IS NULL AND task_type IN ({})
                ORDER BY created_at, rowid LIMIT 1
             )
             RETURNING {}",
            placeholders.join(", "),
            POLL_COLUMNS
        );
        let mut values = vec![Value::Integer(worker_id), Value::Text(ts(now))];
        values.extend(capabilities.iter().map(|t| Value::Text(t.as_str().to_string())));
        Ok(self
            .query_poll(&sql, params_from_iter(values))?
            .into_iter()
            .next())
    }

    /// The dispatch for `task_id` currently claimed by `worker_id`, if any.
    pub fn find_claim(&self, task_id: i64, worker_id: i64) -> Result<Option<PollDispatch>> {
        let sql = format!(
            "SELECT {} FROM poll_dispatch WHERE task_id = ?1 AND claimed_by = ?2
             ORDER BY claimed_at DESC LIMIT 1",
            POLL_COLUMNS
        );
        Ok(self
            .query_poll(&sql, params![task_id, worker_id])?
            .into_iter()
            .next())
    }

    pub fn list_poll_dispatch(&self) -> Result<Vec<PollDispatch>> {
        let sql = format!(
            "SELECT {} FROM poll_dispatch ORDER BY created_at, rowid",
            POLL_COLUMNS
        );
        self.query_poll(&sql, [])
    }

    pub fn delete_poll_dispatch(&self, session_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM poll_dispatch WHERE session_id = ?1",
                params![session_id],
            )
            .context("Failed to delete poll dispatch")?;
        Ok(changed > 0)
    }

    /// Drop every outstanding dispatch (claimed or not) for a task phase.
    pub fn delete_poll_dispatch_for_task(&self, task_id: i64, task_type: TaskType) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM poll_dispatch WHERE task_id = ?1 AND task_type = ?2",
                params![task_id, task_type.as_str()],
            )
            .context("Failed to release poll dispatch")
    }

    fn query_poll<P: Params>(&self, sql: &str, params: P) -> Result<Vec<PollDispatch>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare poll dispatch query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query poll dispatch")?;
        let mut out = Vec::new();
        for row in rows {
            let (session_id, task_id, task_type, payload, claimed_by, claimed_at, created_at) =
                row.context("Failed to read poll dispatch row")?;
            out.push(PollDispatch {
                session_id,
                task_id,
                task_type: parse_enum(&task_type, "poll dispatch task type")?,
                payload,
                claimed_by,
                claimed_at: parse_opt_ts(claimed_at)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(out)
    }
}

/// Intermediate row struct for task sources.
struct TaskSourceRow {
    id: i64,
    name: String,
    provider: String,
    repository: String,
    filter: Option<String>,
    sync_status: String,
    sync_status_updated_at: String,
    last_synced_at: Option<String>,
    last_sync_error: Option<String>,
    created_at: String,
}

impl TaskSourceRow {
    fn into_source(self) -> Result<TaskSource> {
        Ok(TaskSource {
            id: self.id,
            name: self.name,
            provider: parse_enum(&self.provider, "task source provider")?,
            repository: self.repository,
            filter: self.filter,
            sync_status: LifecycleStatus::parse_for(Phase::Sync, &self.sync_status)
                .map_err(|e| anyhow::anyhow!(e))?,
            sync_status_updated_at: parse_ts(&self.sync_status_updated_at)?,
            last_synced_at: parse_opt_ts(self.last_synced_at)?,
            last_sync_error: self.last_sync_error,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Intermediate row struct for tasks, converting status strings into the
/// typed lifecycle.
struct TaskRow {
    id: i64,
    task_source_id: i64,
    external_issue_id: String,
    title: String,
    body: String,
    url: Option<String>,
    external_state: String,
    sync_status: String,
    ai_evaluation_status: String,
    evaluation_verdict: Option<String>,
    evaluation_result: Option<String>,
    ai_implementation_status: String,
    implementation_result: Option<String>,
    last_error: Option<String>,
    sync_status_updated_at: String,
    evaluation_status_updated_at: String,
    implementation_status_updated_at: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = |phase: Phase, raw: &str| {
            LifecycleStatus::parse_for(phase, raw)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("Failed to parse {} status of task {}", phase, self.id))
        };
        Ok(Task {
            id: self.id,
            task_source_id: self.task_source_id,
            sync_status: status(Phase::Sync, &self.sync_status)?,
            ai_evaluation_status: status(Phase::Evaluation, &self.ai_evaluation_status)?,
            ai_implementation_status: status(Phase::Implementation, &self.ai_implementation_status)?,
            evaluation_verdict: self
                .evaluation_verdict
                .as_deref()
                .map(|v| parse_enum(v, "evaluation verdict"))
                .transpose()?,
            evaluation_result: parse_json(self.evaluation_result)?,
            implementation_result: parse_json(self.implementation_result)?,
            external_issue_id: self.external_issue_id,
            title: self.title,
            body: self.body,
            url: self.url,
            external_state: self.external_state,
            last_error: self.last_error,
            sync_status_updated_at: parse_ts(&self.sync_status_updated_at)?,
            evaluation_status_updated_at: parse_ts(&self.evaluation_status_updated_at)?,
            implementation_status_updated_at: parse_ts(&self.implementation_status_updated_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
