//! SQLite-backed shared store for tasks, workers, queue items, the phase
//! ledger, leases, and claims.
//!
//! Exactly four shared mutable resources exist in the system (task records,
//! ledger, lease table, claim table); all of them live here so every
//! synchronization primitive is a transactional store write, never an
//! in-memory lock. The queue and worker tables ride along in the same file.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    PrioritySource, QueueItem, QueueItemStatus, QueueLane, Task, Worker, now_ms,
};
use crate::phase::TaskPhase;

/// Async-safe handle to the conductor database.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations. WAL mode plus a busy timeout make concurrent access from
    /// independent worker processes safe.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Borrow the underlying connection. Used by the ledger, lease, and
    /// claim modules, which own their table-specific SQL.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    current_phase TEXT NOT NULL DEFAULT 'strategize',
                    blocked INTEGER NOT NULL DEFAULT 0,
                    dependencies TEXT NOT NULL DEFAULT '[]',
                    priority INTEGER NOT NULL DEFAULT 0,
                    assigned_worker TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_ledger (
                    task_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    prev_hash TEXT NOT NULL,
                    this_hash TEXT NOT NULL,
                    phase_from TEXT NOT NULL,
                    phase_to TEXT NOT NULL,
                    transition_type TEXT NOT NULL,
                    evidence TEXT NOT NULL DEFAULT '[]',
                    actor TEXT NOT NULL,
                    PRIMARY KEY (task_id, seq)
                );

                CREATE TABLE IF NOT EXISTS leases (
                    resource_key TEXT PRIMARY KEY,
                    holder_id TEXT NOT NULL,
                    acquired_at_ms INTEGER NOT NULL,
                    ttl_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_claims (
                    task_id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    claimed_at_ms INTEGER NOT NULL,
                    expected_completion_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queue_items (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    lane TEXT NOT NULL DEFAULT 'normal',
                    status TEXT NOT NULL DEFAULT 'queued',
                    priority_source TEXT NOT NULL DEFAULT 'classifier',
                    enqueued_at_ms INTEGER NOT NULL,
                    started_at_ms INTEGER,
                    completed_at_ms INTEGER,
                    duration_ms INTEGER,
                    notes TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_queue_items_task
                    ON queue_items(task_id);
                CREATE INDEX IF NOT EXISTS idx_queue_items_lane_status
                    ON queue_items(lane, status);

                CREATE TABLE IF NOT EXISTS workers (
                    id TEXT PRIMARY KEY,
                    capabilities TEXT NOT NULL DEFAULT '[]',
                    max_concurrent_tasks INTEGER NOT NULL DEFAULT 1,
                    active_tasks TEXT NOT NULL DEFAULT '[]',
                    last_heartbeat_ms INTEGER NOT NULL,
                    registered_at_ms INTEGER NOT NULL
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tasks
                 (id, title, current_phase, blocked, dependencies, priority,
                  assigned_worker, metadata, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.id,
                    task.title,
                    task.current_phase.to_string(),
                    task.blocked as i64,
                    serde_json::to_string(&task.dependencies)?,
                    task.priority,
                    task.assigned_worker,
                    serde_json::to_string(&task.metadata)?,
                    task.created_at_ms,
                    task.updated_at_ms,
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                "SELECT id, title, current_phase, blocked, dependencies, priority,
                        assigned_worker, metadata, created_at_ms, updated_at_ms
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
            .context("Failed to query task")
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, current_phase, blocked, dependencies, priority,
                    assigned_worker, metadata, created_at_ms, updated_at_ms
             FROM tasks ORDER BY created_at_ms",
        )?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list tasks")?;
        Ok(tasks)
    }

    pub fn update_task_phase(&self, id: &str, phase: TaskPhase) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET current_phase = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![phase.to_string(), now_ms(), id],
        )?;
        anyhow::ensure!(n == 1, "task {} not found", id);
        Ok(())
    }

    pub fn set_task_blocked(&self, id: &str, blocked: bool) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET blocked = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![blocked as i64, now_ms(), id],
        )?;
        anyhow::ensure!(n == 1, "task {} not found", id);
        Ok(())
    }

    pub fn set_assigned_worker(&self, id: &str, worker: Option<&str>) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET assigned_worker = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![worker, now_ms(), id],
        )?;
        anyhow::ensure!(n == 1, "task {} not found", id);
        Ok(())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn upsert_worker(&self, worker: &Worker) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workers
                 (id, capabilities, max_concurrent_tasks, active_tasks,
                  last_heartbeat_ms, registered_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    capabilities = excluded.capabilities,
                    max_concurrent_tasks = excluded.max_concurrent_tasks,
                    active_tasks = excluded.active_tasks,
                    last_heartbeat_ms = excluded.last_heartbeat_ms",
                params![
                    worker.id,
                    serde_json::to_string(&worker.capabilities)?,
                    worker.max_concurrent_tasks as i64,
                    serde_json::to_string(&worker.active_tasks)?,
                    worker.last_heartbeat_ms,
                    worker.registered_at_ms,
                ],
            )
            .context("Failed to upsert worker")?;
        Ok(())
    }

    pub fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        self.conn
            .query_row(
                "SELECT id, capabilities, max_concurrent_tasks, active_tasks,
                        last_heartbeat_ms, registered_at_ms
                 FROM workers WHERE id = ?1",
                params![id],
                row_to_worker,
            )
            .optional()
            .context("Failed to query worker")
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, capabilities, max_concurrent_tasks, active_tasks,
                    last_heartbeat_ms, registered_at_ms
             FROM workers ORDER BY registered_at_ms",
        )?;
        let workers = stmt
            .query_map([], row_to_worker)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list workers")?;
        Ok(workers)
    }

    pub fn touch_worker_heartbeat(&self, id: &str, at_ms: i64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE workers SET last_heartbeat_ms = ?1 WHERE id = ?2",
            params![at_ms, id],
        )?;
        anyhow::ensure!(n == 1, "worker {} not found", id);
        Ok(())
    }

    pub fn remove_worker(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM workers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // =========================================================================
    // Queue items
    // =========================================================================

    pub fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO queue_items
                 (id, task_id, lane, status, priority_source, enqueued_at_ms,
                  started_at_ms, completed_at_ms, duration_ms, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item.id,
                    item.task_id,
                    item.lane.to_string(),
                    item.status.to_string(),
                    item.priority_source.to_string(),
                    item.enqueued_at_ms,
                    item.started_at_ms,
                    item.completed_at_ms,
                    item.duration_ms,
                    item.notes,
                ],
            )
            .context("Failed to insert queue item")?;
        Ok(())
    }

    pub fn update_queue_item(&self, item: &QueueItem) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE queue_items SET
                lane = ?1, status = ?2, priority_source = ?3, enqueued_at_ms = ?4,
                started_at_ms = ?5, completed_at_ms = ?6, duration_ms = ?7, notes = ?8
             WHERE id = ?9",
            params![
                item.lane.to_string(),
                item.status.to_string(),
                item.priority_source.to_string(),
                item.enqueued_at_ms,
                item.started_at_ms,
                item.completed_at_ms,
                item.duration_ms,
                item.notes,
                item.id,
            ],
        )?;
        anyhow::ensure!(n == 1, "queue item {} not found", item.id);
        Ok(())
    }

    /// The most recent non-terminal queue item for a task, if any.
    pub fn get_open_queue_item(&self, task_id: &str) -> Result<Option<QueueItem>> {
        self.conn
            .query_row(
                "SELECT id, task_id, lane, status, priority_source, enqueued_at_ms,
                        started_at_ms, completed_at_ms, duration_ms, notes
                 FROM queue_items
                 WHERE task_id = ?1 AND status IN ('queued', 'running')
                 ORDER BY enqueued_at_ms DESC LIMIT 1",
                params![task_id],
                row_to_queue_item,
            )
            .optional()
            .context("Failed to query queue item")
    }

    pub fn list_queue_items(&self, status: Option<QueueItemStatus>) -> Result<Vec<QueueItem>> {
        let (sql, param): (&str, Option<String>) = match status {
            Some(s) => (
                "SELECT id, task_id, lane, status, priority_source, enqueued_at_ms,
                        started_at_ms, completed_at_ms, duration_ms, notes
                 FROM queue_items WHERE status = ?1 ORDER BY enqueued_at_ms",
                Some(s.to_string()),
            ),
            None => (
                "SELECT id, task_id, lane, status, priority_source, enqueued_at_ms,
                        started_at_ms, completed_at_ms, duration_ms, notes
                 FROM queue_items ORDER BY enqueued_at_ms",
                None,
            ),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = match param {
            Some(p) => stmt.query_map(params![p], row_to_queue_item)?,
            None => stmt.query_map([], row_to_queue_item)?,
        };
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list queue items")
    }

    /// Count of running items in a lane.
    pub fn count_running_in_lane(&self, lane: QueueLane) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE lane = ?1 AND status = 'running'",
            params![lane.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Count of running items across all lanes.
    pub fn count_running(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let phase_str: String = row.get(2)?;
    let deps_json: String = row.get(4)?;
    let metadata_json: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        current_phase: TaskPhase::from_str(&phase_str).map_err(invalid_column(2))?,
        blocked: row.get::<_, i64>(3)? != 0,
        dependencies: serde_json::from_str(&deps_json).map_err(invalid_column(4))?,
        priority: row.get(5)?,
        assigned_worker: row.get(6)?,
        metadata: serde_json::from_str(&metadata_json).map_err(invalid_column(7))?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

fn row_to_worker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worker> {
    let caps_json: String = row.get(1)?;
    let active_json: String = row.get(3)?;
    Ok(Worker {
        id: row.get(0)?,
        capabilities: serde_json::from_str(&caps_json).map_err(invalid_column(1))?,
        max_concurrent_tasks: row.get::<_, i64>(2)? as usize,
        active_tasks: serde_json::from_str(&active_json).map_err(invalid_column(3))?,
        last_heartbeat_ms: row.get(4)?,
        registered_at_ms: row.get(5)?,
    })
}

fn row_to_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let lane_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let source_str: String = row.get(4)?;
    Ok(QueueItem {
        id: row.get(0)?,
        task_id: row.get(1)?,
        lane: QueueLane::from_str(&lane_str).map_err(invalid_column(2))?,
        status: QueueItemStatus::from_str(&status_str).map_err(invalid_column(3))?,
        priority_source: PrioritySource::from_str(&source_str).map_err(invalid_column(4))?,
        enqueued_at_ms: row.get(5)?,
        started_at_ms: row.get(6)?,
        completed_at_ms: row.get(7)?,
        duration_ms: row.get(8)?,
        notes: row.get(9)?,
    })
}

/// Adapt a decode error into rusqlite's column-conversion error shape so row
/// mappers compose with `query_map`.
pub(crate) fn invalid_column<E>(index: usize) -> impl FnOnce(E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    }
}
