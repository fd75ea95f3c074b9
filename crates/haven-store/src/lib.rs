//! Persistence for the haven runtime
//!
//! Wraps one sqlite database (entities mirror, metrics, logs) behind an
//! async write queue so the event hot path never waits on disk I/O.

mod async_writer;
mod error;
mod logging;
mod metrics;
mod models;
mod prune;

pub use async_writer::WriteOp;
pub use error::{StoreError, StoreResult};
pub use logging::{LogLevel, LogService};
pub use metrics::MetricsRecorder;
pub use models::{EntityRow, LogRow, MetricRow};
pub use prune::{Pruner, PruneTarget, DEFAULT_PRUNE_INTERVAL};

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use async_writer::AsyncWriter;

/// The database plus its write queue. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Arc<Mutex<Connection>>,
    writer: AsyncWriter,
}

impl Store {
    /// Open (or create) the database at `path` and start the write
    /// queue consumer. `":memory:"` gives a throwaway database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, for tests
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        // auto_vacuum only takes effect if set before the first table is
        // created.
        conn.pragma_update(None, "auto_vacuum", "FULL")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                value INTEGER NOT NULL,
                entity_id TEXT NOT NULL DEFAULT '',
                automation_name TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics (timestamp);

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                entity_id TEXT,
                log_text TEXT NOT NULL,
                level TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs (timestamp);
            "#,
        )?;

        let conn = Arc::new(Mutex::new(conn));
        let writer = AsyncWriter::start(conn.clone());

        Ok(Self {
            inner: Arc::new(StoreInner { conn, writer }),
        })
    }

    /// Queue an arbitrary write closure. Never blocks; overflow drops
    /// the write with a WARN log.
    pub fn enqueue_write(&self, op: WriteOp) {
        self.inner.writer.enqueue(op);
    }

    /// Queue an entity upsert (conflict on id updates all columns)
    pub fn enqueue_entity_upsert(&self, row: EntityRow) {
        self.enqueue_write(Box::new(move |conn| row.upsert(conn)));
    }

    /// Wait until every write queued before this call has landed
    pub async fn wait_for_writes(&self) {
        self.inner.writer.wait_for_writes().await;
    }

    /// Drain the queue and stop the consumer. Idempotent.
    pub async fn close(&self) {
        self.inner.writer.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Read helpers (observability and tests; writes all go through the
    // queue)
    // ------------------------------------------------------------------

    pub fn entity_row(&self, id: &str) -> StoreResult<Option<EntityRow>> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, kind, state FROM entities WHERE id = ?1")?;
        let mut rows = stmt.query_map([id], |row| {
            let state: Option<String> = row.get(2)?;
            Ok(EntityRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                state: state.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn metric_count(&self, metric_type: &str) -> StoreResult<i64> {
        let conn = self.inner.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE metric_type = ?1",
            [metric_type],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn log_count(&self) -> StoreResult<i64> {
        let conn = self.inner.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .map_err(Into::into)
    }
}
