//! SQLite-backed queue.
//!
//! All queue names share one table, keyed by `"<namespace>:<name>"`.  The
//! autoincrement row id gives FIFO order, and each `pop` is a single
//! `DELETE … RETURNING` statement, so two consumers never receive the same
//! item.  Writes are committed with `synchronous = FULL` before `push`
//! returns.
//!
//! Pushes from this process wake blocked poppers immediately; pushes from
//! other processes are picked up on the next poll tick.
//!
//! Statements run on tokio's blocking pool; a busy database can hold a call
//! for up to `busy_timeout` without stalling the runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DurableQueue, queue_key};
use crate::error::AppError;

/// Schema version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteQueue {
    namespace: String,
    conn: Arc<Mutex<Connection>>,
    pushed: Notify,
    poll_interval: Duration,
}

fn init_schema(conn: &Connection) -> Result<(), AppError> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| AppError::Queue(format!("read schema version: {e}")))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_items_queue ON queue_items(queue, id);

        PRAGMA user_version = 1;
        ",
    )
    .map_err(|e| AppError::Queue(format!("initialize schema: {e}")))
}

impl SqliteQueue {
    pub fn open(path: &Path, namespace: &str, poll_interval: Duration) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| AppError::Queue(format!("open {}: {e}", path.display())))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Queue(format!("set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| AppError::Queue(format!("set synchronous FULL: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AppError::Queue(format!("set busy_timeout: {e}")))?;
        init_schema(&conn)?;

        Ok(Self {
            namespace: namespace.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            pushed: Notify::new(),
            poll_interval,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AppError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<T, AppError> {
            let conn = conn
                .lock()
                .map_err(|_| AppError::Queue("queue connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| AppError::Queue(format!("{op} join: {e}")))?
    }

    async fn try_pop(&self, key: &str) -> Result<Option<String>, AppError> {
        let key = key.to_string();
        self.with_conn("pop", move |conn| {
            conn.query_row(
                "DELETE FROM queue_items
                 WHERE id = (SELECT id FROM queue_items WHERE queue = ?1 ORDER BY id LIMIT 1)
                 RETURNING payload",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Queue(format!("pop {key}: {e}")))
        })
        .await
    }
}

#[async_trait]
impl DurableQueue for SqliteQueue {
    async fn push(&self, name: &str, item: &str) -> Result<(), AppError> {
        let key = queue_key(&self.namespace, name);
        let item = item.to_string();
        self.with_conn("push", move |conn| {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            conn.execute(
                "INSERT INTO queue_items (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
                params![key, item, now],
            )
            .map_err(|e| AppError::Queue(format!("push {key}: {e}")))
        })
        .await?;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(
        &self,
        name: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, AppError> {
        let key = queue_key(&self.namespace, name);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(&key).await? {
                return Ok(Some(item));
            }
            if !block {
                return Ok(None);
            }

            let now = Instant::now();
            let mut wake = now + self.poll_interval;
            if let Some(d) = deadline {
                if now >= d {
                    return Ok(None);
                }
                wake = wake.min(d);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn size(&self, name: &str) -> Result<usize, AppError> {
        let key = queue_key(&self.namespace, name);
        self.with_conn("size", move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_items WHERE queue = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(|e| AppError::Queue(format!("size {key}: {e}")))?;
            Ok(count as usize)
        })
        .await
    }

    async fn drain_all(&self, name: &str) -> Result<Vec<String>, AppError> {
        let key = queue_key(&self.namespace, name);
        self.with_conn("drain", move |conn| {
            let mut stmt = conn
                .prepare("DELETE FROM queue_items WHERE queue = ?1 RETURNING id, payload")
                .map_err(|e| AppError::Queue(format!("drain {key}: {e}")))?;
            let mut rows: Vec<(i64, String)> = stmt
                .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                .and_then(|rows| rows.collect())
                .map_err(|e| AppError::Queue(format!("drain {key}: {e}")))?;
            // RETURNING row order is unspecified.
            rows.sort_by_key(|(id, _)| *id);
            Ok(rows.into_iter().map(|(_, payload)| payload).collect())
        })
        .await
    }
}
