//! libSQL-backed durable `MessageBus`.
//!
//! Entries survive restarts; a worker that comes back under the same consumer
//! name finds its unacked deliveries in `bus_pending` and reprocesses them.
//! Id allocation is serialized through a write lock since libSQL has no
//! sequence primitive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{MessageBus, QueueEntry};
use crate::error::QueueError;

pub struct LibSqlBus {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
    wakeup: Arc<Notify>,
}

impl LibSqlBus {
    pub async fn new_local(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Backend(format!("create bus directory: {e}")))?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Backend(format!("open bus database: {e}")))?;
        Self::from_db(db).await
    }

    pub async fn new_memory() -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Backend(format!("open bus database: {e}")))?;
        Self::from_db(db).await
    }

    async fn from_db(db: LibSqlDatabase) -> Result<Self, QueueError> {
        let conn = db
            .connect()
            .map_err(|e| QueueError::Backend(format!("connect: {e}")))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| QueueError::Backend(format!("bus schema: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
            wakeup: Arc::new(Notify::new()),
        })
    }

    async fn group_cursor(&self, stream: &str, group: &str) -> Result<Option<u64>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT cursor FROM bus_groups WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("group_cursor: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(format!("group_cursor: {e}")))?
        {
            Some(row) => {
                let cursor: i64 = row
                    .get(0)
                    .map_err(|e| QueueError::Backend(format!("group_cursor: {e}")))?;
                Ok(Some(cursor as u64))
            }
            None => Ok(None),
        }
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let _guard = self.write_lock.lock().await;
        let cursor = self
            .group_cursor(stream, group)
            .await?
            .ok_or_else(|| QueueError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut out = Vec::new();

        // Own unacked deliveries first.
        let mut rows = self
            .conn
            .query(
                "SELECT e.id, e.payload FROM bus_pending p \
                 JOIN bus_entries e ON e.stream = p.stream AND e.id = p.entry_id \
                 WHERE p.stream = ?1 AND p.grp = ?2 AND p.consumer = ?3 \
                 ORDER BY e.id LIMIT ?4",
                params![stream, group, consumer, count as i64],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("read pending: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(format!("read pending: {e}")))?
        {
            out.push(row_to_entry(&row)?);
        }

        // Then fresh entries past the group cursor.
        let remaining = count.saturating_sub(out.len());
        if remaining > 0 {
            let mut rows = self
                .conn
                .query(
                    "SELECT id, payload FROM bus_entries \
                     WHERE stream = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                    params![stream, cursor as i64, remaining as i64],
                )
                .await
                .map_err(|e| QueueError::Backend(format!("read new: {e}")))?;
            let mut fresh = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| QueueError::Backend(format!("read new: {e}")))?
            {
                fresh.push(row_to_entry(&row)?);
            }

            for entry in &fresh {
                self.conn
                    .execute(
                        "INSERT INTO bus_pending (stream, grp, entry_id, consumer, delivered_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            stream,
                            group,
                            entry.id as i64,
                            consumer,
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .await
                    .map_err(|e| QueueError::Backend(format!("mark pending: {e}")))?;
            }
            if let Some(last) = fresh.last() {
                self.conn
                    .execute(
                        "UPDATE bus_groups SET cursor = ?3 WHERE stream = ?1 AND grp = ?2",
                        params![stream, group, last.id as i64],
                    )
                    .await
                    .map_err(|e| QueueError::Backend(format!("advance cursor: {e}")))?;
            }
            out.extend(fresh);
        }

        Ok(out)
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<QueueEntry, QueueError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| QueueError::Backend(format!("entry id: {e}")))?;
    let payload: String = row
        .get(1)
        .map_err(|e| QueueError::Backend(format!("entry payload: {e}")))?;
    Ok(QueueEntry {
        id: id as u64,
        payload: serde_json::from_str(&payload)?,
    })
}

static SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bus_entries (
    stream TEXT NOT NULL,
    id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (stream, id)
);

CREATE TABLE IF NOT EXISTS bus_groups (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    cursor INTEGER NOT NULL,
    PRIMARY KEY (stream, grp)
);

CREATE TABLE IF NOT EXISTS bus_pending (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    entry_id INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    delivered_at TEXT NOT NULL,
    PRIMARY KEY (stream, grp, entry_id)
);
"#;

#[async_trait]
impl MessageBus for LibSqlBus {
    async fn append(
        &self,
        stream: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(id), 0) FROM bus_entries WHERE stream = ?1",
                params![stream],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("append: {e}")))?;
        let max: i64 = match rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(format!("append: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| QueueError::Backend(format!("append: {e}")))?,
            None => 0,
        };
        let id = (max as u64) + 1;

        self.conn
            .execute(
                "INSERT INTO bus_entries (stream, id, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    stream,
                    id as i64,
                    serde_json::to_string(payload)?,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("append: {e}")))?;

        drop(_guard);
        self.wakeup.notify_waiters();
        debug!(stream, entry_id = id, "Entry appended");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        if self.group_cursor(stream, group).await?.is_some() {
            return Ok(());
        }
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(id), 0) FROM bus_entries WHERE stream = ?1",
                params![stream],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("ensure_group: {e}")))?;
        let tail: i64 = match rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(format!("ensure_group: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| QueueError::Backend(format!("ensure_group: {e}")))?,
            None => 0,
        };
        self.conn
            .execute(
                "INSERT OR IGNORE INTO bus_groups (stream, grp, cursor) VALUES (?1, ?2, ?3)",
                params![stream, group, tail],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("ensure_group: {e}")))?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            let ready = self.try_read(stream, group, consumer, count).await?;
            if !ready.is_empty() {
                return Ok(ready);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, self.wakeup.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<(), QueueError> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM bus_pending \
                 WHERE stream = ?1 AND grp = ?2 AND entry_id = ?3",
                params![stream, group, entry_id as i64],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("ack: {e}")))?;
        if affected == 0 {
            return Err(QueueError::NotPending {
                stream: stream.to_string(),
                group: group.to_string(),
                entry_id,
            });
        }
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM bus_pending WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("pending_count: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(format!("pending_count: {e}")))?
        {
            Some(row) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| QueueError::Backend(format!("pending_count: {e}")))?;
                Ok(n as usize)
            }
            None => Ok(0),
        }
    }
}
