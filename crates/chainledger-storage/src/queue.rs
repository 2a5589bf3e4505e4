//! Durable job queue on SQLite.
//!
//! ```text
//! publish ──► [ready] ──receive──► [inflight] ──ack──► (deleted)
//!                ▲                     │
//!                └──────recover────────┘
//! ```
//!
//! Messages live in one `queue_messages` table keyed by an autoincrement id,
//! so delivery order is publish order and recovered messages keep their
//! original position. A message is only removed when acknowledged, or when a
//! lane with a retention limit overflows and its oldest ready messages are
//! pruned.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::debug;

use chainledger_core::error::LedgerError;
use chainledger_core::queue::{Delivery, JobQueue};

const READY: &str = "ready";
const INFLIGHT: &str = "inflight";

fn queue_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Queue(e.to_string())
}

/// SQLite-backed [`JobQueue`].
pub struct SqliteJobQueue {
    pool: SqlitePool,
    notify: Notify,
    /// How often `receive` re-checks for messages published by other processes.
    poll_interval: Duration,
    /// Lanes that keep at most this many ready messages.
    retention: HashMap<String, usize>,
}

impl SqliteJobQueue {
    /// Open (or create) a queue database at `path`. Accepts plain paths and `sqlite:` URLs.
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(queue_err)?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(queue_err)?;
        Self::from_pool(pool).await
    }

    /// Share an existing pool, e.g. [`crate::sqlite::SqliteStore::pool`].
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                lane           TEXT    NOT NULL,
                payload        TEXT    NOT NULL,
                state          TEXT    NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at    INTEGER NOT NULL
            );",
        )
        .execute(&pool)
        .await
        .map_err(queue_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_lane ON queue_messages (lane, state, id);")
            .execute(&pool)
            .await
            .map_err(queue_err)?;

        Ok(Self {
            pool,
            notify: Notify::new(),
            poll_interval: Duration::from_millis(250),
            retention: HashMap::new(),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Keep at most `max_ready` unconsumed messages on `lane`, dropping the
    /// oldest on publish. Meant for report lanes such as the parse callback
    /// lane that may have no consumer. A limit of 0 leaves the lane unbounded.
    pub fn with_retention(mut self, lane: impl Into<String>, max_ready: usize) -> Self {
        let lane = lane.into();
        if max_ready == 0 {
            self.retention.remove(&lane);
        } else {
            self.retention.insert(lane, max_ready);
        }
        self
    }

    async fn prune(&self, lane: &str, max_ready: usize) -> Result<u64, LedgerError> {
        let done = sqlx::query(
            "DELETE FROM queue_messages
             WHERE lane = ? AND state = ? AND id NOT IN (
                SELECT id FROM queue_messages
                WHERE lane = ? AND state = ?
                ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(lane)
        .bind(READY)
        .bind(lane)
        .bind(READY)
        .bind(max_ready as i64)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(done.rows_affected())
    }

    /// Messages delivered but not yet acknowledged.
    pub async fn inflight(&self, lane: &str) -> Result<usize, LedgerError> {
        self.count(lane, INFLIGHT).await
    }

    async fn count(&self, lane: &str, state: &str) -> Result<usize, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM queue_messages WHERE lane = ? AND state = ?")
            .bind(lane)
            .bind(state)
            .fetch_one(&self.pool)
            .await
            .map_err(queue_err)?;
        let count: i64 = row.try_get("cnt").map_err(queue_err)?;
        Ok(count as usize)
    }

    /// Lease the oldest ready message of `lane`, if any.
    async fn try_take(&self, lane: &str) -> Result<Option<Delivery>, LedgerError> {
        let row = sqlx::query(
            "UPDATE queue_messages
             SET state = ?, delivery_count = delivery_count + 1
             WHERE id = (
                SELECT id FROM queue_messages
                WHERE lane = ? AND state = ?
                ORDER BY id LIMIT 1
             )
             RETURNING id, payload, delivery_count",
        )
        .bind(INFLIGHT)
        .bind(lane)
        .bind(READY)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(queue_err)?;
        let delivery_count: i64 = row.try_get("delivery_count").map_err(queue_err)?;
        Ok(Some(Delivery {
            id: id as u64,
            lane: lane.to_string(),
            payload: row.try_get("payload").map_err(queue_err)?,
            delivery_count: delivery_count as u32,
        }))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn publish(&self, lane: &str, payload: String) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO queue_messages (lane, payload, state, delivery_count, enqueued_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(lane)
        .bind(payload)
        .bind(READY)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        if let Some(&max_ready) = self.retention.get(lane) {
            let pruned = self.prune(lane, max_ready).await?;
            if pruned > 0 {
                debug!(lane, pruned, "dropped oldest messages over retention");
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        lane: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, LedgerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take(lane).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = deadline.min(now + self.poll_interval);
            // Either a local publish or the poll tick; both lead to another attempt.
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(delivery.id as i64)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn recover(&self, lane: &str) -> Result<usize, LedgerError> {
        let done = sqlx::query("UPDATE queue_messages SET state = ? WHERE lane = ? AND state = ?")
            .bind(READY)
            .bind(lane)
            .bind(INFLIGHT)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        let recovered = done.rows_affected() as usize;
        if recovered > 0 {
            debug!(lane, recovered, "returned in-flight messages to lane");
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn depth(&self, lane: &str) -> Result<usize, LedgerError> {
        self.count(lane, READY).await
    }
}
