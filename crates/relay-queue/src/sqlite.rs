//! Embedded SQLite-backed queue
//!
//! Mimics visibility-timeout semantics on a local database for development
//! and single-node deployments. Claiming a batch uses a guarded UPDATE per
//! row so concurrent fetchers skip rows another connection already locked.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use relay_common::MessagePointer;

use crate::{BrokerQueue, QueueError, QueueMetrics, RawDelivery, Result};

/// SQLite queue handle; also a publisher for dev seeding and tests.
pub struct SqliteBrokerQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    /// Idle wait when a fetch finds nothing, so callers can poll in a loop
    receive_timeout: std::time::Duration,
    running: AtomicBool,
}

impl SqliteBrokerQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            receive_timeout: std::time::Duration::from_millis(1000),
            running: AtomicBool::new(true),
        }
    }

    pub fn with_receive_timeout(mut self, receive_timeout: std::time::Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Create tables and indexes. Dedup is enforced by the
    /// `(queue_name, dedup_id)` primary key.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                queue_name TEXT NOT NULL,
                dedup_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_name, dedup_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, status, visible_at, message_group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_receipt
            ON queue_messages (queue_name, receipt_handle)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Enqueue a pointer. Re-publishing an id already present is a no-op.
    pub async fn publish(&self, pointer: &MessagePointer) -> Result<String> {
        let now = Utc::now().timestamp();
        let payload = serde_json::to_string(pointer)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (queue_name, dedup_id, status, message_group_id, visible_at, payload, created_at)
            VALUES (?, ?, 'PENDING', ?, ?, ?, ?)
            "#,
        )
        .bind(&self.queue_name)
        .bind(&pointer.id)
        .bind(&pointer.message_group_id)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                message_id = %pointer.id,
                queue = %self.queue_name,
                "Duplicate message, skipping"
            );
        }

        Ok(pointer.id.clone())
    }

    pub async fn publish_batch(&self, pointers: &[MessagePointer]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl BrokerQueue for SqliteBrokerQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, max_messages: u32) -> Result<Vec<RawDelivery>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        // Head-of-line per message group; ungrouped rows partition by their
        // own id so each stands alone. PROCESSING rows whose visibility has
        // lapsed are eligible again (crashed consumer).
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT dedup_id, message_group_id, payload,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(message_group_id, dedup_id)
                           ORDER BY created_at, dedup_id
                       ) AS rn
                FROM queue_messages
                WHERE queue_name = ? AND status != 'COMPLETED' AND visible_at <= ?
            )
            SELECT dedup_id, message_group_id, payload
            FROM eligible
            WHERE rn = 1
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());

        for row in rows {
            let dedup_id: String = row.get("dedup_id");
            let message_group_id: Option<String> = row.get("message_group_id");
            let payload: String = row.get("payload");

            let receipt_handle = self.generate_receipt_handle();

            // Guarded claim: another fetcher may have taken the row between
            // the select and this update.
            let claimed = sqlx::query(
                r#"
                UPDATE queue_messages
                SET status = 'PROCESSING', receipt_handle = ?, visible_at = ?,
                    receive_count = receive_count + 1
                WHERE queue_name = ? AND dedup_id = ? AND status != 'COMPLETED' AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&self.queue_name)
            .bind(&dedup_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                continue;
            }

            deliveries.push(RawDelivery {
                body: payload.into_bytes(),
                receipt_handle,
                broker_message_id: Some(dedup_id),
                message_group_id,
            });
        }

        if deliveries.is_empty() {
            // Emulate a broker receive timeout so poll loops do not spin
            tokio::time::sleep(self.receive_timeout).await;
        } else {
            debug!(
                queue = %self.queue_name,
                count = deliveries.len(),
                "Fetched messages from SQLite queue"
            );
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'COMPLETED', receipt_handle = NULL
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                queue = %self.queue_name,
                "ACK with unknown receipt handle ignored"
            );
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<()> {
        // Clear the processing marker so the next poll re-selects the row.
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'PENDING', receipt_handle = NULL, visible_at = ?
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Expected when a visibility change already released the row
            debug!(
                queue = %self.queue_name,
                "NACK with unknown receipt handle ignored"
            );
        }
        Ok(())
    }

    fn supports_visibility_control(&self) -> bool {
        true
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp() + seconds as i64;

        sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'PENDING', receipt_handle = NULL, visible_at = ?
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        let now = Utc::now().timestamp();

        let pending_row = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_messages WHERE queue_name = ? AND status = 'PENDING' AND visible_at <= ?",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let pending_messages: i64 = pending_row.get("count");

        let in_flight_row = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_messages WHERE queue_name = ? AND status = 'PROCESSING'",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;
        let in_flight_messages: i64 = in_flight_row.get("count");

        Ok(Some(QueueMetrics {
            queue_identifier: self.queue_name.clone(),
            pending_messages: pending_messages as u64,
            in_flight_messages: in_flight_messages as u64,
        }))
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite broker queue stopped");
    }
}
