//! Embedded SQLite queue for development.
//!
//! Mimics FIFO-queue semantics locally: a `visible_at` column plays the
//! visibility timeout, receipt handles rotate per delivery, and nack
//! shortens visibility the way the cloud adapter does. Also implements
//! `QueuePublisher` so dev tooling can seed messages.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::{parse_message, QueueConsumer, QueueError, QueuePublisher, Result};
use relay_common::{Message, MessagePointer, QueueStats};

pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
        }
    }

    /// Create the queue schema.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                receipt TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    fn generate_receipt(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32, _wait: Duration) -> Result<Vec<MessagePointer>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, payload
            FROM queue_messages
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at, rowid
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut pointers = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receipt = self.generate_receipt();

            // Claim the message; another consumer may have taken it.
            let updated = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }

            match parse_message(&payload) {
                Ok(message) => {
                    pointers.push(MessagePointer::new(
                        message,
                        receipt,
                        self.queue_name.clone(),
                    ));
                }
                Err(e) => {
                    debug!(queue = %self.queue_name, id = %id, error = %e, "Dropping malformed message");
                    sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND id = ?")
                        .bind(&self.queue_name)
                        .bind(&id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }

        if !pointers.is_empty() {
            self.total_polled
                .fetch_add(pointers.len() as u64, Ordering::Relaxed);
        }

        Ok(pointers)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND receipt = ?")
            .bind(&self.queue_name)
            .bind(receipt)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay_seconds: Option<u32>) -> Result<()> {
        let visible_at = Utc::now().timestamp() + delay_seconds.unwrap_or(0) as i64;

        let updated = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND receipt = ?",
        )
        .bind(visible_at)
        .bind(&self.queue_name)
        .bind(receipt)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + seconds as i64;

        let updated = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND receipt = ?",
        )
        .bind(visible_at)
        .bind(&self.queue_name)
        .bind(receipt)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }

        Ok(())
    }

    async fn stats(&self) -> Result<Option<QueueStats>> {
        let now = Utc::now().timestamp();

        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN visible_at <= ? THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN visible_at > ? THEN 1 ELSE 0 END) AS hidden
            FROM queue_messages
            WHERE queue_name = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        let pending: Option<i64> = row.get("pending");
        let hidden: Option<i64> = row.get("hidden");

        Ok(Some(QueueStats {
            queue_identifier: self.queue_name.clone(),
            pending: pending.unwrap_or(0) as u64,
            in_flight_at_broker: hidden.unwrap_or(0) as u64,
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite queue stopped");
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let id = message.id.clone();
        let payload = serde_json::to_string(&message)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (id, queue_name, receipt, visible_at, payload, created_at, receive_count)
            VALUES (?, ?, NULL, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(&self.queue_name)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_queue() -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, "test-queue".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    fn test_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            pool_code: "P1".to_string(),
            mediation_target: "https://t.example/hook".to_string(),
            auth_token: None,
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn publish_poll_ack_roundtrip() {
        let queue = test_queue().await;

        queue.publish(test_message("m1")).await.unwrap();

        let polled = queue.poll(10, Duration::from_secs(0)).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].message.id, "m1");

        // Hidden while in flight
        let again = queue.poll(10, Duration::from_secs(0)).await.unwrap();
        assert!(again.is_empty());

        queue.ack(&polled[0].receipt).await.unwrap();

        let stats = queue.stats().await.unwrap().unwrap();
        assert_eq!(stats.total_acked, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn nack_makes_message_visible_again() {
        let queue = test_queue().await;

        queue.publish(test_message("m2")).await.unwrap();

        let polled = queue.poll(10, Duration::from_secs(0)).await.unwrap();
        queue.nack(&polled[0].receipt, None).await.unwrap();

        let redelivered = queue.poll(10, Duration::from_secs(0)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message.id, "m2");
        // Receipt handle rotates per delivery
        assert_ne!(redelivered[0].receipt, polled[0].receipt);
    }

    #[tokio::test]
    async fn ack_with_unknown_receipt_fails() {
        let queue = test_queue().await;
        let err = queue.ack("no-such-receipt").await.unwrap_err();
        assert!(matches!(err, QueueError::ReceiptNotFound(_)));
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = test_queue().await;

        for i in 0..3 {
            queue.publish(test_message(&format!("m{}", i))).await.unwrap();
        }

        let polled = queue.poll(10, Duration::from_secs(0)).await.unwrap();
        let ids: Vec<_> = polled.iter().map(|p| p.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }
}
