//! Broker backed by PostgreSQL.
//!
//! Uses SKIP LOCKED so several daemons can consume the same queues.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Broker, Delivery, PublishOptions};
use crate::{SchedulerError, SchedulerResult};

/// A claimed message row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct MessageRecord {
    id: i64,
    queue: String,
    body: Vec<u8>,
    priority: i16,
}

impl From<MessageRecord> for Delivery {
    fn from(record: MessageRecord) -> Self {
        Delivery {
            tag: record.id as u64,
            queue: record.queue,
            body: record.body,
            priority: record.priority.clamp(0, 255) as u8,
        }
    }
}

/// Move expired, unclaimed messages to their queue's dead-letter queue, for
/// one queue or for all of them. Expired messages of a queue without one are
/// dropped.
async fn dead_letter_expired(pool: &PgPool, queue: Option<&str>) -> SchedulerResult<u64> {
    let result = sqlx::query(
        r#"
        WITH expired AS (
            DELETE FROM queue_messages
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE ($1::text IS NULL OR queue = $1)
                  AND claimed_at IS NULL
                  AND expire_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, body, priority
        )
        INSERT INTO queue_messages (queue, body, priority)
        SELECT q.dead_letter, e.body, e.priority
        FROM expired e
        JOIN queues q ON q.name = e.queue
        WHERE q.dead_letter IS NOT NULL
          AND EXISTS (SELECT 1 FROM queues d WHERE d.name = q.dead_letter)
        ORDER BY e.id
        "#,
    )
    .bind(queue)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Dead-letter expired messages of every queue, including queues whose
/// consumer is busy.
async fn run_sweeper(pool: PgPool, interval: Duration, shutdown: CancellationToken) {
    loop {
        match dead_letter_expired(&pool, None).await {
            Ok(0) => {}
            Ok(moved) => debug!(moved, "Expired messages dead-lettered"),
            Err(e) => warn!(error = %e, "Failed to sweep expired messages"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

pub struct PgBroker {
    pool: PgPool,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl PgBroker {
    /// Create a broker and start its sweeper. Must be called within a Tokio runtime.
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        tokio::spawn(run_sweeper(pool.clone(), poll_interval, shutdown.clone()));
        Self {
            pool,
            poll_interval,
            shutdown,
        }
    }

    async fn exists(&self, queue: &str) -> SchedulerResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM queues WHERE name = $1)")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Claim the next available message.
    async fn claim(&self, queue: &str) -> SchedulerResult<Option<Delivery>> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            UPDATE queue_messages
            SET claimed_at = NOW()
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1
                  AND claimed_at IS NULL
                  AND (expire_at IS NULL OR expire_at > NOW())
                ORDER BY priority DESC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, queue, body, priority
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Delivery::from))
    }
}

impl Drop for PgBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn declare(&self, queue: &str, dead_letter: Option<&str>) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queues (name, dead_letter) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET dead_letter = EXCLUDED.dead_letter
            "#,
        )
        .bind(queue)
        .bind(dead_letter)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, queue: &str) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let purged = sqlx::query("DELETE FROM queue_messages WHERE queue = $1")
            .bind(queue)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM queues WHERE name = $1")
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(purged)
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> SchedulerResult<()> {
        // A TTL past the clock's range never expires.
        let expire_at = options
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));

        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages (queue, body, priority, expire_at)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM queues WHERE name = $1)
            "#,
        )
        .bind(queue)
        .bind(body)
        .bind(options.priority as i16)
        .bind(expire_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::Queue(format!(
                "queue {} is not declared",
                queue
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> SchedulerResult<Option<Delivery>> {
        loop {
            if !self.exists(queue).await? {
                return Ok(None);
            }
            dead_letter_expired(&self.pool, Some(queue)).await?;
            if let Some(delivery) = self.claim(queue).await? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery.tag as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()> {
        let sql = if requeue {
            "UPDATE queue_messages SET claimed_at = NULL WHERE id = $1"
        } else {
            "DELETE FROM queue_messages WHERE id = $1"
        };
        sqlx::query(sql)
            .bind(delivery.tag as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release claimed messages back to pending (e.g., on worker crash recovery).
    async fn recover(&self, queue: &str) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE queue_messages SET claimed_at = NULL WHERE queue = $1 AND claimed_at IS NOT NULL",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
