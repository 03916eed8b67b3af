use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::Job;

/// Durable per-backend job channel with at-least-once delivery
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job on the named queue
    async fn publish(&self, queue: &str, job: &Job) -> Result<(), QueueError>;

    /// Lease the oldest deliverable message, if any
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message for good
    async fn ack(&self, tag: Uuid) -> Result<(), QueueError>;

    /// Give a delivered message back to the queue, or dead-letter it
    async fn reject(&self, tag: Uuid, requeue: bool) -> Result<(), QueueError>;

    /// Messages waiting for a consumer
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;
}

/// A leased message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: Uuid,
    pub queue: String,
    pub body: String,
    pub delivery_count: u32,
}

impl Delivery {
    /// True when an earlier lease on this message lapsed without an ack
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn decode(&self) -> Result<Job, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        body TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'ready',
        delivery_tag TEXT,
        delivery_count INTEGER NOT NULL DEFAULT 0,
        leased_until INTEGER,
        published_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_by_queue ON jobs (queue, state, id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS jobs_by_tag ON jobs (delivery_tag)",
];

/// Persistent queue stored next to the documents
///
/// A lease that is not acknowledged before it expires makes the message
/// deliverable again, which is how a consumer crash turns into redelivery.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Publish an arbitrary body, bypassing job encoding
    pub async fn publish_raw(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO jobs (queue, body, published_at) VALUES (?, ?, ?)")
            .bind(queue)
            .bind(body)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Messages rejected without requeue
    pub async fn dead_lettered(&self, queue: &str) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = 'dead'")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn publish(&self, queue: &str, job: &Job) -> Result<(), QueueError> {
        let body = serde_json::to_string(job)?;
        self.publish_raw(queue, &body).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let tag = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let leased_until = now.saturating_add(lease_ms);

        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET state = 'leased', delivery_tag = ?, delivery_count = delivery_count + 1, leased_until = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND (state = 'ready' OR (state = 'leased' AND leased_until < ?))
                ORDER BY id
                LIMIT 1
            )
            RETURNING body, delivery_count
            "#,
        )
        .bind(tag.to_string())
        .bind(leased_until)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(body, delivery_count)| Delivery {
            tag,
            queue: queue.to_string(),
            body,
            delivery_count: delivery_count as u32,
        }))
    }

    async fn ack(&self, tag: Uuid) -> Result<(), QueueError> {
        let removed = sqlx::query("DELETE FROM jobs WHERE delivery_tag = ? AND state = 'leased'")
            .bind(tag.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }

    async fn reject(&self, tag: Uuid, requeue: bool) -> Result<(), QueueError> {
        let sql = if requeue {
            "UPDATE jobs SET state = 'ready', delivery_tag = NULL, leased_until = NULL WHERE delivery_tag = ? AND state = 'leased'"
        } else {
            "UPDATE jobs SET state = 'dead', leased_until = NULL WHERE delivery_tag = ? AND state = 'leased'"
        };

        let updated = sqlx::query(sql)
            .bind(tag.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = 'ready'")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::memory_pool;

    async fn queue(lease: Duration) -> SqliteQueue {
        let queue = SqliteQueue::new(memory_pool().await.unwrap(), lease);
        queue.migrate().await.unwrap();
        queue
    }

    fn job(id: &str) -> Job {
        Job {
            generation_id: id.to_string(),
            backend: "ivy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fifo_per_queue() {
        let q = queue(Duration::from_secs(60)).await;
        q.publish("ivy", &job("g1")).await.unwrap();
        q.publish("boa", &job("other")).await.unwrap();
        q.publish("ivy", &job("g2")).await.unwrap();

        let first = q.receive("ivy").await.unwrap().unwrap();
        assert_eq!(first.decode().unwrap().generation_id, "g1");
        q.ack(first.tag).await.unwrap();

        let second = q.receive("ivy").await.unwrap().unwrap();
        assert_eq!(second.decode().unwrap().generation_id, "g2");
        assert!(!second.redelivered());
        q.ack(second.tag).await.unwrap();

        assert!(q.receive("ivy").await.unwrap().is_none());
        assert_eq!(q.depth("boa").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_leased_message_is_hidden_until_expiry() {
        let q = queue(Duration::from_secs(60)).await;
        q.publish("ivy", &job("g1")).await.unwrap();

        let _held = q.receive("ivy").await.unwrap().unwrap();
        assert!(q.receive("ivy").await.unwrap().is_none());
        assert_eq!(q.depth("ivy").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let q = queue(Duration::ZERO).await;
        q.publish("ivy", &job("g1")).await.unwrap();

        let lost = q.receive("ivy").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let again = q.receive("ivy").await.unwrap().unwrap();
        assert!(again.redelivered());
        assert_eq!(again.decode().unwrap(), job("g1"));

        // the stale consumer's ack no longer matches the message
        assert!(matches!(q.ack(lost.tag).await, Err(QueueError::UnknownDelivery(_))));
        q.ack(again.tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_requeue_and_dead_letter() {
        let q = queue(Duration::from_secs(60)).await;
        q.publish("ivy", &job("g1")).await.unwrap();

        let delivery = q.receive("ivy").await.unwrap().unwrap();
        q.reject(delivery.tag, true).await.unwrap();
        assert_eq!(q.depth("ivy").await.unwrap(), 1);

        let delivery = q.receive("ivy").await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 2);
        q.reject(delivery.tag, false).await.unwrap();
        assert_eq!(q.depth("ivy").await.unwrap(), 0);
        assert!(q.receive("ivy").await.unwrap().is_none());
    }
}
