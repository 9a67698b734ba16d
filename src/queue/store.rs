//! Queue persistence and the single-writer serialization discipline.
//!
//! Every mutating operation takes the in-process write lock before
//! touching the table, so concurrent producers (scheduler, heartbeat,
//! staleness sweep) can never interleave partial writes.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::schema;

use super::{Priority, QueueItem, TaskType, MAX_ATTEMPTS};

pub struct TaskQueue {
    db: Pool<Sqlite>,
    write_lock: Mutex<()>,
    /// With debug enabled, dead-letter records include the full payload.
    debug: bool,
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> QueueItem {
    QueueItem {
        id: row.get("id"),
        task_type: TaskType::parse(row.get("task_type")).unwrap_or(TaskType::FastScan),
        priority: Priority::from_i64(row.get("priority")),
        created_at: row.get("created_at"),
        attempts: row.get("attempts"),
        last_attempt: row.get("last_attempt"),
        payload: serde_json::from_str(row.get::<String, _>("payload").as_str())
            .unwrap_or(serde_json::Value::Null),
    }
}

impl TaskQueue {
    pub fn new(db: Pool<Sqlite>, debug: bool) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
            debug,
        }
    }

    /// Append an item. Assigns its id and creation timestamp.
    pub async fn enqueue<P: serde::Serialize>(
        &self,
        task_type: TaskType,
        priority: Priority,
        payload: &P,
    ) -> Result<QueueItem> {
        let _guard = self.write_lock.lock().await;

        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.timestamp_millis(),
            &Uuid::new_v4().to_string()[..8]
        );
        let payload_value = serde_json::to_value(payload).context("Failed to encode payload")?;

        sqlx::query(
            r#"
            INSERT INTO queue_items (id, task_type, priority, created_at, attempts, payload)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(task_type.as_str())
        .bind(priority.as_i64())
        .bind(created_at)
        .bind(payload_value.to_string())
        .execute(&self.db)
        .await
        .context("Failed to enqueue item")?;

        tracing::info!(
            "Enqueued {} item {} (priority {:?})",
            task_type.as_str(),
            id,
            priority
        );

        Ok(QueueItem {
            id,
            task_type,
            priority,
            created_at,
            attempts: 0,
            last_attempt: None,
            payload: payload_value,
        })
    }

    /// Next workable item, or None. Validation items are invisible here;
    /// the item is NOT removed until `complete` or dead-letter.
    pub async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM queue_items
            WHERE task_type != 'ei_validation'
            ORDER BY priority ASC, created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await
        .context("Failed to dequeue item")?;

        Ok(row.as_ref().map(row_to_item))
    }

    /// Remove a finished item and record it as the last processed.
    pub async fn complete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await
            .context("Failed to complete queue item")?;

        schema::set_meta(&self.db, "last_processed", id).await?;

        tracing::debug!("Completed queue item {}", id);
        Ok(())
    }

    /// Record a failure. After `MAX_ATTEMPTS` the item is removed and a
    /// dead-letter record is logged.
    pub async fn fail(&self, id: &str, error: Option<&str>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let row = sqlx::query("SELECT * FROM queue_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("Failed to load failing queue item")?;

        let Some(row) = row else {
            tracing::debug!("fail() on unknown queue item {}", id);
            return Ok(());
        };
        let item = row_to_item(&row);

        let attempts = item.attempts + 1;

        if attempts >= MAX_ATTEMPTS {
            sqlx::query("DELETE FROM queue_items WHERE id = ?")
                .bind(id)
                .execute(&self.db)
                .await
                .context("Failed to dead-letter queue item")?;

            if self.debug {
                tracing::error!(
                    "Dead-letter: {} item {} after {} attempts (last error: {}) payload={}",
                    item.task_type.as_str(),
                    id,
                    attempts,
                    error.unwrap_or("unknown"),
                    item.payload
                );
            } else {
                tracing::error!(
                    "Dead-letter: {} item {} after {} attempts (last error: {})",
                    item.task_type.as_str(),
                    id,
                    attempts,
                    error.unwrap_or("unknown")
                );
            }
        } else {
            sqlx::query("UPDATE queue_items SET attempts = ?, last_attempt = ? WHERE id = ?")
                .bind(attempts)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.db)
                .await
                .context("Failed to record queue item failure")?;

            tracing::warn!(
                "Queue item {} failed (attempt {}/{}): {}",
                id,
                attempts,
                MAX_ATTEMPTS,
                error.unwrap_or("unknown")
            );
        }

        Ok(())
    }

    /// Remove an item without recording anything: no `attempts` bump, no
    /// `last_processed` update. Used for aborted fast-scans, which drop
    /// rather than retry.
    pub async fn drop_item(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await
            .context("Failed to drop queue item")?;

        tracing::debug!("Dropped queue item {}", id);
        Ok(())
    }

    /// All pending validation items, FIFO.
    pub async fn pending_validations(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM queue_items
            WHERE task_type = 'ei_validation'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("Failed to load pending validations")?;

        Ok(rows.iter().map(row_to_item).collect())
    }

    /// Drop processed validation items by id.
    pub async fn clear_validations(&self, ids: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        for id in ids {
            sqlx::query("DELETE FROM queue_items WHERE id = ? AND task_type = 'ei_validation'")
                .bind(id)
                .execute(&self.db)
                .await
                .context("Failed to clear validation item")?;
        }
        Ok(())
    }

    /// Number of workable (non-validation) items.
    pub async fn depth(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items WHERE task_type != 'ei_validation'",
        )
        .fetch_one(&self.db)
        .await
        .context("Failed to count queue items")?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_database;

    async fn test_queue() -> TaskQueue {
        TaskQueue::new(init_memory_database().await.unwrap(), false)
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = test_queue().await;

        let a = queue
            .enqueue(TaskType::FastScan, Priority::Normal, &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let _b = queue
            .enqueue(TaskType::FastScan, Priority::Normal, &serde_json::json!({"n": 2}))
            .await
            .unwrap();
        let c = queue
            .enqueue(TaskType::DetailUpdate, Priority::High, &serde_json::json!({"n": 3}))
            .await
            .unwrap();

        // High priority jumps ahead of earlier normal items.
        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, c.id);
        queue.complete(&first.id).await.unwrap();

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, a.id);
    }

    #[tokio::test]
    async fn test_dequeue_does_not_remove() {
        let queue = test_queue().await;
        queue
            .enqueue(TaskType::FastScan, Priority::Normal, &serde_json::json!({}))
            .await
            .unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);

        queue.complete(&first.id).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validations_invisible_to_dequeue() {
        let queue = test_queue().await;
        queue
            .enqueue(TaskType::EiValidation, Priority::Low, &serde_json::json!({}))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.pending_validations().await.unwrap().len(), 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_after_three_failures() {
        let queue = test_queue().await;
        let item = queue
            .enqueue(TaskType::DetailUpdate, Priority::Normal, &serde_json::json!({}))
            .await
            .unwrap();

        queue.fail(&item.id, Some("boom")).await.unwrap();
        queue.fail(&item.id, Some("boom")).await.unwrap();
        let after_two = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(after_two.attempts, 2);
        assert!(after_two.last_attempt.is_some());

        queue.fail(&item.id, Some("boom")).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        // A fourth failure on the removed item is a no-op.
        queue.fail(&item.id, Some("boom")).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_item_leaves_no_trace() {
        let queue = test_queue().await;
        let item = queue
            .enqueue(TaskType::FastScan, Priority::Normal, &serde_json::json!({}))
            .await
            .unwrap();
        queue.fail(&item.id, Some("boom")).await.unwrap();

        queue.drop_item(&item.id).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        // Unlike complete(), dropping never records a last_processed.
        let last = schema::get_meta(&queue.db, "last_processed").await.unwrap();
        assert_eq!(last, None);
    }

    #[tokio::test]
    async fn test_complete_updates_last_processed() {
        let queue = test_queue().await;
        let item = queue
            .enqueue(TaskType::FastScan, Priority::Normal, &serde_json::json!({}))
            .await
            .unwrap();
        queue.complete(&item.id).await.unwrap();

        let last = schema::get_meta(&queue.db, "last_processed").await.unwrap();
        assert_eq!(last, Some(item.id));
    }

    #[tokio::test]
    async fn test_clear_validations() {
        let queue = test_queue().await;
        let v1 = queue
            .enqueue(TaskType::EiValidation, Priority::Low, &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let _v2 = queue
            .enqueue(TaskType::EiValidation, Priority::Low, &serde_json::json!({"x": 2}))
            .await
            .unwrap();

        queue.clear_validations(&[v1.id]).await.unwrap();
        assert_eq!(queue.pending_validations().await.unwrap().len(), 1);
    }
}
