//! SQLite-backed [`SyncQueue`] over the `queued_operations` table.
//!
//! `AUTOINCREMENT` keeps queue ids strictly increasing even after the newest
//! operation was removed, so insertion order survives restarts.

use async_trait::async_trait;
use branchsync_engine::{
    error::Result, Error, FailureOutcome, Fields, LocalId, NewOperation, OpKind, QueueId,
    QueuedOperation, SyncQueue, Timestamp, DEFAULT_RETRY_CEILING,
};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::storage_fault;

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub queue_id: i64,
    pub kind: String,
    pub local_id: i64,
    pub remote_id: Option<String>,
    pub payload: Json<Fields>,
    pub enqueued_at: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredOperation {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredOperation {
            queue_id: row.try_get("queue_id")?,
            kind: row.try_get("kind")?,
            local_id: row.try_get("local_id")?,
            remote_id: row.try_get("remote_id")?,
            payload: row.try_get("payload")?,
            enqueued_at: row.try_get("enqueued_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl StoredOperation {
    /// Convert the row to an engine operation.
    pub fn into_operation(self) -> Result<QueuedOperation> {
        let kind = OpKind::parse(&self.kind).ok_or_else(|| {
            Error::StorageFault(format!(
                "unknown operation kind '{}' for queue id {}",
                self.kind, self.queue_id
            ))
        })?;

        Ok(QueuedOperation {
            queue_id: self.queue_id as QueueId,
            kind,
            local_id: self.local_id as LocalId,
            remote_id: self.remote_id,
            payload: self.payload.0,
            enqueued_at: self.enqueued_at as Timestamp,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}

/// Durable operation queue.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    retry_ceiling: u32,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retry_ceiling(pool, DEFAULT_RETRY_CEILING)
    }

    pub fn with_retry_ceiling(pool: SqlitePool, ceiling: u32) -> Self {
        Self {
            pool,
            retry_ceiling: ceiling.max(1),
        }
    }

    async fn exists(&self, sql: &str, bind: &str) -> Result<bool> {
        let (found,): (bool,) = sqlx::query_as(sql)
            .bind(bind)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_fault)?;
        Ok(found)
    }
}

#[async_trait]
impl SyncQueue for SqliteQueue {
    async fn enqueue(&self, op: NewOperation) -> Result<QueueId> {
        let (queue_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO queued_operations (kind, local_id, remote_id, payload, enqueued_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING queue_id
            "#,
        )
        .bind(op.kind.as_str())
        .bind(op.local_id as i64)
        .bind(op.remote_id.as_deref())
        .bind(Json(&op.payload))
        .bind(op.enqueued_at as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_fault)?;

        Ok(queue_id as QueueId)
    }

    async fn peek_all(&self) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, StoredOperation>(
            r#"
            SELECT queue_id, kind, local_id, remote_id, payload,
                   enqueued_at, attempts, last_error
            FROM queued_operations
            ORDER BY queue_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_fault)?;

        rows.into_iter().map(StoredOperation::into_operation).collect()
    }

    async fn remove(&self, queue_id: QueueId) -> Result<()> {
        sqlx::query("DELETE FROM queued_operations WHERE queue_id = ?")
            .bind(queue_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_fault)?;
        Ok(())
    }

    async fn record_failure(&self, queue_id: QueueId, error: &str) -> Result<FailureOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage_fault)?;

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT attempts FROM queued_operations WHERE queue_id = ?")
                .bind(queue_id as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_fault)?;

        let Some((attempts,)) = current else {
            return Ok(FailureOutcome::Missing);
        };
        let attempts = attempts as u32 + 1;

        let outcome = if attempts >= self.retry_ceiling {
            sqlx::query("DELETE FROM queued_operations WHERE queue_id = ?")
                .bind(queue_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_fault)?;
            warn!(queue_id, attempts, error, "Operation abandoned");
            FailureOutcome::Abandoned { attempts }
        } else {
            sqlx::query(
                "UPDATE queued_operations SET attempts = ?, last_error = ? WHERE queue_id = ?",
            )
            .bind(attempts as i64)
            .bind(error)
            .bind(queue_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_fault)?;
            FailureOutcome::Retrying { attempts }
        };

        tx.commit().await.map_err(storage_fault)?;
        Ok(outcome)
    }

    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE queued_operations SET remote_id = ? WHERE local_id = ? AND remote_id IS NULL",
        )
        .bind(remote_id)
        .bind(local_id as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_fault)?;

        Ok(result.rows_affected() as usize)
    }

    async fn has_pending_for_remote(&self, remote_id: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM queued_operations WHERE remote_id = ?)",
            remote_id,
        )
        .await
    }

    async fn has_pending_delete_for_remote(&self, remote_id: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS(SELECT 1 FROM queued_operations WHERE remote_id = ? AND kind = 'delete')",
            remote_id,
        )
        .await
    }

    async fn has_pending_for_local(&self, local_id: LocalId) -> Result<bool> {
        let (found,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM queued_operations WHERE local_id = ?)")
                .bind(local_id as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_fault)?;
        Ok(found)
    }

    async fn len(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queued_operations")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_fault)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_peek_in_order() {
        let queue = SqliteQueue::new(test_pool().await);

        let first = queue
            .enqueue(NewOperation::create(1, fields(json!({"name": "A"})), 10))
            .await
            .unwrap();
        let second = queue
            .enqueue(NewOperation::delete(2, Some("doc-2".into()), 11))
            .await
            .unwrap();
        assert!(second > first);

        let ops = queue.peek_all().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].queue_id, first);
        assert_eq!(ops[0].kind, OpKind::Create);
        assert_eq!(ops[0].payload, fields(json!({"name": "A"})));
        assert_eq!(ops[1].kind, OpKind::Delete);
        assert_eq!(ops[1].remote_id.as_deref(), Some("doc-2"));
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn queue_ids_are_not_reused() {
        let queue = SqliteQueue::new(test_pool().await);
        let first = queue
            .enqueue(NewOperation::create(1, Fields::new(), 1))
            .await
            .unwrap();
        queue.remove(first).await.unwrap();

        let next = queue
            .enqueue(NewOperation::create(2, Fields::new(), 2))
            .await
            .unwrap();
        assert!(next > first);
    }

    #[tokio::test]
    async fn failures_evict_at_ceiling() {
        let queue = SqliteQueue::with_retry_ceiling(test_pool().await, 3);
        let id = queue
            .enqueue(NewOperation::create(1, Fields::new(), 1))
            .await
            .unwrap();

        assert_eq!(
            queue.record_failure(id, "timeout").await.unwrap(),
            FailureOutcome::Retrying { attempts: 1 }
        );
        assert_eq!(
            queue.record_failure(id, "timeout").await.unwrap(),
            FailureOutcome::Retrying { attempts: 2 }
        );
        let op = &queue.peek_all().await.unwrap()[0];
        assert_eq!(op.attempts, 2);
        assert_eq!(op.last_error.as_deref(), Some("timeout"));

        assert_eq!(
            queue.record_failure(id, "timeout").await.unwrap(),
            FailureOutcome::Abandoned { attempts: 3 }
        );
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(
            queue.record_failure(id, "timeout").await.unwrap(),
            FailureOutcome::Missing
        );
    }

    #[tokio::test]
    async fn assign_remote_id_fills_only_missing() {
        let queue = SqliteQueue::new(test_pool().await);
        queue
            .enqueue(NewOperation::update(1, None, Fields::new(), 1))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::delete(1, None, 2))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::update(2, Some("doc-2".into()), Fields::new(), 3))
            .await
            .unwrap();

        assert_eq!(queue.assign_remote_id(1, "doc-1").await.unwrap(), 2);
        assert!(queue.has_pending_for_remote("doc-1").await.unwrap());
        assert!(queue.has_pending_delete_for_remote("doc-1").await.unwrap());
        assert!(!queue.has_pending_delete_for_remote("doc-2").await.unwrap());
        assert!(queue.has_pending_for_local(2).await.unwrap());
        assert!(!queue.has_pending_for_local(3).await.unwrap());
        assert_eq!(queue.assign_remote_id(2, "other").await.unwrap(), 0);
    }
}
