//! Loopback [`RemoteStore`] that survives restarts.
//!
//! Reads and subscriptions are served by a [`MemoryRemote`]; every accepted
//! write is copied to the `remote_documents` table, which
//! [`SqliteRemote::load`] reads back on the next start. Without it, records
//! synced in an earlier run would look deleted remotely.

use async_trait::async_trait;
use branchsync_engine::{error::Result, Fields, MemoryRemote, RemoteId, RemoteStore, Subscription};
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use super::storage_fault;

/// Durable loopback document store.
#[derive(Debug, Clone)]
pub struct SqliteRemote {
    inner: Arc<MemoryRemote>,
    pool: SqlitePool,
}

impl SqliteRemote {
    /// Restore the documents written by earlier runs.
    pub async fn load(pool: SqlitePool) -> Result<Self> {
        let rows: Vec<(String, String, Json<Fields>)> = sqlx::query_as(
            "SELECT collection, remote_id, fields FROM remote_documents ORDER BY collection, remote_id",
        )
        .fetch_all(&pool)
        .await
        .map_err(storage_fault)?;

        let inner = MemoryRemote::new_shared();
        let documents = rows.len();
        for (collection, remote_id, Json(fields)) in rows {
            inner.insert_external(&collection, &remote_id, fields);
        }
        debug!(documents, "Loaded loopback documents");

        Ok(Self { inner, pool })
    }

    /// The in-memory copy.
    pub fn memory(&self) -> &Arc<MemoryRemote> {
        &self.inner
    }

    /// Copy the current state of one document to the table.
    async fn persist(&self, collection: &str, remote_id: &str) -> Result<()> {
        match self.inner.document(collection, remote_id) {
            Some(fields) => {
                sqlx::query(
                    r#"
                    INSERT INTO remote_documents (collection, remote_id, fields)
                    VALUES (?, ?, ?)
                    ON CONFLICT (collection, remote_id) DO UPDATE SET fields = excluded.fields
                    "#,
                )
                .bind(collection)
                .bind(remote_id)
                .bind(Json(&fields))
                .execute(&self.pool)
                .await
                .map_err(storage_fault)?;
            }
            None => {
                sqlx::query("DELETE FROM remote_documents WHERE collection = ? AND remote_id = ?")
                    .bind(collection)
                    .bind(remote_id)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_fault)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    async fn add(&self, collection: &str, payload: &Fields) -> Result<RemoteId> {
        let remote_id = self.inner.add(collection, payload).await?;
        self.persist(collection, &remote_id).await?;
        Ok(remote_id)
    }

    async fn update(&self, collection: &str, remote_id: &str, payload: &Fields) -> Result<()> {
        self.inner.update(collection, remote_id, payload).await?;
        self.persist(collection, remote_id).await
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<()> {
        self.inner.delete(collection, remote_id).await?;
        self.persist(collection, remote_id).await
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        self.inner.subscribe(collection).await
    }

    async fn probe_reachable(&self) -> bool {
        self.inner.probe_reachable().await
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
    async fn writes_are_reloaded() {
        let pool = test_pool().await;
        let remote = SqliteRemote::load(pool.clone()).await.unwrap();

        let kept = remote
            .add("branches", &fields(json!({"name": "A"})))
            .await
            .unwrap();
        remote
            .update("branches", &kept, &fields(json!({"address": "Mall Road"})))
            .await
            .unwrap();
        let gone = remote
            .add("branches", &fields(json!({"name": "B"})))
            .await
            .unwrap();
        remote.delete("branches", &gone).await.unwrap();

        let reloaded = SqliteRemote::load(pool).await.unwrap();
        let docs = reloaded.memory().documents("branches");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, kept);
        assert_eq!(
            docs[0].fields,
            fields(json!({"name": "A", "address": "Mall Road"}))
        );
    }

    #[tokio::test]
    async fn rejected_write_is_not_persisted() {
        let pool = test_pool().await;
        let remote = SqliteRemote::load(pool.clone()).await.unwrap();
        remote.memory().reject_writes(Some("denied".into()));

        assert!(remote
            .add("branches", &fields(json!({"name": "A"})))
            .await
            .is_err());

        let reloaded = SqliteRemote::load(pool).await.unwrap();
        assert!(reloaded.memory().documents("branches").is_empty());
    }
}
