//! SQLite-backed [`LocalStore`] over the `records` table.

use async_trait::async_trait;
use branchsync_engine::{error::Result, Error, Fields, LocalId, LocalStore, Record, Timestamp};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::storage_fault;

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub local_id: i64,
    pub remote_id: Option<String>,
    pub fields: Json<Fields>,
    pub is_synced: bool,
    pub last_updated: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            local_id: row.try_get("local_id")?,
            remote_id: row.try_get("remote_id")?,
            fields: row.try_get("fields")?,
            is_synced: row.try_get("is_synced")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

impl StoredRecord {
    /// Convert the row to an engine record.
    pub fn into_record(self) -> Record {
        Record {
            local_id: self.local_id as LocalId,
            remote_id: self.remote_id,
            fields: self.fields.0,
            is_synced: self.is_synced,
            last_updated: self.last_updated as Timestamp,
        }
    }
}

const SELECT_RECORD: &str =
    "SELECT local_id, remote_id, fields, is_synced, last_updated FROM records";

/// Durable record table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_in(
        tx: &mut Transaction<'_, Sqlite>,
        local_id: LocalId,
    ) -> Result<Option<StoredRecord>> {
        sqlx::query_as::<_, StoredRecord>(&format!("{SELECT_RECORD} WHERE local_id = ?"))
            .bind(local_id as i64)
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage_fault)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn create(&self, fields: Fields, timestamp: Timestamp) -> Result<LocalId> {
        let (local_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO records (remote_id, fields, is_synced, last_updated)
            VALUES (NULL, ?, 0, ?)
            RETURNING local_id
            "#,
        )
        .bind(Json(&fields))
        .bind(timestamp as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_fault)?;

        Ok(local_id as LocalId)
    }

    async fn update(
        &self,
        local_id: LocalId,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<Record> {
        let mut tx = self.pool.begin().await.map_err(storage_fault)?;
        let mut record = Self::fetch_in(&mut tx, local_id)
            .await?
            .ok_or(Error::RecordNotFound(local_id))?
            .into_record();

        record.apply_local_edit(fields, timestamp);

        sqlx::query(
            "UPDATE records SET fields = ?, is_synced = 0, last_updated = ? WHERE local_id = ?",
        )
        .bind(Json(&record.fields))
        .bind(timestamp as i64)
        .bind(local_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_fault)?;

        tx.commit().await.map_err(storage_fault)?;
        Ok(record)
    }

    async fn delete(&self, local_id: LocalId) -> Result<Record> {
        let mut tx = self.pool.begin().await.map_err(storage_fault)?;
        let record = Self::fetch_in(&mut tx, local_id)
            .await?
            .ok_or(Error::RecordNotFound(local_id))?
            .into_record();

        sqlx::query("DELETE FROM records WHERE local_id = ?")
            .bind(local_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_fault)?;

        tx.commit().await.map_err(storage_fault)?;
        Ok(record)
    }

    async fn get(&self, local_id: LocalId) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, StoredRecord>(&format!("{SELECT_RECORD} WHERE local_id = ?"))
            .bind(local_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_fault)?;

        Ok(row.map(StoredRecord::into_record))
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Record>> {
        let row =
            sqlx::query_as::<_, StoredRecord>(&format!("{SELECT_RECORD} WHERE remote_id = ?"))
                .bind(remote_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_fault)?;

        Ok(row.map(StoredRecord::into_record))
    }

    async fn list(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, StoredRecord>(&format!("{SELECT_RECORD} ORDER BY local_id"))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_fault)?;

        Ok(rows.into_iter().map(StoredRecord::into_record).collect())
    }

    async fn confirm(&self, local_id: LocalId, remote_id: &str, synced: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE records SET remote_id = ?, is_synced = ? WHERE local_id = ?")
            .bind(remote_id)
            .bind(synced)
            .bind(local_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_fault)?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_remote(
        &self,
        remote_id: &str,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<LocalId> {
        let mut tx = self.pool.begin().await.map_err(storage_fault)?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT local_id FROM records WHERE remote_id = ?")
                .bind(remote_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_fault)?;

        let local_id = match existing {
            Some((local_id,)) => {
                sqlx::query(
                    "UPDATE records SET fields = ?, is_synced = 1, last_updated = ? WHERE local_id = ?",
                )
                .bind(Json(&fields))
                .bind(timestamp as i64)
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(storage_fault)?;
                local_id
            }
            None => {
                let (local_id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO records (remote_id, fields, is_synced, last_updated)
                    VALUES (?, ?, 1, ?)
                    RETURNING local_id
                    "#,
                )
                .bind(remote_id)
                .bind(Json(&fields))
                .bind(timestamp as i64)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_fault)?;
                local_id
            }
        };

        tx.commit().await.map_err(storage_fault)?;
        Ok(local_id as LocalId)
    }
}
