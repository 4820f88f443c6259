use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::store::{Collection, KvBackend, KvWrite, StoreError};

/// SQLite file backend. Every write is committed with `synchronous = FULL`
/// before the call returns.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let database_url = format!("sqlite:{}", path.as_ref().display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // single writer; the device is the only client of this file
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %path.as_ref().display(), "local store opened");
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE collection = ? AND key = ?")
            .bind(collection.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE collection = ? ORDER BY seq")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((row.try_get("key")?, row.try_get("value")?));
        }

        Ok(entries)
    }

    async fn apply(&self, writes: Vec<KvWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for write in writes {
            match write {
                KvWrite::Put {
                    collection,
                    key,
                    value,
                } => {
                    sqlx::query(
                        "INSERT INTO kv (collection, key, value) VALUES (?, ?, ?) \
                         ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    )
                    .bind(collection.as_str())
                    .bind(&key)
                    .bind(&value)
                    .execute(&mut *tx)
                    .await?;
                }
                KvWrite::Delete { collection, key } => {
                    sqlx::query("DELETE FROM kv WHERE collection = ? AND key = ?")
                        .bind(collection.as_str())
                        .bind(&key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(())
    }
}
