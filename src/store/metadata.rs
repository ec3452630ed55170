//! Metadata database for the embedded store.
//!
//! A single SQLite file holding the namespace table. It is only written
//! during startup bookkeeping; scan tasks never touch it.

use crate::constants::METADATA_LOCK_TIMEOUT;
use crate::error::{Error, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use tracing::debug;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS namespaces (
        name TEXT PRIMARY KEY NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

/// Handle to the metadata database.
#[derive(Debug, Clone)]
pub struct MetadataDb {
    pool: SqlitePool,
}

impl MetadataDb {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageInitFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(METADATA_LOCK_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(METADATA_LOCK_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageInitFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
        }

        debug!(path = %path.display(), "opened metadata database");
        Ok(Self { pool })
    }

    /// Creates `namespace` if missing. Returns true if it was created.
    pub async fn create_namespace(&self, namespace: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query("INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)")
            .bind(namespace)
            .bind(unix_now())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Lists namespaces.
    pub async fn namespaces(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM namespaces ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Closes the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Metadata(e.to_string())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_namespace_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = MetadataDb::open(&dir.path().join("metadata.db")).await.unwrap();

        assert!(db.create_namespace("binscan").await.unwrap());
        assert!(!db.create_namespace("binscan").await.unwrap());
        assert_eq!(db.namespaces().await.unwrap(), vec!["binscan".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("metadata.db");
        {
            let db = MetadataDb::open(&path).await.unwrap();
            db.create_namespace("ns").await.unwrap();
            db.close().await;
        }
        let db = MetadataDb::open(&path).await.unwrap();
        assert!(!db.create_namespace("ns").await.unwrap());
    }
}
