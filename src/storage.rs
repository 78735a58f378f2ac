use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage capacity exceeded")]
    CapacityExceeded,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Keyed blob storage. Everything the relay persists lives under a handful
/// of fixed keys, so the contract is a plain string key/value store.
pub trait Storage: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
}

pub struct SqliteStorage {
    path: PathBuf,
}

impl SqliteStorage {
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(&path).map_err(into_storage_error)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(into_storage_error)?;
        Ok(SqliteStorage { path })
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        Connection::open(&self.path).map_err(into_storage_error)
    }
}

impl Storage for SqliteStorage {
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(into_storage_error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connect()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(into_storage_error)
    }
}

fn into_storage_error(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
            StorageError::CapacityExceeded
        }
        _ => StorageError::Backend(err.to_string()),
    }
}
