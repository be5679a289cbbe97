// src/preferences.rs

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::manager::DEFAULT_CONCURRENCY;

/// Preference key holding the maximum number of parallel downloads.
pub const CONCURRENCY_KEY: &str = "max-parallel-download";

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Source of the orchestrator's configured settings.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn concurrency_limit(&self) -> Result<usize, PreferenceError>;
}

/// A fixed limit, e.g. from a command-line flag.
#[derive(Debug, Clone, Copy)]
pub struct StaticPreferences(pub usize);

#[async_trait]
impl PreferenceStore for StaticPreferences {
    async fn concurrency_limit(&self) -> Result<usize, PreferenceError> {
        Ok(self.0)
    }
}

/// Key-value preferences persisted in SQLite, values stored as JSON.
pub struct SqlitePreferences {
    conn: Connection,
}

impl SqlitePreferences {
    /// Opens (creating if needed) the preference database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, PreferenceError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, PreferenceError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), PreferenceError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS preferences (
                        key     TEXT PRIMARY KEY,
                        value   TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Reads a preference, `None` if it was never set.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PreferenceError> {
        let owned_key = key.to_owned();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM preferences WHERE key = ?1",
                        params![owned_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        raw.map(|raw| serde_json::from_str(&raw)).transpose().map_err(Into::into)
    }

    /// Writes (inserting or replacing) a preference.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PreferenceError> {
        let raw = serde_json::to_string(value)?;
        let owned_key = key.to_owned();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO preferences (key, value) VALUES (?1, ?2)",
                    params![owned_key, raw],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_concurrency_limit(&self, limit: usize) -> Result<(), PreferenceError> {
        if limit == 0 {
            return Err(PreferenceError::InvalidValue {
                key: CONCURRENCY_KEY.into(),
                reason: "must be at least 1".into(),
            });
        }
        self.set(CONCURRENCY_KEY, &limit).await
    }
}

#[async_trait]
impl PreferenceStore for SqlitePreferences {
    async fn concurrency_limit(&self) -> Result<usize, PreferenceError> {
        Ok(self.get(CONCURRENCY_KEY).await?.unwrap_or(DEFAULT_CONCURRENCY))
    }
}
