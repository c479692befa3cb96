// ABOUTME: SQLite persistence for API keys and the audit log
// ABOUTME: Owns the connection pool, schema migration and timestamp encoding helpers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Database Management
//!
//! A single [`Database`] handle backs both the key store and the audit sink.
//! Timestamps are stored as UTC epoch milliseconds so range filters and
//! ordering are plain integer comparisons.

mod api_keys;
mod audit;

use crate::config::DatabaseUrl;
use crate::constants::audit_chain;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Pool size for file-backed databases
const MAX_CONNECTIONS: u32 = 5;

/// Database manager for key and audit storage
#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the
    /// connection fails, or a migration statement fails
    pub async fn new(url: &DatabaseUrl) -> AppResult<Self> {
        let pool = match url {
            DatabaseUrl::Memory => {
                // Every connection to :memory: is a separate database, so pin one
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(Self::connect_options(&url.to_connection_string())?)
                    .await
            }
            DatabaseUrl::SQLite { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        AppError::database(format!(
                            "Failed to create database directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                let options = Self::connect_options(&url.to_connection_string())?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);
                SqlitePoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .connect_with(options)
                    .await
            }
        }
        .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

        let db = Self { pool };
        db.migrate().await?;
        info!(in_memory = url.is_memory(), "Database ready");
        Ok(db)
    }

    /// Open a database from a connection string such as `sqlite::memory:`
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`]
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        Self::new(&DatabaseUrl::parse_url(database_url)).await
    }

    fn connect_options(connection_string: &str) -> AppResult<SqliteConnectOptions> {
        Ok(SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| AppError::database(format!("Invalid database URL: {e}")))?
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true))
    }

    /// Get a reference to the database pool
    #[must_use]
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    ///
    /// # Errors
    ///
    /// Returns an error if any schema statement fails
    pub async fn migrate(&self) -> AppResult<()> {
        self.migrate_api_keys().await?;
        self.migrate_audit_log().await?;
        debug!("Database migrations complete");
        Ok(())
    }

    async fn migrate_api_keys(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                permissions TEXT NOT NULL DEFAULT '[]',
                rate_limit INTEGER NOT NULL CHECK (rate_limit > 0),
                enabled INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                created_by TEXT,
                notes TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create api_keys table: {e}")))?;

        // Names are unique among enabled keys only
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_active_name ON api_keys(name) WHERE enabled = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create api_keys name index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_created_at ON api_keys(created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to create api_keys index: {e}")))?;

        Ok(())
    }

    async fn migrate_audit_log(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                kind TEXT NOT NULL,
                key_id TEXT,
                key_prefix TEXT,
                actor TEXT,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT,
                source_address TEXT,
                detail TEXT,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create audit_log table: {e}")))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_key_id ON audit_log(key_id)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::database(format!("Failed to create audit_log index: {e}")))?;
        }

        // Single row: hash the oldest kept entry links to, and the newest entry's hash
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS audit_chain (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                anchor_hash TEXT NOT NULL,
                head_hash TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create audit_chain table: {e}")))?;

        sqlx::query(
            "INSERT OR IGNORE INTO audit_chain (id, anchor_hash, head_hash) VALUES (1, $1, $1)",
        )
        .bind(audit_chain::GENESIS_HASH)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to seed audit_chain: {e}")))?;

        Ok(())
    }

    /// Close the pool, waiting for in-flight statements
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Encode a timestamp for storage
#[must_use]
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Decode a stored timestamp
pub(crate) fn from_millis(millis: i64) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AppError::database(format!("Stored timestamp out of range: {millis}")))
}

/// Decode an optional stored timestamp
pub(crate) fn from_millis_opt(millis: Option<i64>) -> AppResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_database_migrates_twice() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('api_keys', 'audit_log') ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_unique_index_on_enabled_names() {
        use crate::api_keys::{ApiKeyManager, CreateApiKeyRequest};
        use crate::errors::ErrorCode;

        let db = Database::connect("sqlite::memory:").await.unwrap();
        let manager = ApiKeyManager::default();
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let (first, _) = manager
            .build_key(CreateApiKeyRequest::new("backup", ["snapshot:*"]), now)
            .unwrap();
        let (second, _) = manager
            .build_key(CreateApiKeyRequest::new("backup", ["snapshot:read"]), now)
            .unwrap();

        db.create_api_key(&first).await.unwrap();
        let err = db.create_api_key(&second).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateName);

        assert!(db.set_api_key_enabled(first.id, "backup", false).await.unwrap());
        db.create_api_key(&second).await.unwrap();

        let err = db
            .set_api_key_enabled(first.id, "backup", true)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateName);

        let stored = db.get_api_key(first.id).await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.created_at, now);
        assert!(db.get_api_key(uuid::Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_millis_roundtrip() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
        assert!(from_millis_opt(None).unwrap().is_none());
    }
}
