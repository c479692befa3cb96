// ABOUTME: API key table operations
// ABOUTME: Insert, load, enable/disable, permission updates, hard delete and usage timestamps
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use super::{from_millis, from_millis_opt, to_millis, Database};
use crate::api_keys::ApiKey;
use crate::errors::{AppError, AppResult};
use crate::permissions::PermissionSet;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

impl Database {
    /// Insert a new key
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if an enabled key already has the name, or a
    /// database error if the insert fails
    pub async fn create_api_key(&self, api_key: &ApiKey) -> AppResult<()> {
        let permissions = api_key.permissions.to_json()?;

        sqlx::query(
            r"
            INSERT INTO api_keys (
                id, name, key_prefix, key_hash, permissions, rate_limit,
                enabled, expires_at, created_at, last_used_at, created_by, notes
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            ",
        )
        .bind(api_key.id.to_string())
        .bind(&api_key.name)
        .bind(&api_key.key_prefix)
        .bind(&api_key.key_hash)
        .bind(permissions)
        .bind(i64::from(api_key.rate_limit))
        .bind(api_key.enabled)
        .bind(api_key.expires_at.map(to_millis))
        .bind(to_millis(api_key.created_at))
        .bind(api_key.last_used_at.map(to_millis))
        .bind(&api_key.created_by)
        .bind(&api_key.notes)
        .execute(&self.pool)
        .await
        .map_err(|e| map_name_conflict(e, &api_key.name, "Failed to create API key"))?;

        debug!(key_id = %api_key.id, key_prefix = %api_key.key_prefix, "API key row inserted");
        Ok(())
    }

    /// Load every key, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded
    pub async fn list_all_api_keys(&self) -> AppResult<Vec<ApiKey>> {
        let rows = sqlx::query(
            r"
            SELECT id, name, key_prefix, key_hash, permissions, rate_limit, enabled,
                   expires_at, created_at, last_used_at, created_by, notes
            FROM api_keys
            ORDER BY created_at ASC, id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to load API keys: {e}")))?;

        rows.iter().map(Self::row_to_api_key).collect()
    }

    /// Get a key by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded
    pub async fn get_api_key(&self, id: Uuid) -> AppResult<Option<ApiKey>> {
        let row = sqlx::query(
            r"
            SELECT id, name, key_prefix, key_hash, permissions, rate_limit, enabled,
                   expires_at, created_at, last_used_at, created_by, notes
            FROM api_keys
            WHERE id = $1
            ",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get API key: {e}")))?;

        row.as_ref().map(Self::row_to_api_key).transpose()
    }

    /// Enable or disable a key; returns whether a row changed
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` when enabling would collide with another enabled
    /// key, or a database error
    pub async fn set_api_key_enabled(&self, id: Uuid, name: &str, enabled: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE api_keys SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_name_conflict(e, name, "Failed to update API key status"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace a key's permissions; returns whether a row changed
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the update fails
    pub async fn update_api_key_permissions(
        &self,
        id: Uuid,
        permissions: &PermissionSet,
    ) -> AppResult<bool> {
        let result = sqlx::query("UPDATE api_keys SET permissions = $1 WHERE id = $2")
            .bind(permissions.to_json()?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update API key permissions: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Change a key's rate limit; returns whether a row changed
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub async fn update_api_key_rate_limit(&self, id: Uuid, rate_limit: u32) -> AppResult<bool> {
        let result = sqlx::query("UPDATE api_keys SET rate_limit = $1 WHERE id = $2")
            .bind(i64::from(rate_limit))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update API key rate limit: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Permanently remove a key; returns whether a row was removed
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub async fn delete_api_key(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to delete API key: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist buffered `last_used_at` values in one transaction
    ///
    /// A stored value is never moved backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written in that case
    pub async fn record_api_keys_last_used(
        &self,
        usage: &[(Uuid, DateTime<Utc>)],
    ) -> AppResult<u64> {
        if usage.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin usage transaction: {e}")))?;

        let mut updated = 0;
        for (id, used_at) in usage {
            let result = sqlx::query(
                r"
                UPDATE api_keys
                SET last_used_at = MAX(COALESCE(last_used_at, 0), $1)
                WHERE id = $2
                ",
            )
            .bind(to_millis(*used_at))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to record API key usage: {e}")))?;
            updated += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit usage transaction: {e}")))?;

        Ok(updated)
    }

    fn row_to_api_key(row: &SqliteRow) -> AppResult<ApiKey> {
        let id: String = row.get("id");
        let permissions: String = row.get("permissions");
        let rate_limit: i64 = row.get("rate_limit");

        Ok(ApiKey {
            id: Uuid::parse_str(&id)
                .map_err(|e| AppError::database(format!("Failed to parse API key id: {e}")))?,
            name: row.get("name"),
            key_prefix: row.get("key_prefix"),
            key_hash: row.get("key_hash"),
            permissions: PermissionSet::from_json(&permissions)?,
            rate_limit: u32::try_from(rate_limit).map_err(|e| {
                AppError::database(format!("Integer conversion failed for rate_limit: {e}"))
            })?,
            enabled: row.get("enabled"),
            expires_at: from_millis_opt(row.get("expires_at"))?,
            created_at: from_millis(row.get("created_at"))?,
            last_used_at: from_millis_opt(row.get("last_used_at"))?,
            created_by: row.get("created_by"),
            notes: row.get("notes"),
        })
    }
}

fn map_name_conflict(error: sqlx::Error, name: &str, context: &str) -> AppError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() && db_error.message().contains("api_keys.name") {
            return AppError::duplicate_name(name);
        }
    }
    AppError::database(format!("{context}: {error}"))
}
