// ABOUTME: Audit log table operations implementing the audit sink
// ABOUTME: Hash-chained batched appends, filtered newest-first queries, pruning and chain verification
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use super::{from_millis, to_millis, Database};
use crate::constants::audit_chain;
use crate::errors::{AppError, AppResult};
use crate::security::audit::{AuditEntry, AuditQuery, AuditSink, ChainBreak, ChainVerification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

/// Text columns covered by an entry's hash, in hashing order
const HASHED_COLUMNS: [&str; 10] = [
    "kind",
    "key_id",
    "key_prefix",
    "actor",
    "action",
    "resource",
    "outcome",
    "reason",
    "source_address",
    "detail",
];

impl Database {
    /// Append audit entries in a single transaction, extending the hash chain
    ///
    /// # Errors
    ///
    /// Returns an error if any insert or the commit fails; no entry is kept then
    pub async fn append_audit_entries(&self, entries: &[AuditEntry]) -> AppResult<()> {
        let mut tx = self.begin_audit_write().await?;
        let mut prev_hash: String = sqlx::query("SELECT head_hash FROM audit_chain WHERE id = 1")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to read audit chain head: {e}")))?
            .get("head_hash");

        for entry in entries {
            let timestamp = to_millis(entry.timestamp);
            let key_id = entry.key_id.map(|id| id.to_string());
            let detail = entry
                .detail
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let entry_hash = chain_hash(
                &prev_hash,
                timestamp,
                &[
                    Some(entry.kind.as_str()),
                    key_id.as_deref(),
                    entry.key_prefix.as_deref(),
                    entry.actor.as_deref(),
                    Some(entry.action.as_str()),
                    Some(entry.resource.as_str()),
                    Some(entry.outcome.as_str()),
                    entry.reason.as_deref(),
                    entry.source_address.as_deref(),
                    detail.as_deref(),
                ],
            );

            sqlx::query(
                r"
                INSERT INTO audit_log (
                    timestamp, kind, key_id, key_prefix, actor, action, resource,
                    outcome, reason, source_address, detail, prev_hash, entry_hash
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ",
            )
            .bind(timestamp)
            .bind(entry.kind.as_str())
            .bind(key_id)
            .bind(&entry.key_prefix)
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(&entry.resource)
            .bind(entry.outcome.as_str())
            .bind(&entry.reason)
            .bind(&entry.source_address)
            .bind(detail)
            .bind(&prev_hash)
            .bind(&entry_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to append audit entry: {e}")))?;

            prev_hash = entry_hash;
        }

        sqlx::query("UPDATE audit_chain SET head_hash = $1 WHERE id = 1")
            .bind(&prev_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to advance audit chain head: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit audit entries: {e}")))?;
        Ok(())
    }

    /// Begin a transaction that already holds the write lock
    ///
    /// Writing first means the chain head read afterwards cannot go stale
    /// when another process appends at the same time.
    async fn begin_audit_write(&self) -> AppResult<Transaction<'static, Sqlite>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin audit transaction: {e}")))?;
        sqlx::query("UPDATE audit_chain SET head_hash = head_hash WHERE id = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to lock audit chain: {e}")))?;
        Ok(tx)
    }

    /// Query audit entries, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded
    pub async fn query_audit_entries(&self, filter: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        let mut query = String::from(
            r"
            SELECT id, timestamp, kind, key_id, key_prefix, actor, action,
                   resource, outcome, reason, source_address, detail
            FROM audit_log WHERE 1=1
            ",
        );

        if filter.key_id.is_some() {
            query.push_str(" AND key_id = ?");
        }
        if filter.key_prefix.is_some() {
            query.push_str(" AND key_prefix LIKE ? ESCAPE '\\'");
        }
        if filter.action.is_some() {
            query.push_str(" AND action = ?");
        }
        if filter.resource.is_some() {
            query.push_str(" AND resource = ?");
        }
        if filter.outcome.is_some() {
            query.push_str(" AND outcome = ?");
        }
        if filter.since.is_some() {
            query.push_str(" AND timestamp >= ?");
        }
        if filter.until.is_some() {
            query.push_str(" AND timestamp < ?");
        }
        query.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");

        let mut sql_query = sqlx::query(&query);

        if let Some(id) = filter.key_id {
            sql_query = sql_query.bind(id.to_string());
        }
        if let Some(prefix) = &filter.key_prefix {
            sql_query = sql_query.bind(format!("{}%", escape_like(prefix)));
        }
        if let Some(action) = &filter.action {
            sql_query = sql_query.bind(action.clone());
        }
        if let Some(resource) = &filter.resource {
            sql_query = sql_query.bind(resource.clone());
        }
        if let Some(outcome) = filter.outcome {
            sql_query = sql_query.bind(outcome.as_str());
        }
        if let Some(since) = filter.since {
            sql_query = sql_query.bind(to_millis(since));
        }
        if let Some(until) = filter.until {
            sql_query = sql_query.bind(to_millis(until));
        }
        sql_query = sql_query.bind(i64::from(filter.limit));

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to query audit log: {e}")))?;

        rows.iter().map(Self::row_to_audit_entry).collect()
    }

    /// Delete the oldest run of entries with a timestamp before `cutoff`
    ///
    /// Deletion stops at the first entry (in write order) that is not older
    /// than `cutoff`, and the hash of the last deleted entry becomes the
    /// chain anchor. An old entry written after a newer one is removed by a
    /// later prune.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub async fn delete_audit_entries_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut tx = self.begin_audit_write().await?;

        let last = sqlx::query(
            r"
            SELECT id, entry_hash FROM audit_log
            WHERE id < COALESCE(
                (SELECT MIN(id) FROM audit_log WHERE timestamp >= $1),
                (SELECT MAX(id) + 1 FROM audit_log)
            )
            ORDER BY id DESC LIMIT 1
            ",
        )
        .bind(to_millis(cutoff))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to select audit entries to prune: {e}")))?;

        let Some(last) = last else {
            return Ok(0);
        };
        let last_id: i64 = last.get("id");
        let anchor_hash: String = last.get("entry_hash");

        let removed = sqlx::query("DELETE FROM audit_log WHERE id <= $1")
            .bind(last_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to prune audit log: {e}")))?
            .rows_affected();

        sqlx::query("UPDATE audit_chain SET anchor_hash = $1 WHERE id = 1")
            .bind(&anchor_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to move audit chain anchor: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit audit prune: {e}")))?;
        Ok(removed)
    }

    /// Walk the audit log oldest first and check every link and hash
    ///
    /// Runs in one read transaction so appends made during the walk are not
    /// seen halfway.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails; a broken chain is a normal result
    pub async fn verify_audit_chain(&self) -> AppResult<ChainVerification> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin audit transaction: {e}")))?;

        let chain = sqlx::query("SELECT anchor_hash, head_hash FROM audit_chain WHERE id = 1")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to read audit chain: {e}")))?;
        let mut expected_prev: String = chain.get("anchor_hash");
        let head_hash: String = chain.get("head_hash");

        let mut verified = 0_u64;
        let mut after_id = 0_i64;
        loop {
            let rows = sqlx::query(
                r"
                SELECT id, timestamp, kind, key_id, key_prefix, actor, action, resource,
                       outcome, reason, source_address, detail, prev_hash, entry_hash
                FROM audit_log WHERE id > $1
                ORDER BY id ASC LIMIT $2
                ",
            )
            .bind(after_id)
            .bind(audit_chain::VERIFY_PAGE_SIZE)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to read audit log: {e}")))?;

            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let entry_id: i64 = row.get("id");
                let prev_hash: String = row.get("prev_hash");
                let entry_hash: String = row.get("entry_hash");

                let broken = if prev_hash != expected_prev {
                    Some(ChainBreak::BrokenLink { entry_id })
                } else if stored_entry_hash(row, &prev_hash) != entry_hash {
                    Some(ChainBreak::ContentAltered { entry_id })
                } else {
                    None
                };
                if broken.is_some() {
                    return Ok(ChainVerification { verified, broken });
                }

                verified += 1;
                after_id = entry_id;
                expected_prev = entry_hash;
            }
        }

        Ok(ChainVerification {
            verified,
            broken: (expected_prev != head_hash).then_some(ChainBreak::HeadMismatch),
        })
    }

    fn row_to_audit_entry(row: &SqliteRow) -> AppResult<AuditEntry> {
        let kind: String = row.get("kind");
        let outcome: String = row.get("outcome");
        let key_id: Option<String> = row.get("key_id");
        let detail: Option<String> = row.get("detail");

        Ok(AuditEntry {
            id: Some(row.get("id")),
            timestamp: from_millis(row.get("timestamp"))?,
            kind: kind.parse()?,
            key_id: key_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|e| AppError::database(format!("Failed to parse audit key_id: {e}")))?,
            key_prefix: row.get("key_prefix"),
            actor: row.get("actor"),
            action: row.get("action"),
            resource: row.get("resource"),
            outcome: outcome.parse()?,
            reason: row.get("reason"),
            source_address: row.get("source_address"),
            detail: detail
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?,
        })
    }
}

/// SHA-256 over the predecessor hash and an entry's stored columns
///
/// Text columns are length-prefixed with a presence marker so `NULL`, an
/// empty string and shifted boundaries all hash differently.
fn chain_hash(prev_hash: &str, timestamp: i64, columns: &[Option<&str>; 10]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(audit_chain::DOMAIN);
    hasher.update(prev_hash.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    for column in columns {
        match column {
            Some(value) => {
                hasher.update([1_u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0_u8]),
        }
    }
    hex::encode(hasher.finalize())
}

fn stored_entry_hash(row: &SqliteRow, prev_hash: &str) -> String {
    let columns: [Option<String>; 10] = HASHED_COLUMNS.map(|column| row.get(column));
    chain_hash(
        prev_hash,
        row.get("timestamp"),
        &columns.each_ref().map(Option::as_deref),
    )
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl AuditSink for Database {
    async fn append(&self, entries: &[AuditEntry]) -> AppResult<()> {
        self.append_audit_entries(entries).await
    }

    async fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        self.query_audit_entries(query).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.delete_audit_entries_before(cutoff).await
    }

    async fn verify_chain(&self) -> AppResult<ChainVerification> {
        self.verify_audit_chain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::{AuditKind, AuditOutcome};
    use chrono::Duration;

    async fn db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_append_and_query_newest_first() {
        let db = db().await;
        let key_id = Uuid::new_v4();
        let base = Utc::now();
        let entries: Vec<AuditEntry> = (0..5)
            .map(|i| {
                AuditEntry::new(AuditKind::Authorization, "authorize", "fs:read", AuditOutcome::Allowed)
                    .with_key_id(key_id)
                    .at(base + Duration::seconds(i))
            })
            .collect();
        db.append_audit_entries(&entries).await.unwrap();

        let rows = db
            .query_audit_entries(&AuditQuery::default().for_key(key_id))
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert!(rows.iter().all(|r| r.id.is_some()));
    }

    #[tokio::test]
    async fn test_query_filters_by_outcome_and_time_range() {
        let db = db().await;
        let base = Utc::now();
        let allowed = AuditEntry::new(AuditKind::Authorization, "authorize", "fs:read", AuditOutcome::Allowed)
            .at(base);
        let denied = AuditEntry::new(AuditKind::Authorization, "authorize", "fs:write", AuditOutcome::Denied)
            .with_reason("INSUFFICIENT_PERMISSION")
            .with_detail(serde_json::json!({ "rate_limit": 5 }))
            .at(base + Duration::minutes(10));
        db.append_audit_entries(&[allowed, denied]).await.unwrap();

        let denied_rows = db
            .query_audit_entries(&AuditQuery::default().with_outcome(AuditOutcome::Denied))
            .await
            .unwrap();
        assert_eq!(denied_rows.len(), 1);
        assert_eq!(denied_rows[0].reason.as_deref(), Some("INSUFFICIENT_PERMISSION"));
        assert_eq!(denied_rows[0].detail, Some(serde_json::json!({ "rate_limit": 5 })));

        let early = db
            .query_audit_entries(
                &AuditQuery::default().between(None, Some(base + Duration::minutes(1))),
            )
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].outcome, AuditOutcome::Allowed);
    }

    #[tokio::test]
    async fn test_key_prefix_filter_treats_wildcards_literally() {
        let db = db().await;
        let mut entry = AuditEntry::new(AuditKind::Authorization, "authorize", "fs:read", AuditOutcome::Allowed);
        entry.key_prefix = Some("prod_monitor".to_owned());
        db.append_audit_entries(&[entry]).await.unwrap();

        let hit = AuditQuery {
            key_prefix: Some("prod_".to_owned()),
            ..AuditQuery::default()
        };
        assert_eq!(db.query_audit_entries(&hit).await.unwrap().len(), 1);

        let miss = AuditQuery {
            key_prefix: Some("prod%x".to_owned()),
            ..AuditQuery::default()
        };
        assert!(db.query_audit_entries(&miss).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_before_removes_only_older_entries() {
        let db = db().await;
        let now = Utc::now();
        let old = AuditEntry::new(AuditKind::Administrative, "api_key.create", "api_keys", AuditOutcome::Allowed)
            .at(now - Duration::days(100));
        let recent = AuditEntry::new(AuditKind::Administrative, "api_key.create", "api_keys", AuditOutcome::Allowed)
            .at(now);
        db.append_audit_entries(&[old, recent]).await.unwrap();

        let removed = db
            .delete_audit_entries_before(now - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            db.query_audit_entries(&AuditQuery::default()).await.unwrap().len(),
            1
        );
        assert!(db.verify_audit_chain().await.unwrap().is_intact());
    }

    fn admin_entry(action: &str, at: DateTime<Utc>) -> AuditEntry {
        AuditEntry::new(AuditKind::Administrative, action, "api_keys", AuditOutcome::Allowed)
            .with_actor("ops")
            .at(at)
    }

    async fn chained_db(count: i64) -> Database {
        let db = db().await;
        let base = Utc::now();
        let entries: Vec<AuditEntry> = (0..count)
            .map(|i| admin_entry("api_key.create", base + Duration::seconds(i)))
            .collect();
        // Two batches so the head carries across transactions
        let (first, rest) = entries.split_at(entries.len() / 2);
        db.append_audit_entries(first).await.unwrap();
        db.append_audit_entries(rest).await.unwrap();
        db
    }

    async fn execute(db: &Database, statement: &str) {
        sqlx::query(statement).execute(db.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_is_intact_after_appends() {
        let db = db().await;
        let empty = db.verify_audit_chain().await.unwrap();
        assert_eq!(empty, ChainVerification { verified: 0, broken: None });

        let db = chained_db(5).await;
        let verification = db.verify_audit_chain().await.unwrap();
        assert!(verification.is_intact());
        assert_eq!(verification.verified, 5);
    }

    #[tokio::test]
    async fn test_edited_entry_is_detected() {
        let db = chained_db(4).await;
        execute(&db, "UPDATE audit_log SET outcome = 'denied' WHERE id = 3").await;

        let verification = db.verify_audit_chain().await.unwrap();
        assert_eq!(verification.verified, 2);
        assert_eq!(verification.broken, Some(ChainBreak::ContentAltered { entry_id: 3 }));
    }

    #[tokio::test]
    async fn test_null_and_empty_text_hash_differently() {
        let db = chained_db(2).await;
        execute(&db, "UPDATE audit_log SET reason = '' WHERE id = 1").await;

        let verification = db.verify_audit_chain().await.unwrap();
        assert_eq!(verification.broken, Some(ChainBreak::ContentAltered { entry_id: 1 }));
    }

    #[tokio::test]
    async fn test_removed_entries_are_detected() {
        let db = chained_db(4).await;
        execute(&db, "DELETE FROM audit_log WHERE id = 2").await;
        assert_eq!(
            db.verify_audit_chain().await.unwrap().broken,
            Some(ChainBreak::BrokenLink { entry_id: 3 })
        );

        let db = chained_db(4).await;
        execute(&db, "DELETE FROM audit_log WHERE id = 4").await;
        let verification = db.verify_audit_chain().await.unwrap();
        assert_eq!(verification.verified, 3);
        assert_eq!(verification.broken, Some(ChainBreak::HeadMismatch));

        let db = chained_db(4).await;
        execute(&db, "DELETE FROM audit_log WHERE id = 1").await;
        assert_eq!(
            db.verify_audit_chain().await.unwrap().broken,
            Some(ChainBreak::BrokenLink { entry_id: 2 })
        );
    }

    #[tokio::test]
    async fn test_prune_removes_only_the_oldest_run_and_keeps_the_anchor() {
        let db = db().await;
        let now = Utc::now();
        db.append_audit_entries(&[
            admin_entry("api_key.create", now - Duration::days(100)),
            admin_entry("api_key.disable", now),
            // Older than the cutoff but written after a recent entry
            admin_entry("api_key.delete", now - Duration::days(95)),
        ])
        .await
        .unwrap();

        let removed = db
            .delete_audit_entries_before(now - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let verification = db.verify_audit_chain().await.unwrap();
        assert!(verification.is_intact());
        assert_eq!(verification.verified, 2);

        // Appends after a prune keep extending the same chain
        db.append_audit_entries(&[admin_entry("api_key.enable", now)])
            .await
            .unwrap();
        assert_eq!(db.verify_audit_chain().await.unwrap().verified, 3);

        // Pruning everything leaves an empty but consistent chain
        db.delete_audit_entries_before(now + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(
            db.verify_audit_chain().await.unwrap(),
            ChainVerification { verified: 0, broken: None }
        );
    }
}
