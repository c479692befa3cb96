// ABOUTME: Audited key administration used by operator tooling
// ABOUTME: Wraps key store mutations and audit queries, recording one administrative entry per call
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Key Administration
//!
//! Every call records exactly one [`AuditKind::Administrative`] entry naming
//! the operator, whether the call succeeded or failed. Failures carry the
//! error code as the entry's reason.

use crate::api_keys::{ApiKey, CreateApiKeyRequest};
use crate::constants::audit_actions;
use crate::constants::defaults::MAX_AUDIT_RETENTION_DAYS;
use crate::errors::{AppError, AppResult};
use crate::key_store::{KeySelector, KeyStore};
use crate::rate_limiting::RateLimiter;
use crate::security::audit::{
    AuditEntry, AuditKind, AuditLog, AuditOutcome, AuditQuery, ChainVerification,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

/// Operator-facing key management with an audit trail
#[derive(Clone, Debug)]
pub struct ApiKeyAdmin {
    store: Arc<KeyStore>,
    limiter: RateLimiter,
    audit: AuditLog,
    actor: String,
}

impl ApiKeyAdmin {
    /// Administer `store` on behalf of `actor`
    #[must_use]
    pub fn new(
        store: Arc<KeyStore>,
        limiter: RateLimiter,
        audit: AuditLog,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            limiter,
            audit,
            actor: actor.into(),
        }
    }

    /// Operator recorded on audit entries
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Issue a key; the plaintext is returned once
    ///
    /// # Errors
    ///
    /// Propagates validation, `DuplicateName` and database errors from the store
    pub async fn create(
        &self,
        mut request: CreateApiKeyRequest,
    ) -> AppResult<(ApiKey, Zeroizing<String>)> {
        if request.created_by.is_none() {
            request.created_by = Some(self.actor.clone());
        }
        let detail = json!({
            "name": request.name,
            "permissions": request.permissions,
            "rate_limit": request.rate_limit,
        });

        let result = self.store.create(request).await;
        self.audit_result(
            audit_actions::KEY_CREATE,
            result.as_ref().ok().map(|(key, _)| key),
            detail,
            result.as_ref().err(),
        );
        result
    }

    /// List keys, oldest first
    #[must_use]
    pub fn list(&self, include_disabled: bool) -> Vec<ApiKey> {
        let keys = self.store.list(include_disabled);
        self.audit_result(
            audit_actions::KEY_LIST,
            None,
            json!({ "include_disabled": include_disabled, "count": keys.len() }),
            None,
        );
        keys
    }

    /// Re-enable a disabled key
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound`, `DuplicateName`, or a database error
    pub async fn enable(&self, selector: &KeySelector) -> AppResult<ApiKey> {
        let result = self.store.set_enabled(selector, true).await;
        self.audit_key_result(audit_actions::KEY_ENABLE, selector, &result, Value::Null);
        result
    }

    /// Disable a key without deleting it
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` or a database error
    pub async fn disable(&self, selector: &KeySelector) -> AppResult<ApiKey> {
        let result = self.store.set_enabled(selector, false).await;
        self.audit_key_result(audit_actions::KEY_DISABLE, selector, &result, Value::Null);
        result
    }

    /// Replace a key's permissions
    ///
    /// # Errors
    ///
    /// Returns `InvalidPermission`, `ResourceNotFound`, or a database error
    pub async fn update_permissions(
        &self,
        selector: &KeySelector,
        permissions: &[String],
    ) -> AppResult<ApiKey> {
        let result = self.store.update_permissions(selector, permissions).await;
        self.audit_key_result(
            audit_actions::KEY_UPDATE_PERMISSIONS,
            selector,
            &result,
            json!({ "permissions": permissions }),
        );
        result
    }

    /// Change a key's per-window limit
    ///
    /// # Errors
    ///
    /// Returns `ValueOutOfRange`, `ResourceNotFound`, or a database error
    pub async fn update_rate_limit(
        &self,
        selector: &KeySelector,
        rate_limit: u32,
    ) -> AppResult<ApiKey> {
        let result = self.store.update_rate_limit(selector, rate_limit).await;
        self.audit_key_result(
            audit_actions::KEY_UPDATE_RATE_LIMIT,
            selector,
            &result,
            json!({ "rate_limit": rate_limit }),
        );
        result
    }

    /// Permanently delete a key; `confirm_token` must be exactly `DELETE`
    ///
    /// # Errors
    ///
    /// Returns `ConfirmationMismatch`, `ResourceNotFound`, or a database error
    pub async fn delete(&self, selector: &KeySelector, confirm_token: &str) -> AppResult<ApiKey> {
        let result = self.store.delete(selector, confirm_token).await;
        if let Ok(key) = &result {
            self.limiter.forget(key.id);
        }
        self.audit_key_result(audit_actions::KEY_DELETE, selector, &result, Value::Null);
        result
    }

    /// Read the audit log, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the audit store cannot be read
    pub async fn query_audit(&self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        let clamped = query.clamped(self.audit.max_query_limit());
        let result = self.audit.query(&clamped).await;

        let detail = json!({
            "key_id": clamped.key_id,
            "outcome": clamped.outcome,
            "since": clamped.since,
            "until": clamped.until,
            "limit": clamped.limit,
            "returned": result.as_ref().map_or(0, Vec::len),
        });
        self.audit_result(
            audit_actions::AUDIT_QUERY,
            None,
            detail,
            result.as_ref().err(),
        );
        result
    }

    /// Remove audit entries older than `retention_days`
    ///
    /// # Errors
    ///
    /// Returns `ValueOutOfRange` for a retention outside `1..=36500` days, or an
    /// error if the delete fails
    pub async fn prune_audit(&self, retention_days: u32) -> AppResult<u64> {
        let cutoff = Some(retention_days)
            .filter(|days| (1..=MAX_AUDIT_RETENTION_DAYS).contains(days))
            .and_then(|days| Duration::try_days(i64::from(days)))
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| {
                AppError::out_of_range(
                    "retention_days",
                    i64::from(retention_days),
                    1,
                    i64::from(MAX_AUDIT_RETENTION_DAYS),
                )
            });
        let result = match cutoff {
            Ok(cutoff) => self.audit.prune_before(cutoff).await,
            Err(e) => Err(e),
        };

        self.audit_result(
            audit_actions::AUDIT_PRUNE,
            None,
            json!({
                "retention_days": retention_days,
                "removed": result.as_ref().ok(),
            }),
            result.as_ref().err(),
        );
        result
    }

    /// Check the audit hash chain
    ///
    /// The entry for this call is recorded after the walk, so it is covered by
    /// the next verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit store cannot be read
    pub async fn verify_audit_chain(&self) -> AppResult<ChainVerification> {
        let result = self.audit.verify_chain().await;
        let detail = match &result {
            Ok(verification) => json!({
                "verified": verification.verified,
                "broken": verification.broken,
            }),
            Err(_) => json!({}),
        };
        self.audit_result(
            audit_actions::AUDIT_VERIFY,
            None,
            detail,
            result.as_ref().err(),
        );
        result
    }

    /// Persist buffered usage timestamps and audit entries
    ///
    /// # Errors
    ///
    /// Returns the first failure; both flushes are attempted
    pub async fn flush(&self) -> AppResult<()> {
        let usage = self.store.flush_usage().await;
        let audit = self.audit.flush().await;
        usage?;
        audit
    }

    fn audit_key_result(
        &self,
        action: &str,
        selector: &KeySelector,
        result: &AppResult<ApiKey>,
        mut detail: Value,
    ) {
        let selector = selector.to_string();
        detail = match detail {
            Value::Object(mut map) => {
                map.insert("selector".to_owned(), Value::String(selector));
                Value::Object(map)
            }
            _ => json!({ "selector": selector }),
        };
        self.audit_result(action, result.as_ref().ok(), detail, result.as_ref().err());
    }

    fn audit_result(
        &self,
        action: &str,
        key: Option<&ApiKey>,
        mut detail: Value,
        error: Option<&AppError>,
    ) {
        let resource = if action.starts_with("audit_log.") {
            audit_actions::RESOURCE_AUDIT_LOG
        } else {
            audit_actions::RESOURCE_API_KEYS
        };
        let outcome = if error.is_some() {
            AuditOutcome::Denied
        } else {
            AuditOutcome::Allowed
        };

        if let (Some(error), Value::Object(map)) = (error, &mut detail) {
            map.insert("error".to_owned(), Value::String(error.message.clone()));
        }

        let mut entry = AuditEntry::new(AuditKind::Administrative, action, resource, outcome)
            .with_actor(self.actor.as_str())
            .with_detail(detail);
        if let Some(key) = key {
            entry = entry.with_key(key);
        }
        if let Some(error) = error {
            entry = entry.with_reason(error.code.as_str());
        }

        if let Err(e) = self.audit.record(entry) {
            warn!(error = %e, action, actor = %self.actor, "Administrative action completed without a persisted audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::ApiKeyManager;
    use crate::config::AuditConfig;
    use crate::database::Database;
    use crate::errors::ErrorCode;

    async fn admin() -> ApiKeyAdmin {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(KeyStore::open(db.clone(), ApiKeyManager::default()).await.unwrap());
        let audit = AuditLog::new(Arc::new(db), &AuditConfig::default());
        ApiKeyAdmin::new(store, RateLimiter::default(), audit, "operator")
    }

    #[tokio::test]
    async fn test_every_call_is_audited_including_failures() {
        let admin = admin().await;
        let (key, _) = admin
            .create(CreateApiKeyRequest::new("Monitoring", ["cluster:read"]))
            .await
            .unwrap();
        assert_eq!(key.created_by.as_deref(), Some("operator"));

        let err = admin
            .delete(&KeySelector::Id(key.id), "delete")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfirmationMismatch);

        admin.flush().await.unwrap();
        let entries = admin.query_audit(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let denied = &entries[0];
        assert_eq!(denied.action, audit_actions::KEY_DELETE);
        assert_eq!(denied.outcome, AuditOutcome::Denied);
        assert_eq!(denied.reason.as_deref(), Some("CONFIRMATION_MISMATCH"));
        assert_eq!(denied.actor.as_deref(), Some("operator"));

        let created = &entries[1];
        assert_eq!(created.action, audit_actions::KEY_CREATE);
        assert_eq!(created.key_id, Some(key.id));
        assert_eq!(created.kind, AuditKind::Administrative);
    }

    #[tokio::test]
    async fn test_prune_rejects_zero_retention() {
        let admin = admin().await;
        let err = admin.prune_audit(0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValueOutOfRange);
        assert_eq!(admin.prune_audit(30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_rejects_unrepresentable_retention() {
        let admin = admin().await;
        for days in [MAX_AUDIT_RETENTION_DAYS + 1, u32::MAX] {
            let err = admin.prune_audit(days).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::ValueOutOfRange);
        }
        assert_eq!(admin.prune_audit(MAX_AUDIT_RETENTION_DAYS).await.unwrap(), 0);

        admin.flush().await.unwrap();
        let prunes = admin
            .query_audit(&AuditQuery {
                action: Some(audit_actions::AUDIT_PRUNE.to_owned()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(prunes.len(), 3);
        assert_eq!(
            prunes
                .iter()
                .filter(|entry| entry.outcome == AuditOutcome::Denied)
                .count(),
            2
        );
    }
}
