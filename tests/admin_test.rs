// ABOUTME: Integration tests for audited key administration
// ABOUTME: Covers name selection, disable versus delete, confirmation, uniqueness and audit queries
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use cephx_api_auth::{
    api_keys::CreateApiKeyRequest,
    authorizer::DecisionReason,
    constants::audit_actions,
    errors::ErrorCode,
    key_store::KeySelector,
    security::{AuditKind, AuditOutcome, AuditQuery, ChainBreak},
};
use chrono::Utc;
use common::{create_test_harness, window_aligned_now};

#[tokio::test]
async fn test_disable_is_reversible_and_delete_is_not() {
    let h = create_test_harness().await.unwrap();
    let (_, secret) = h
        .admin
        .create(CreateApiKeyRequest::new("Monitoring", ["cluster:read"]))
        .await
        .unwrap();
    let by_name = KeySelector::Name("Monitoring".to_owned());

    h.admin.disable(&by_name).await.unwrap();
    assert_eq!(
        h.authorizer.authorize(Some(secret.as_str()), "cluster:read", "10.1.1.1").reason,
        DecisionReason::KeyDisabled
    );

    h.admin.enable(&by_name).await.unwrap();
    assert!(h
        .authorizer
        .authorize(Some(secret.as_str()), "cluster:read", "10.1.1.1")
        .allowed);

    let err = h.admin.delete(&by_name, "yes").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfirmationMismatch);
    assert!(h
        .authorizer
        .authorize(Some(secret.as_str()), "cluster:read", "10.1.1.1")
        .allowed);

    h.admin.delete(&by_name, "DELETE").await.unwrap();
    assert_eq!(
        h.authorizer.authorize(Some(secret.as_str()), "cluster:read", "10.1.1.1").reason,
        DecisionReason::InvalidCredential
    );
    assert_eq!(
        h.admin.enable(&by_name).await.unwrap_err().code,
        ErrorCode::ResourceNotFound
    );
}

#[tokio::test]
async fn test_name_reusable_after_disable_but_not_while_active() {
    let h = create_test_harness().await.unwrap();
    let (first, _) = h
        .admin
        .create(CreateApiKeyRequest::new("CI", ["fs:read"]))
        .await
        .unwrap();

    let err = h
        .admin
        .create(CreateApiKeyRequest::new("CI", ["fs:read"]))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateName);
    assert_eq!(err.http_status(), 409);

    h.admin.disable(&KeySelector::Id(first.id)).await.unwrap();
    let (second, _) = h
        .admin
        .create(CreateApiKeyRequest::new("CI", ["fs:*"]))
        .await
        .unwrap();

    let all = h.admin.list(true);
    assert_eq!(all.len(), 2);
    let active = h.admin.list(false);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, second.id);
}

#[tokio::test]
async fn test_delete_forgets_rate_window() {
    let h = create_test_harness().await.unwrap();
    let (key, secret) = h
        .admin
        .create(CreateApiKeyRequest::new("burst", ["fs:read"]).with_rate_limit(1))
        .await
        .unwrap();
    let now = window_aligned_now();
    assert!(h.authorizer.authorize_at(Some(secret.as_str()), "fs:read", "h", now).allowed);
    assert_eq!(h.limiter.tracked_keys(), 1);

    h.admin
        .delete(&KeySelector::Id(key.id), "DELETE")
        .await
        .unwrap();
    assert_eq!(h.limiter.tracked_keys(), 0);
}

#[tokio::test]
async fn test_invalid_updates_are_rejected_and_audited() {
    let h = create_test_harness().await.unwrap();
    let (key, _) = h
        .admin
        .create(CreateApiKeyRequest::new("ops", ["fs:read"]))
        .await
        .unwrap();
    let selector = KeySelector::Id(key.id);

    let err = h
        .admin
        .update_permissions(&selector, &["fs:destroy".to_owned()])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidPermission);

    let err = h.admin.update_rate_limit(&selector, 0).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ValueOutOfRange);

    let updated = h.admin.update_rate_limit(&selector, 500).await.unwrap();
    assert_eq!(updated.rate_limit, 500);

    let allowed = h
        .audit_entries(
            &AuditQuery::default()
                .for_key(key.id)
                .with_outcome(AuditOutcome::Allowed),
        )
        .await
        .unwrap();
    // create and the successful rate limit change
    assert_eq!(allowed.len(), 2);

    let failures = h
        .audit_entries(&AuditQuery::default().with_outcome(AuditOutcome::Denied))
        .await
        .unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| e.kind == AuditKind::Administrative));
    assert!(failures
        .iter()
        .all(|e| e.actor.as_deref() == Some("test-operator")));
}

#[tokio::test]
async fn test_audit_query_filters_and_is_itself_audited() {
    let h = create_test_harness().await.unwrap();
    let (key, secret) = h
        .admin
        .create(CreateApiKeyRequest::new("viewer", ["snapshot:read"]))
        .await
        .unwrap();
    for _ in 0..3 {
        let _ = h.authorizer.authorize(Some(secret.as_str()), "snapshot:read", "192.0.2.1");
    }
    let _ = h.authorizer.authorize(Some(secret.as_str()), "snapshot:write", "192.0.2.1");
    h.admin.flush().await.unwrap();

    let since = Utc::now() - chrono::Duration::minutes(5);
    let query = AuditQuery {
        action: Some(audit_actions::AUTHORIZE.to_owned()),
        ..AuditQuery::default().for_key(key.id).between(Some(since), None)
    };
    let entries = h.admin.query_audit(&query).await.unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].resource, "snapshot:write");
    assert_eq!(entries[0].reason.as_deref(), Some("INSUFFICIENT_PERMISSION"));

    let limited = h
        .admin
        .query_audit(&AuditQuery::default().with_limit(2))
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    h.admin.flush().await.unwrap();
    let queries = h
        .admin
        .query_audit(&AuditQuery {
            action: Some(audit_actions::AUDIT_QUERY.to_owned()),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(queries.len(), 2);
}

#[tokio::test]
async fn test_audit_chain_verification_detects_edits() {
    let h = create_test_harness().await.unwrap();
    let (key, secret) = h
        .admin
        .create(CreateApiKeyRequest::new("Monitoring", ["cluster:read"]))
        .await
        .unwrap();
    assert!(h
        .authorizer
        .authorize(Some(secret.as_str()), "cluster:read", "10.1.1.1")
        .allowed);
    assert_eq!(
        h.authorizer
            .authorize(Some(secret.as_str()), "fs:write", "10.1.1.1")
            .reason,
        DecisionReason::InsufficientPermission
    );
    h.admin.disable(&KeySelector::Id(key.id)).await.unwrap();
    h.admin.flush().await.unwrap();

    let verification = h.admin.verify_audit_chain().await.unwrap();
    assert!(verification.is_intact());
    assert_eq!(verification.verified, 4);

    // Rewrite the denied decision as allowed
    sqlx::query("UPDATE audit_log SET outcome = 'allowed' WHERE outcome = 'denied'")
        .execute(h.database.pool())
        .await
        .unwrap();
    h.admin.flush().await.unwrap();

    let verification = h.admin.verify_audit_chain().await.unwrap();
    assert_eq!(verification.verified, 2);
    assert!(matches!(
        verification.broken,
        Some(ChainBreak::ContentAltered { .. })
    ));

    // Both verifications are themselves audited
    let verifications = h
        .audit_entries(&AuditQuery {
            action: Some(audit_actions::AUDIT_VERIFY.to_owned()),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(verifications.len(), 2);
    assert!(verifications
        .iter()
        .all(|entry| entry.kind == AuditKind::Administrative));
}
