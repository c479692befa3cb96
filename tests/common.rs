// ABOUTME: Shared test utilities and setup functions for integration tests
// ABOUTME: Provides quiet logging, in-memory databases and a wired authorizer harness
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence
#![allow(
    dead_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]
//! Shared test utilities for `cephx_api_auth`
//!
//! This module provides common test setup functions to reduce duplication
//! across integration tests.

use anyhow::Result;
use cephx_api_auth::{
    admin::ApiKeyAdmin,
    api_keys::{ApiKey, ApiKeyManager, CreateApiKeyRequest},
    authorizer::Authorizer,
    config::{AuditConfig, SecurityConfig},
    database::Database,
    key_store::KeyStore,
    rate_limiting::RateLimiter,
    security::{AuditEntry, AuditLog, AuditQuery},
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Once};

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        // Check for TEST_LOG environment variable to control test logging level
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            Ok("WARN" | "ERROR") | _ => tracing::Level::WARN, // Default to WARN for quiet tests
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Standard in-memory test database
pub async fn create_test_database() -> Result<Database> {
    init_test_logging();
    Ok(Database::connect("sqlite::memory:").await?)
}

/// A window-aligned instant so rate tests never straddle a boundary
pub fn window_aligned_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_040, 0).unwrap_or_default()
}

/// Everything an authorization test needs, wired over one database
pub struct TestHarness {
    pub database: Database,
    pub store: Arc<KeyStore>,
    pub limiter: RateLimiter,
    pub audit: AuditLog,
    pub authorizer: Authorizer,
    pub admin: ApiKeyAdmin,
}

impl TestHarness {
    /// Issue a key through the store and return it with its plaintext
    pub async fn create_key(&self, request: CreateApiKeyRequest) -> Result<(ApiKey, String)> {
        let (key, plaintext) = self.store.create(request).await?;
        Ok((key, (*plaintext).clone()))
    }

    /// Flush queued audit entries and read them back
    pub async fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.audit.flush().await?;
        Ok(self.audit.query(query).await?)
    }
}

/// Harness with default security settings
pub async fn create_test_harness() -> Result<TestHarness> {
    create_test_harness_with(&SecurityConfig::default()).await
}

/// Harness with custom security settings
pub async fn create_test_harness_with(security: &SecurityConfig) -> Result<TestHarness> {
    let database = create_test_database().await?;
    build_harness(database, security).await
}

/// Harness over an existing database (used for restart tests)
pub async fn build_harness(database: Database, security: &SecurityConfig) -> Result<TestHarness> {
    let store = Arc::new(KeyStore::open(database.clone(), ApiKeyManager::new(security)).await?);
    let limiter = RateLimiter::new(security);
    let audit = AuditLog::new(Arc::new(database.clone()), &AuditConfig::default());
    let authorizer = Authorizer::new(Arc::clone(&store), limiter.clone(), audit.clone());
    let admin = ApiKeyAdmin::new(Arc::clone(&store), limiter.clone(), audit.clone(), "test-operator");

    Ok(TestHarness {
        database,
        store,
        limiter,
        audit,
        authorizer,
        admin,
    })
}
