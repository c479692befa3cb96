// ABOUTME: Main library entry point for the Ceph management API authentication core
// ABOUTME: API key issuance, scope checks, per-key rate limiting and audit logging
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

// Crate-level attributes:
// - deny(unsafe_code): Zero-tolerance unsafe policy
#![deny(unsafe_code)]

//! # Cephx API Auth
//!
//! The authentication and authorization layer in front of a Ceph management
//! HTTP API. Route handlers call [`authorizer::Authorizer::authorize`] with the
//! presented credential and the scope the route requires, and get back a
//! [`authorizer::Decision`]. Operators manage keys through
//! [`admin::ApiKeyAdmin`] and the `cephx-keys` binary.
//!
//! ## Architecture
//!
//! - **Key store**: hashed keys in `SQLite`, served from an in-memory snapshot
//! - **Permissions**: `resource:action` scopes with wildcards and `admin:*`
//! - **Rate limiting**: fixed-window counters per key, per process
//! - **Audit**: append-only log of every decision and administrative action
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cephx_api_auth::api_keys::ApiKeyManager;
//! use cephx_api_auth::authorizer::Authorizer;
//! use cephx_api_auth::config::environment::ServerConfig;
//! use cephx_api_auth::database::Database;
//! use cephx_api_auth::key_store::KeyStore;
//! use cephx_api_auth::rate_limiting::RateLimiter;
//! use cephx_api_auth::security::AuditLog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     let database = Database::new(&config.database).await?;
//!
//!     let store = KeyStore::open(database.clone(), ApiKeyManager::new(&config.security))
//!         .await?
//!         .with_usage_flush(config.usage_flush_interval())
//!         .with_refresh(config.key_refresh_interval());
//!     let audit = AuditLog::new(Arc::new(database), &config.audit);
//!     let authorizer = Authorizer::new(
//!         Arc::new(store),
//!         RateLimiter::new(&config.security),
//!         audit,
//!     );
//!
//!     let decision = authorizer.authorize(Some("prod_monitoring_..."), "cluster:read", "10.0.0.7");
//!     println!("{} -> HTTP {}", decision.reason, decision.http_status());
//!     Ok(())
//! }
//! ```

// ── Public API ──────────────────────────────────────────────────────────
// These modules are used by binary crates (src/bin/) and integration tests (tests/).

/// Audited key administration for operator tooling
pub mod admin;

/// `API` key model, generation and hashing
pub mod api_keys;

/// Request authorization and decision reasons
pub mod authorizer;

/// Environment-based configuration
pub mod config;

/// Application constants and configuration defaults
pub mod constants;

/// `SQLite` persistence for keys and the audit log
pub mod database;

/// Unified error handling system with standard error codes
pub mod errors;

/// In-memory key snapshot over the database
pub mod key_store;

/// Production logging and structured output
pub mod logging;

/// Scope parsing and matching
pub mod permissions;

/// Fixed-window per-key rate limiting
pub mod rate_limiting;

/// Security audit trail
pub mod security;
