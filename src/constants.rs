// ABOUTME: Crate-wide constants: environment variable names, defaults and the permission catalog
// ABOUTME: Single source of truth for limits, key format and confirmation tokens
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Constants Module
//!
//! Hardcoded values and the names of the environment variables that override
//! them. Parsing of those variables lives in [`crate::config`].

/// Service identity
pub mod service {
    /// Service name used in logs
    pub const SERVICE_NAME: &str = "cephx-api-auth";
    /// Crate version from Cargo.toml
    pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Environment variable names
pub mod env_vars {
    /// Full sqlx connection URL
    pub const DATABASE_URL: &str = "DATABASE_URL";
    /// Filesystem path of the SQLite database, used when `DATABASE_URL` is unset
    pub const DB_PATH: &str = "CEPHX_DB_PATH";
    /// Default per-window request budget for new keys
    pub const DEFAULT_RATE_LIMIT: &str = "DEFAULT_RATE_LIMIT";
    /// Upper bound accepted for a key's rate limit
    pub const MAX_RATE_LIMIT: &str = "MAX_RATE_LIMIT";
    /// Rate window length in seconds
    pub const RATE_LIMIT_WINDOW_SECS: &str = "RATE_LIMIT_WINDOW_SECS";
    /// Number of tracked windows before stale ones are swept
    pub const RATE_LIMIT_CLEANUP_THRESHOLD: &str = "RATE_LIMIT_CLEANUP_THRESHOLD";
    /// Default key lifetime in days when none is given
    pub const API_KEY_TTL_DAYS: &str = "API_KEY_TTL_DAYS";
    /// Audit queue capacity
    pub const AUDIT_BUFFER_SIZE: &str = "AUDIT_BUFFER_SIZE";
    /// Max audit entries written per batch
    pub const AUDIT_BATCH_SIZE: &str = "AUDIT_BATCH_SIZE";
    /// Upper bound on audit query results
    pub const AUDIT_QUERY_MAX_LIMIT: &str = "AUDIT_QUERY_MAX_LIMIT";
    /// Audit retention in days
    pub const AUDIT_RETENTION_DAYS: &str = "AUDIT_RETENTION_DAYS";
    /// Interval between `last_used_at` flushes
    pub const USAGE_FLUSH_INTERVAL_SECS: &str = "USAGE_FLUSH_INTERVAL_SECS";
    /// Interval between key snapshot refreshes from the database
    pub const KEY_REFRESH_INTERVAL_SECS: &str = "KEY_REFRESH_INTERVAL_SECS";
    /// Deployment environment
    pub const ENVIRONMENT: &str = "ENVIRONMENT";
}

/// Default values
pub mod defaults {
    /// Default database location
    pub const DB_PATH: &str = "/var/lib/cephx-api/api.db";
    /// Requests per window for a key created without an explicit limit
    pub const DEFAULT_RATE_LIMIT: u32 = 60;
    /// Largest accepted per-key limit
    pub const MAX_RATE_LIMIT: u32 = 1000;
    /// Window length in seconds
    pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
    /// Windows tracked before a sweep
    pub const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 10_000;
    /// Audit queue capacity
    pub const AUDIT_BUFFER_SIZE: usize = 1024;
    /// Audit batch size
    pub const AUDIT_BATCH_SIZE: usize = 64;
    /// Audit query default limit
    pub const AUDIT_QUERY_DEFAULT_LIMIT: u32 = 100;
    /// Audit query upper bound
    pub const AUDIT_QUERY_MAX_LIMIT: u32 = 1000;
    /// `last_used_at` flush interval
    pub const USAGE_FLUSH_INTERVAL_SECS: u64 = 5;
    /// Interval between key snapshot refreshes from the database
    pub const KEY_REFRESH_INTERVAL_SECS: u64 = 5;
    /// Longest accepted default key lifetime (100 years)
    pub const MAX_KEY_TTL_DAYS: u32 = 36_500;
    /// Longest accepted audit retention (100 years)
    pub const MAX_AUDIT_RETENTION_DAYS: u32 = 36_500;
}

/// API key format
pub mod key_format {
    /// Bytes of OS randomness in every secret
    pub const SECRET_BYTES: usize = 32;
    /// Characters of the plaintext key kept for display
    pub const PREFIX_LEN: usize = 12;
    /// Max characters of the client segment
    pub const CLIENT_SEGMENT_MAX: usize = 10;
    /// Client segment used when the name has no alphanumerics
    pub const CLIENT_SEGMENT_FALLBACK: &str = "client";
    /// Environment segments recognised in key names, in match order
    pub const ENV_SEGMENTS: &[&str] = &["prod", "dev", "test", "admin"];
    /// Environment segment used otherwise
    pub const ENV_SEGMENT_FALLBACK: &str = "api";
    /// Longest accepted key name
    pub const MAX_NAME_LEN: usize = 128;
}

/// Permission catalog
pub mod permissions {
    /// Resources that may appear in a scope
    pub const RESOURCES: &[&str] = &["auth", "fs", "snapshot", "cluster", "osd", "pool"];
    /// Actions that may appear in a scope
    pub const ACTIONS: &[&str] = &["read", "write"];
    /// Superuser scope
    pub const ADMIN_ALL: &str = "admin:*";
    /// Wildcard segment
    pub const WILDCARD: &str = "*";
    /// Separator between resource and action
    pub const SEPARATOR: char = ':';
}

/// Administrative confirmations
pub mod confirmations {
    /// Token required to hard-delete a key
    pub const DELETE: &str = "DELETE";
}

/// Audit hash chain
pub mod audit_chain {
    /// Domain separator hashed ahead of every entry
    pub const DOMAIN: &[u8] = b"cephx-api-auth/audit-entry/v1";
    /// Predecessor hash of the first entry ever written
    pub const GENESIS_HASH: &str =
        "0000000000000000000000000000000000000000000000000000000000000000";
    /// Entries read per page while verifying
    pub const VERIFY_PAGE_SIZE: i64 = 1000;
}

/// Audit action names for administrative operations
pub mod audit_actions {
    /// Authorization decision
    pub const AUTHORIZE: &str = "authorize";
    /// Key issuance
    pub const KEY_CREATE: &str = "api_key.create";
    /// Key listing
    pub const KEY_LIST: &str = "api_key.list";
    /// Key re-enabled
    pub const KEY_ENABLE: &str = "api_key.enable";
    /// Key disabled
    pub const KEY_DISABLE: &str = "api_key.disable";
    /// Key hard-deleted
    pub const KEY_DELETE: &str = "api_key.delete";
    /// Key permissions replaced
    pub const KEY_UPDATE_PERMISSIONS: &str = "api_key.update_permissions";
    /// Key rate limit changed
    pub const KEY_UPDATE_RATE_LIMIT: &str = "api_key.update_rate_limit";
    /// Audit log read
    pub const AUDIT_QUERY: &str = "audit_log.query";
    /// Audit retention applied
    pub const AUDIT_PRUNE: &str = "audit_log.prune";
    /// Audit hash chain checked
    pub const AUDIT_VERIFY: &str = "audit_log.verify";
    /// Resource name for key administration entries
    pub const RESOURCE_API_KEYS: &str = "api_keys";
    /// Resource name for audit administration entries
    pub const RESOURCE_AUDIT_LOG: &str = "audit_log";
}
