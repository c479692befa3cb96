// ABOUTME: Environment-based configuration for the key store, rate limiter and audit log
// ABOUTME: Type-safe parsing of env vars with defaults and validation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Environment-based configuration management
//!
//! All settings come from environment variables. Unset variables fall back to
//! the defaults in [`crate::constants::defaults`]; set but unparsable values are
//! configuration errors rather than silent fallbacks.

use crate::constants::{defaults, env_vars};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    #[default]
    Development,
    /// Production deployment
    Production,
    /// Automated tests
    Testing,
}

impl Environment {
    /// Parse from string with fallback
    #[must_use]
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "testing" | "test" => Self::Testing,
            _ => Self::Development,
        }
    }

    /// Check if this is a production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

/// Type-safe database location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseUrl {
    /// `SQLite` database file
    SQLite {
        /// File path
        path: PathBuf,
    },
    /// In-memory `SQLite` (tests only, does not survive restarts)
    Memory,
}

impl DatabaseUrl {
    /// Parse a `sqlite:` URL or a bare file path
    #[must_use]
    pub fn parse_url(s: &str) -> Self {
        let path_str = s
            .strip_prefix("sqlite://")
            .or_else(|| s.strip_prefix("sqlite:"))
            .unwrap_or(s);
        if path_str == ":memory:" {
            Self::Memory
        } else {
            Self::SQLite {
                path: PathBuf::from(path_str),
            }
        }
    }

    /// Convert to a sqlx connection string
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        match self {
            Self::SQLite { path } => format!("sqlite:{}", path.display()),
            Self::Memory => "sqlite::memory:".to_owned(),
        }
    }

    /// Check if this is an in-memory database
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

impl Default for DatabaseUrl {
    fn default() -> Self {
        Self::SQLite {
            path: PathBuf::from(defaults::DB_PATH),
        }
    }
}

/// Key issuance and rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Requests per window for keys created without an explicit limit
    pub default_rate_limit: u32,
    /// Largest limit an operator may assign
    pub max_rate_limit: u32,
    /// Fixed window length in seconds
    pub rate_limit_window_secs: u64,
    /// Tracked windows before stale ones are swept
    pub rate_limit_cleanup_threshold: usize,
    /// Lifetime applied to new keys that carry no explicit expiry
    pub default_key_ttl_days: Option<u32>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: defaults::DEFAULT_RATE_LIMIT,
            max_rate_limit: defaults::MAX_RATE_LIMIT,
            rate_limit_window_secs: defaults::RATE_LIMIT_WINDOW_SECS,
            rate_limit_cleanup_threshold: defaults::RATE_LIMIT_CLEANUP_THRESHOLD,
            default_key_ttl_days: None,
        }
    }
}

impl SecurityConfig {
    /// Rate window as a `Duration`
    #[must_use]
    pub const fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// Audit writer and query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Capacity of the queue between callers and the writer task
    pub buffer_size: usize,
    /// Max entries persisted per batch
    pub batch_size: usize,
    /// Upper bound on rows returned by a query
    pub max_query_limit: u32,
    /// Entries older than this are removed by `prune-audit-log`
    pub retention_days: Option<u32>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: defaults::AUDIT_BUFFER_SIZE,
            batch_size: defaults::AUDIT_BATCH_SIZE,
            max_query_limit: defaults::AUDIT_QUERY_MAX_LIMIT,
            retention_days: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Database location
    pub database: DatabaseUrl,
    /// Key and rate limit settings
    pub security: SecurityConfig,
    /// Audit settings
    pub audit: AuditConfig,
    /// Seconds between `last_used_at` flushes
    pub usage_flush_interval_secs: u64,
    /// Seconds between key snapshot refreshes from the database
    pub key_refresh_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            database: DatabaseUrl::default(),
            security: SecurityConfig::default(),
            audit: AuditConfig::default(),
            usage_flush_interval_secs: defaults::USAGE_FLUSH_INTERVAL_SECS,
            key_refresh_interval_secs: defaults::KEY_REFRESH_INTERVAL_SECS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse or
    /// if the resulting configuration fails [`Self::validate`].
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment variables");

        let database = env::var(env_vars::DATABASE_URL)
            .ok()
            .map(|url| DatabaseUrl::parse_url(&url))
            .or_else(|| {
                env::var(env_vars::DB_PATH).ok().map(|path| DatabaseUrl::SQLite {
                    path: PathBuf::from(path),
                })
            })
            .unwrap_or_default();

        let config = Self {
            environment: Environment::from_str_or_default(
                &env::var(env_vars::ENVIRONMENT).unwrap_or_default(),
            ),
            database,
            security: SecurityConfig {
                default_rate_limit: parse_env_or(
                    env_vars::DEFAULT_RATE_LIMIT,
                    defaults::DEFAULT_RATE_LIMIT,
                )?,
                max_rate_limit: parse_env_or(env_vars::MAX_RATE_LIMIT, defaults::MAX_RATE_LIMIT)?,
                rate_limit_window_secs: parse_env_or(
                    env_vars::RATE_LIMIT_WINDOW_SECS,
                    defaults::RATE_LIMIT_WINDOW_SECS,
                )?,
                rate_limit_cleanup_threshold: parse_env_or(
                    env_vars::RATE_LIMIT_CLEANUP_THRESHOLD,
                    defaults::RATE_LIMIT_CLEANUP_THRESHOLD,
                )?,
                default_key_ttl_days: parse_env_opt(env_vars::API_KEY_TTL_DAYS)?,
            },
            audit: AuditConfig {
                buffer_size: parse_env_or(env_vars::AUDIT_BUFFER_SIZE, defaults::AUDIT_BUFFER_SIZE)?,
                batch_size: parse_env_or(env_vars::AUDIT_BATCH_SIZE, defaults::AUDIT_BATCH_SIZE)?,
                max_query_limit: parse_env_or(
                    env_vars::AUDIT_QUERY_MAX_LIMIT,
                    defaults::AUDIT_QUERY_MAX_LIMIT,
                )?,
                retention_days: parse_env_opt(env_vars::AUDIT_RETENTION_DAYS)?,
            },
            usage_flush_interval_secs: parse_env_or(
                env_vars::USAGE_FLUSH_INTERVAL_SECS,
                defaults::USAGE_FLUSH_INTERVAL_SECS,
            )?,
            key_refresh_interval_secs: parse_env_or(
                env_vars::KEY_REFRESH_INTERVAL_SECS,
                defaults::KEY_REFRESH_INTERVAL_SECS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns an error when a limit or size is zero or inconsistent.
    pub fn validate(&self) -> Result<()> {
        let security = &self.security;
        if security.default_rate_limit == 0 || security.max_rate_limit == 0 {
            anyhow::bail!("rate limits must be greater than zero");
        }
        if security.default_rate_limit > security.max_rate_limit {
            anyhow::bail!(
                "{} ({}) exceeds {} ({})",
                env_vars::DEFAULT_RATE_LIMIT,
                security.default_rate_limit,
                env_vars::MAX_RATE_LIMIT,
                security.max_rate_limit
            );
        }
        if security.rate_limit_window_secs == 0 {
            anyhow::bail!("{} must be greater than zero", env_vars::RATE_LIMIT_WINDOW_SECS);
        }
        if self.audit.buffer_size == 0 || self.audit.batch_size == 0 {
            anyhow::bail!("audit buffer and batch sizes must be greater than zero");
        }
        if self.audit.max_query_limit == 0 {
            anyhow::bail!("{} must be greater than zero", env_vars::AUDIT_QUERY_MAX_LIMIT);
        }
        if self.usage_flush_interval_secs == 0 {
            anyhow::bail!("{} must be greater than zero", env_vars::USAGE_FLUSH_INTERVAL_SECS);
        }
        if self.key_refresh_interval_secs == 0 {
            anyhow::bail!("{} must be greater than zero", env_vars::KEY_REFRESH_INTERVAL_SECS);
        }
        check_days(
            env_vars::API_KEY_TTL_DAYS,
            security.default_key_ttl_days,
            defaults::MAX_KEY_TTL_DAYS,
        )?;
        check_days(
            env_vars::AUDIT_RETENTION_DAYS,
            self.audit.retention_days,
            defaults::MAX_AUDIT_RETENTION_DAYS,
        )?;
        Ok(())
    }

    /// Interval between key snapshot refreshes
    #[must_use]
    pub const fn key_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.key_refresh_interval_secs)
    }

    /// Interval between `last_used_at` flushes
    #[must_use]
    pub const fn usage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.usage_flush_interval_secs)
    }

    /// Get a summary of the configuration for logging (no secrets)
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "cephx-api-auth configuration:\n\
             - Environment: {}\n\
             - Database: {}\n\
             - Default rate limit: {}/{}s (max {})\n\
             - Default key TTL: {}\n\
             - Audit buffer: {} (batch {})\n\
             - Audit retention: {}",
            self.environment,
            if self.database.is_memory() {
                "in-memory"
            } else {
                "sqlite file"
            },
            self.security.default_rate_limit,
            self.security.rate_limit_window_secs,
            self.security.max_rate_limit,
            self.security
                .default_key_ttl_days
                .map_or_else(|| "none".to_owned(), |d| format!("{d} days")),
            self.audit.buffer_size,
            self.audit.batch_size,
            self.audit
                .retention_days
                .map_or_else(|| "unlimited".to_owned(), |d| format!("{d} days")),
        )
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_env_opt(key).map(|value| value.unwrap_or(default))
}

fn parse_env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {key} value: {raw}")),
        _ => Ok(None),
    }
}

fn check_days(key: &str, days: Option<u32>, max: u32) -> Result<()> {
    match days {
        Some(days) if days == 0 || days > max => {
            anyhow::bail!("{key} must be between 1 and {max}, got {days}")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_parsing() {
        assert_eq!(DatabaseUrl::parse_url("sqlite::memory:"), DatabaseUrl::Memory);
        assert_eq!(
            DatabaseUrl::parse_url("sqlite:/tmp/api.db"),
            DatabaseUrl::SQLite {
                path: PathBuf::from("/tmp/api.db")
            }
        );
        assert_eq!(
            DatabaseUrl::parse_url("/var/lib/x.db").to_connection_string(),
            "sqlite:/var/lib/x.db"
        );
    }

    #[test]
    fn test_environment_from_str() {
        assert_eq!(Environment::from_str_or_default("prod"), Environment::Production);
        assert_eq!(Environment::from_str_or_default("TEST"), Environment::Testing);
        assert_eq!(Environment::from_str_or_default("bogus"), Environment::Development);
    }

    #[test]
    fn test_validate_rejects_default_above_max() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());
        config.security.default_rate_limit = config.security.max_rate_limit + 1;
        assert!(config.validate().is_err());
    }
}
