// ABOUTME: Unit tests for config environment functionality
// ABOUTME: Validates environment parsing, defaults and rejection of invalid values
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use cephx_api_auth::config::environment::{DatabaseUrl, Environment, ServerConfig};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

const VARS: &[&str] = &[
    "DATABASE_URL",
    "CEPHX_DB_PATH",
    "DEFAULT_RATE_LIMIT",
    "MAX_RATE_LIMIT",
    "RATE_LIMIT_WINDOW_SECS",
    "RATE_LIMIT_CLEANUP_THRESHOLD",
    "API_KEY_TTL_DAYS",
    "AUDIT_BUFFER_SIZE",
    "AUDIT_BATCH_SIZE",
    "AUDIT_QUERY_MAX_LIMIT",
    "AUDIT_RETENTION_DAYS",
    "USAGE_FLUSH_INTERVAL_SECS",
    "KEY_REFRESH_INTERVAL_SECS",
    "ENVIRONMENT",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
fn test_environment_parsing() {
    assert_eq!(
        Environment::from_str_or_default("production"),
        Environment::Production
    );
    assert_eq!(
        Environment::from_str_or_default("PROD"),
        Environment::Production
    );
    assert_eq!(
        Environment::from_str_or_default("test"),
        Environment::Testing
    );
    assert_eq!(
        Environment::from_str_or_default("whatever"),
        Environment::Development
    );
}

#[test]
fn test_database_url_parsing() {
    assert!(DatabaseUrl::parse_url("sqlite::memory:").is_memory());
    assert_eq!(
        DatabaseUrl::parse_url("sqlite:./data/api.db"),
        DatabaseUrl::SQLite {
            path: PathBuf::from("./data/api.db")
        }
    );
    assert_eq!(
        DatabaseUrl::parse_url("sqlite:///var/lib/cephx-api/api.db").to_connection_string(),
        "sqlite:/var/lib/cephx-api/api.db"
    );
}

#[test]
#[serial]
fn test_defaults_when_unset() {
    clear_env();
    let config = ServerConfig::from_env().unwrap();

    assert_eq!(config.security.default_rate_limit, 60);
    assert_eq!(config.security.max_rate_limit, 1000);
    assert_eq!(config.security.rate_limit_window_secs, 60);
    assert_eq!(config.security.default_key_ttl_days, None);
    assert_eq!(config.audit.max_query_limit, 1000);
    assert_eq!(config.audit.retention_days, None);
    assert_eq!(config.usage_flush_interval_secs, 5);
    assert_eq!(config.key_refresh_interval().as_secs(), 5);
    assert_eq!(config.environment, Environment::Development);
    assert_eq!(
        config.database,
        DatabaseUrl::SQLite {
            path: PathBuf::from("/var/lib/cephx-api/api.db")
        }
    );
}

#[test]
#[serial]
fn test_overrides_from_environment() {
    clear_env();
    env::set_var("CEPHX_DB_PATH", "/tmp/cephx/api.db");
    env::set_var("DEFAULT_RATE_LIMIT", "30");
    env::set_var("MAX_RATE_LIMIT", "300");
    env::set_var("RATE_LIMIT_WINDOW_SECS", "10");
    env::set_var("API_KEY_TTL_DAYS", "90");
    env::set_var("AUDIT_RETENTION_DAYS", "365");
    env::set_var("ENVIRONMENT", "production");

    let config = ServerConfig::from_env().unwrap();
    clear_env();

    assert_eq!(
        config.database,
        DatabaseUrl::SQLite {
            path: PathBuf::from("/tmp/cephx/api.db")
        }
    );
    assert_eq!(config.security.default_rate_limit, 30);
    assert_eq!(config.security.max_rate_limit, 300);
    assert_eq!(config.security.rate_limit_window().as_secs(), 10);
    assert_eq!(config.security.default_key_ttl_days, Some(90));
    assert_eq!(config.audit.retention_days, Some(365));
    assert!(config.environment.is_production());
}

#[test]
#[serial]
fn test_database_url_takes_precedence_over_path() {
    clear_env();
    env::set_var("DATABASE_URL", "sqlite::memory:");
    env::set_var("CEPHX_DB_PATH", "/tmp/ignored.db");

    let config = ServerConfig::from_env().unwrap();
    clear_env();

    assert!(config.database.is_memory());
}

#[test]
#[serial]
fn test_invalid_values_are_errors() {
    clear_env();
    env::set_var("DEFAULT_RATE_LIMIT", "sixty");
    assert!(ServerConfig::from_env().is_err());

    clear_env();
    env::set_var("DEFAULT_RATE_LIMIT", "2000");
    assert!(ServerConfig::from_env().is_err(), "default above max must fail");

    clear_env();
    env::set_var("RATE_LIMIT_WINDOW_SECS", "0");
    assert!(ServerConfig::from_env().is_err());

    clear_env();
    env::set_var("KEY_REFRESH_INTERVAL_SECS", "0");
    assert!(ServerConfig::from_env().is_err());

    clear_env();
}

#[test]
#[serial]
fn test_day_counts_are_bounded() {
    for (var, accepted) in [("API_KEY_TTL_DAYS", "36500"), ("AUDIT_RETENTION_DAYS", "36500")] {
        clear_env();
        env::set_var(var, accepted);
        assert!(ServerConfig::from_env().is_ok(), "{var}={accepted}");

        for rejected in ["0", "36501", "4294967295"] {
            clear_env();
            env::set_var(var, rejected);
            let err = ServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains(var), "{var}={rejected}: {err}");
        }
    }
    clear_env();
}
