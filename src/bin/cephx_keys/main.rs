// ABOUTME: cephx-keys - operator command-line tool for API key administration
// ABOUTME: Manages keys and reads, prunes or verifies the audit log
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence
//!
//! Usage:
//! ```bash
//! # Initialize the database
//! cephx-keys init-db
//!
//! # Create a read-only monitoring key
//! cephx-keys create-api-key --name Monitoring --permissions cluster:read,osd:read
//!
//! # Create a temporary admin key
//! cephx-keys create-api-key --name "Admin Temporary" --permissions 'admin:*' \
//!     --expires 2026-12-31T00:00:00Z
//!
//! # List keys, including disabled ones
//! cephx-keys list-api-keys --show-disabled
//!
//! # Disable, re-enable, or permanently delete a key
//! cephx-keys disable-api-key --name Monitoring
//! cephx-keys enable-api-key --name Monitoring
//! cephx-keys delete-api-key --name Monitoring --confirm DELETE
//!
//! # Show denied requests from the last day
//! cephx-keys audit-log --outcome denied --since 2026-10-17T00:00:00Z
//!
//! # Check that no audit entry was edited or removed
//! cephx-keys verify-audit-log
//! ```

mod commands;
mod helpers;

use anyhow::{Context, Result};
use cephx_api_auth::{
    admin::ApiKeyAdmin,
    api_keys::ApiKeyManager,
    config::environment::{DatabaseUrl, ServerConfig},
    database::Database,
    key_store::{KeySelector, KeyStore},
    logging::LoggingConfig,
    rate_limiting::RateLimiter,
    security::AuditLog,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::env;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "cephx-keys",
    about = "Ceph management API key administration",
    long_about = "Command-line tool for managing API keys and reading the audit log of the Ceph management API."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database URL override (sqlite:<path> or sqlite::memory:)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Operator name recorded in the audit log (defaults to $USER)
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

/// Select a key by id or by name
#[derive(Args)]
#[group(required = true, multiple = false)]
struct KeyTarget {
    /// API key ID
    #[arg(long)]
    id: Option<Uuid>,

    /// API key name
    #[arg(long)]
    name: Option<String>,
}

impl KeyTarget {
    fn into_selector(self) -> Result<KeySelector> {
        match (self.id, self.name) {
            (Some(id), _) => Ok(KeySelector::Id(id)),
            (None, Some(name)) => Ok(KeySelector::Name(name)),
            (None, None) => anyhow::bail!("either --id or --name is required"),
        }
    }
}

#[non_exhaustive]
#[derive(Subcommand)]
enum Command {
    /// Initialize the database
    InitDb,

    /// Create a new API key
    CreateApiKey {
        /// Name/description for the key
        #[arg(long)]
        name: String,

        /// Comma-separated list of permissions (e.g. cluster:read,fs:*)
        #[arg(long, value_delimiter = ',', required = true)]
        permissions: Vec<String>,

        /// Requests per rate window (defaults to DEFAULT_RATE_LIMIT)
        #[arg(long)]
        rate_limit: Option<u32>,

        /// Expiration time in RFC 3339 format
        #[arg(long, conflicts_with = "never_expires")]
        expires: Option<DateTime<Utc>>,

        /// Never expire, even when API_KEY_TTL_DAYS is set
        #[arg(long)]
        never_expires: bool,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// List API keys
    ListApiKeys {
        /// Include disabled keys
        #[arg(long)]
        show_disabled: bool,

        /// Show detailed information
        #[arg(long, short = 'd')]
        detailed: bool,
    },

    /// Enable a disabled API key
    EnableApiKey {
        #[command(flatten)]
        target: KeyTarget,
    },

    /// Disable an API key (reversible)
    DisableApiKey {
        #[command(flatten)]
        target: KeyTarget,
    },

    /// Replace the permissions of an API key
    UpdatePermissions {
        #[command(flatten)]
        target: KeyTarget,

        /// Comma-separated list of permissions
        #[arg(long, value_delimiter = ',', required = true)]
        permissions: Vec<String>,
    },

    /// Change the rate limit of an API key
    UpdateRateLimit {
        #[command(flatten)]
        target: KeyTarget,

        /// Requests per rate window
        #[arg(long)]
        rate_limit: u32,
    },

    /// Permanently delete an API key
    DeleteApiKey {
        #[command(flatten)]
        target: KeyTarget,

        /// Must be exactly "DELETE" to confirm
        #[arg(long)]
        confirm: String,
    },

    /// List grantable permissions
    ListPermissions,

    /// Query the audit log
    AuditLog {
        /// Filter by API key prefix
        #[arg(long)]
        api_key: Option<String>,

        /// Filter by API key ID
        #[arg(long)]
        key_id: Option<Uuid>,

        /// Filter by action (authorize, api_key.create, ...)
        #[arg(long)]
        action: Option<String>,

        /// Filter by scope or resource
        #[arg(long)]
        resource: Option<String>,

        /// Filter by outcome (allowed or denied)
        #[arg(long)]
        outcome: Option<String>,

        /// Show entries at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Show entries before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Max entries to show
        #[arg(long, default_value = "100")]
        limit: u32,
    },

    /// Delete audit entries older than the retention period
    PruneAuditLog {
        /// Retention in days (defaults to AUDIT_RETENTION_DAYS)
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Check the audit log hash chain for edited or removed entries
    VerifyAuditLog,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    LoggingConfig::for_cli(cli.verbose).init()?;

    let mut config = ServerConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = &cli.database_url {
        config.database = DatabaseUrl::parse_url(url);
    }
    config.validate()?;
    debug!("{}", config.summary());

    info!(database = %config.database.to_connection_string(), "Connecting to database");
    let database = Database::new(&config.database).await?;

    if matches!(cli.command, Command::InitDb) {
        println!("Database initialized at {}", config.database.to_connection_string());
        database.close().await;
        return Ok(());
    }

    let actor = cli
        .actor
        .or_else(|| env::var("USER").ok())
        .unwrap_or_else(|| "cephx-keys".to_owned());

    let store = KeyStore::open(database.clone(), ApiKeyManager::new(&config.security)).await?;
    let audit = AuditLog::new(Arc::new(database.clone()), &config.audit);
    let admin = ApiKeyAdmin::new(
        Arc::new(store),
        RateLimiter::new(&config.security),
        audit,
        actor,
    );

    let outcome = run(&admin, &config, cli.command).await;

    // Persist the audit trail of this invocation even when the command failed
    admin.flush().await?;
    drop(admin);
    database.close().await;

    outcome
}

async fn run(admin: &ApiKeyAdmin, config: &ServerConfig, command: Command) -> Result<()> {
    match command {
        Command::InitDb => Ok(()),
        Command::CreateApiKey {
            name,
            permissions,
            rate_limit,
            expires,
            never_expires,
            notes,
        } => {
            commands::keys::create(
                admin,
                commands::keys::CreateArgs {
                    name,
                    permissions,
                    rate_limit,
                    expires,
                    never_expires,
                    notes,
                },
            )
            .await
        }
        Command::ListApiKeys {
            show_disabled,
            detailed,
        } => {
            commands::keys::list(admin, show_disabled, detailed);
            Ok(())
        }
        Command::EnableApiKey { target } => {
            commands::keys::set_enabled(admin, &target.into_selector()?, true).await
        }
        Command::DisableApiKey { target } => {
            commands::keys::set_enabled(admin, &target.into_selector()?, false).await
        }
        Command::UpdatePermissions {
            target,
            permissions,
        } => {
            commands::keys::update_permissions(admin, &target.into_selector()?, &permissions).await
        }
        Command::UpdateRateLimit { target, rate_limit } => {
            commands::keys::update_rate_limit(admin, &target.into_selector()?, rate_limit).await
        }
        Command::DeleteApiKey { target, confirm } => {
            commands::keys::delete(admin, &target.into_selector()?, &confirm).await
        }
        Command::ListPermissions => {
            commands::keys::list_permissions();
            Ok(())
        }
        Command::AuditLog {
            api_key,
            key_id,
            action,
            resource,
            outcome,
            since,
            until,
            limit,
        } => {
            commands::audit::query(
                admin,
                commands::audit::QueryArgs {
                    key_prefix: api_key,
                    key_id,
                    action,
                    resource,
                    outcome,
                    since,
                    until,
                    limit,
                },
            )
            .await
        }
        Command::PruneAuditLog { retention_days } => {
            commands::audit::prune(admin, retention_days.or(config.audit.retention_days)).await
        }
        Command::VerifyAuditLog => commands::audit::verify(admin).await,
    }
}
