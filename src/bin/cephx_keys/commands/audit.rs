// ABOUTME: Audit log commands for cephx-keys
// ABOUTME: Handles filtered audit queries, retention pruning and hash chain verification
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use anyhow::{bail, Result};
use cephx_api_auth::{
    admin::ApiKeyAdmin,
    security::{AuditOutcome, AuditQuery},
};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::helpers::display::display_audit_entry;

/// Arguments for `audit-log`
pub struct QueryArgs {
    pub key_prefix: Option<String>,
    pub key_id: Option<Uuid>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub outcome: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Query the audit log, newest first
pub async fn query(admin: &ApiKeyAdmin, args: QueryArgs) -> Result<()> {
    let outcome = args
        .outcome
        .as_deref()
        .map(str::parse::<AuditOutcome>)
        .transpose()?;

    let query = AuditQuery {
        key_id: args.key_id,
        key_prefix: args.key_prefix,
        action: args.action,
        resource: args.resource,
        outcome,
        since: args.since,
        until: args.until,
        limit: args.limit,
    };
    let entries = admin.query_audit(&query).await?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!(
        "\n{:<24} {:<14} {:<12} {:<26} {:<16} {:<8} {}",
        "Timestamp", "Kind", "API Key", "Action", "Resource", "Outcome", "Reason"
    );
    println!("{}", "=".repeat(120));
    for entry in &entries {
        display_audit_entry(entry);
    }
    println!("\nTotal: {} log entry/entries", entries.len());
    Ok(())
}

/// Apply audit retention
pub async fn prune(admin: &ApiKeyAdmin, retention_days: Option<u32>) -> Result<()> {
    let Some(days) = retention_days else {
        warn!("No retention configured");
        bail!("pass --retention-days or set AUDIT_RETENTION_DAYS");
    };

    info!("Pruning audit entries older than {} days", days);
    let removed = admin.prune_audit(days).await?;
    println!("Removed {removed} audit entries older than {days} days.");
    Ok(())
}

/// Verify the audit hash chain; fails when it is broken
pub async fn verify(admin: &ApiKeyAdmin) -> Result<()> {
    let verification = admin.verify_audit_chain().await?;
    match verification.broken {
        None => {
            println!("Audit log intact: {} entries verified.", verification.verified);
            Ok(())
        }
        Some(broken) => bail!(
            "audit log tampering detected: {broken} ({} entries verified before it)",
            verification.verified
        ),
    }
}
