// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence
// ABOUTME: Output formatting helpers for cephx-keys
// ABOUTME: Provides consistent display functions for keys and audit entries

use cephx_api_auth::{api_keys::ApiKey, security::AuditEntry};
use chrono::{DateTime, Utc};

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(
        || "Never".to_owned(),
        |at| at.format("%Y-%m-%d %H:%M UTC").to_string(),
    )
}

/// Display a newly created key with its one-time plaintext
pub fn display_created_key(key: &ApiKey, plaintext: &str) {
    println!("\nAPI Key Created Successfully!");
    println!("{}", "=".repeat(80));
    println!("{plaintext}");
    println!("{}", "=".repeat(80));

    println!("\nWARNING:");
    println!("• This key is shown ONLY ONCE - it cannot be retrieved again");
    println!("• Store it securely and never commit it to version control");

    println!("\nDETAILS:");
    println!("   ID: {}", key.id);
    println!("   Name: {}", key.name);
    println!("   Prefix: {}", key.key_prefix);
    println!("   Permissions: {}", key.permissions);
    println!("   Rate Limit: {} requests/window", key.rate_limit);
    println!("   Expires: {}", format_time(key.expires_at));
    if let Some(created_by) = &key.created_by {
        println!("   Created By: {created_by}");
    }
}

/// Display one key in a listing
pub fn display_key(key: &ApiKey, now: DateTime<Utc>, detailed: bool) {
    println!("Key ID: {}", key.id);
    println!("   Name: {}", key.name);
    println!("   Status: {}", key.status_at(now).as_str());
    println!("   Permissions: {}", key.permissions);
    println!("   Rate Limit: {}", key.rate_limit);
    println!("   Created: {}", format_time(Some(key.created_at)));
    println!("   Expires: {}", format_time(key.expires_at));
    println!("   Last Used: {}", format_time(key.last_used_at));

    if detailed {
        println!("   Prefix: {}", key.key_prefix);
        if let Some(created_by) = &key.created_by {
            println!("   Created By: {created_by}");
        }
        if let Some(notes) = &key.notes {
            println!("   Notes: {notes}");
        }
    }
}

/// Short form shown after a mutation
pub fn display_key_summary(key: &ApiKey) {
    println!("   ID: {}", key.id);
    println!("   Name: {}", key.name);
    println!("   Enabled: {}", if key.enabled { "yes" } else { "no" });
    println!("   Permissions: {}", key.permissions);
    println!("   Rate Limit: {}", key.rate_limit);
}

/// Display one audit entry as a table row
pub fn display_audit_entry(entry: &AuditEntry) {
    println!(
        "{:<24} {:<14} {:<12} {:<26} {:<16} {:<8} {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        entry.kind.as_str(),
        entry.key_prefix.as_deref().unwrap_or("-"),
        entry.action,
        entry.resource,
        entry.outcome.as_str(),
        entry.reason.as_deref().unwrap_or(""),
    );
    if let Some(actor) = &entry.actor {
        println!("{:<24} actor: {actor}", "");
    }
    if let Some(source) = &entry.source_address {
        println!("{:<24} source: {source}", "");
    }
}
