// ABOUTME: API key management commands for cephx-keys
// ABOUTME: Handles create, list, enable, disable, permission and rate limit updates, and delete
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use anyhow::Result;
use cephx_api_auth::{
    admin::ApiKeyAdmin,
    api_keys::{CreateApiKeyRequest, Expiry},
    constants::confirmations,
    errors::ErrorCode,
    key_store::KeySelector,
    permissions,
};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::helpers::display::{display_created_key, display_key, display_key_summary};

/// Arguments for `create-api-key`
pub struct CreateArgs {
    pub name: String,
    pub permissions: Vec<String>,
    pub rate_limit: Option<u32>,
    pub expires: Option<DateTime<Utc>>,
    pub never_expires: bool,
    pub notes: Option<String>,
}

/// Create a new API key and print it once
pub async fn create(admin: &ApiKeyAdmin, args: CreateArgs) -> Result<()> {
    info!("Creating API key: {}", args.name);

    let expiry = match (args.expires, args.never_expires) {
        (Some(at), _) => Expiry::At(at),
        (None, true) => Expiry::Never,
        (None, false) => Expiry::Default,
    };
    let mut request = CreateApiKeyRequest::new(args.name, args.permissions).with_expiry(expiry);
    if let Some(rate_limit) = args.rate_limit {
        request = request.with_rate_limit(rate_limit);
    }
    if let Some(notes) = args.notes {
        request = request.with_notes(notes);
    }

    match admin.create(request).await {
        Ok((key, plaintext)) => {
            display_created_key(&key, &plaintext);
            Ok(())
        }
        Err(e) => {
            if e.code == ErrorCode::InvalidPermission {
                print_valid_permissions();
            }
            Err(e.into())
        }
    }
}

/// List keys
pub fn list(admin: &ApiKeyAdmin, show_disabled: bool, detailed: bool) {
    let keys = admin.list(show_disabled);

    if keys.is_empty() {
        println!("No API keys found.");
        println!("Create your first key with: cephx-keys create-api-key --name <name> --permissions <scopes>");
        return;
    }

    let now = Utc::now();
    println!("\nAPI Keys:");
    println!("{}", "=".repeat(80));
    for key in &keys {
        display_key(key, now, detailed);
        println!("{}", "-".repeat(80));
    }
    println!("Total: {} API key(s)", keys.len());
}

/// Enable or disable a key
pub async fn set_enabled(admin: &ApiKeyAdmin, selector: &KeySelector, enabled: bool) -> Result<()> {
    let key = if enabled {
        admin.enable(selector).await?
    } else {
        admin.disable(selector).await?
    };

    println!(
        "API key {selector} {} successfully.",
        if enabled { "enabled" } else { "disabled" }
    );
    display_key_summary(&key);
    Ok(())
}

/// Replace a key's permissions
pub async fn update_permissions(
    admin: &ApiKeyAdmin,
    selector: &KeySelector,
    permissions: &[String],
) -> Result<()> {
    match admin.update_permissions(selector, permissions).await {
        Ok(key) => {
            println!("API key {selector} permissions updated.");
            display_key_summary(&key);
            Ok(())
        }
        Err(e) => {
            if e.code == ErrorCode::InvalidPermission {
                print_valid_permissions();
            }
            Err(e.into())
        }
    }
}

/// Change a key's rate limit
pub async fn update_rate_limit(
    admin: &ApiKeyAdmin,
    selector: &KeySelector,
    rate_limit: u32,
) -> Result<()> {
    let key = admin.update_rate_limit(selector, rate_limit).await?;
    println!("API key {selector} rate limit updated.");
    display_key_summary(&key);
    Ok(())
}

/// Permanently delete a key
pub async fn delete(admin: &ApiKeyAdmin, selector: &KeySelector, confirm: &str) -> Result<()> {
    if confirm != confirmations::DELETE {
        error!("You must pass --confirm {} to delete an API key", confirmations::DELETE);
    }

    let key = admin.delete(selector, confirm).await?;
    println!("API key {selector} ('{}') deleted permanently.", key.name);
    println!("   Prefix: {}", key.key_prefix);
    println!("   To block a key temporarily, use disable-api-key instead.");
    Ok(())
}

/// Print the grantable permissions
pub fn list_permissions() {
    println!("Grantable permissions:");
    for permission in permissions::catalog() {
        println!("   - {permission}");
    }
}

fn print_valid_permissions() {
    eprintln!("Valid permissions are:");
    for permission in permissions::catalog() {
        eprintln!("   - {permission}");
    }
}
