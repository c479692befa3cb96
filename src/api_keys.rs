// ABOUTME: API key model, secret generation and hashing for the key store
// ABOUTME: Validates issuance requests and produces hashed records plus a show-once plaintext
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # API Key Management
//!
//! Keys look like `<env>_<client>_<64 hex chars>`. The `env` and `client`
//! segments are derived from the key name for operator convenience and carry
//! no security meaning; the 256-bit random tail does. Only the SHA-256 digest
//! of the full key is stored.

use crate::config::SecurityConfig;
use crate::constants::defaults::MAX_KEY_TTL_DAYS;
use crate::constants::key_format::{
    CLIENT_SEGMENT_FALLBACK, CLIENT_SEGMENT_MAX, ENV_SEGMENTS, ENV_SEGMENT_FALLBACK, MAX_NAME_LEN,
    PREFIX_LEN, SECRET_BYTES,
};
use crate::errors::{AppError, AppResult};
use crate::permissions::PermissionSet;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// A stored API key record (never contains the plaintext secret)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKey {
    /// Stable identifier
    pub id: Uuid,
    /// Operator-facing label, unique among enabled keys
    pub name: String,
    /// Leading characters of the plaintext key, for display and audit correlation
    pub key_prefix: String,
    /// SHA-256 hex digest of the plaintext key
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Granted scopes
    pub permissions: PermissionSet,
    /// Requests admitted per rate window
    pub rate_limit: u32,
    /// Disabled keys fail every authorization check
    pub enabled: bool,
    /// Absent means the key never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Issuance time
    pub created_at: DateTime<Utc>,
    /// Last successful authorization (best effort)
    pub last_used_at: Option<DateTime<Utc>>,
    /// Operator who issued the key
    pub created_by: Option<String>,
    /// Free-form operator notes
    pub notes: Option<String>,
}

impl ApiKey {
    /// Whether the key has expired at `now` (expiry instant itself counts as expired)
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Display status for listings
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> KeyStatus {
        if !self.enabled {
            KeyStatus::Disabled
        } else if self.is_expired_at(now) {
            KeyStatus::Expired
        } else {
            KeyStatus::Active
        }
    }
}

/// Derived lifecycle status of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Enabled and not expired
    Active,
    /// Enabled but past its expiry
    Expired,
    /// Disabled by an operator
    Disabled,
}

impl KeyStatus {
    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
        }
    }
}

/// Expiry requested at issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Apply the configured default TTL, if any
    #[default]
    Default,
    /// Never expires, even when a default TTL is configured
    Never,
    /// Expires at the given instant
    At(DateTime<Utc>),
}

/// Key issuance request
#[derive(Debug, Clone, Default)]
pub struct CreateApiKeyRequest {
    /// Key name
    pub name: String,
    /// Requested scopes, validated against the catalog
    pub permissions: Vec<String>,
    /// Requests per window, `None` for the configured default
    pub rate_limit: Option<u32>,
    /// Expiry policy
    pub expiry: Expiry,
    /// Operator issuing the key
    pub created_by: Option<String>,
    /// Notes
    pub notes: Option<String>,
}

impl CreateApiKeyRequest {
    /// Request with a name and scopes, everything else defaulted
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the per-window limit
    #[must_use]
    pub const fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Set the expiry policy
    #[must_use]
    pub const fn with_expiry(mut self, expiry: Expiry) -> Self {
        self.expiry = expiry;
        self
    }

    /// Record the issuing operator
    #[must_use]
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Attach notes
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Freshly generated key material
pub struct GeneratedKey {
    /// Full plaintext key, shown once
    pub full_key: Zeroizing<String>,
    /// Display prefix
    pub key_prefix: String,
    /// SHA-256 hex digest
    pub key_hash: String,
}

/// Builds key records from issuance requests
#[derive(Debug, Clone)]
pub struct ApiKeyManager {
    default_rate_limit: u32,
    max_rate_limit: u32,
    default_ttl_days: Option<u32>,
}

impl Default for ApiKeyManager {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

impl ApiKeyManager {
    /// Create a manager from security settings
    #[must_use]
    pub const fn new(config: &SecurityConfig) -> Self {
        Self {
            default_rate_limit: config.default_rate_limit,
            max_rate_limit: config.max_rate_limit,
            default_ttl_days: config.default_key_ttl_days,
        }
    }

    /// Largest accepted rate limit
    #[must_use]
    pub const fn max_rate_limit(&self) -> u32 {
        self.max_rate_limit
    }

    /// Generate a new key for `name` from OS randomness
    #[must_use]
    pub fn generate_api_key(name: &str) -> GeneratedKey {
        let mut random_bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut random_bytes);
        let mut random_hex = hex::encode(random_bytes);
        random_bytes.zeroize();

        let full_key = Zeroizing::new(format!(
            "{}_{}_{random_hex}",
            env_segment(name),
            client_segment(name)
        ));
        random_hex.zeroize();

        GeneratedKey {
            key_prefix: Self::extract_key_prefix(&full_key),
            key_hash: Self::hash_key(&full_key),
            full_key,
        }
    }

    /// Extract the display prefix from a full key
    #[must_use]
    pub fn extract_key_prefix(api_key: &str) -> String {
        api_key.chars().take(PREFIX_LEN).collect()
    }

    /// Hash an API key for storage and comparison
    #[must_use]
    pub fn hash_key(api_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Validate a request and produce the record plus its plaintext key
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a bad name or an expiry not in the future,
    /// `InvalidPermission` for an unknown scope, and `ValueOutOfRange` for a
    /// rate limit outside `1..=max_rate_limit`.
    pub fn build_key(
        &self,
        request: CreateApiKeyRequest,
        now: DateTime<Utc>,
    ) -> AppResult<(ApiKey, Zeroizing<String>)> {
        let name = validate_name(&request.name)?;
        let permissions = PermissionSet::parse(&request.permissions)?;
        let rate_limit = self.validate_rate_limit(request.rate_limit.unwrap_or(self.default_rate_limit))?;

        let expires_at = match request.expiry {
            Expiry::Never => None,
            Expiry::Default => match self.default_ttl_days {
                Some(days) => Some(expiry_after(now, days)?),
                None => None,
            },
            Expiry::At(at) => {
                if at <= now {
                    return Err(AppError::invalid_input("expiry must be in the future"));
                }
                Some(at.trunc_subsecs(3))
            }
        };

        let generated = Self::generate_api_key(&name);
        let key = ApiKey {
            id: Uuid::new_v4(),
            name,
            key_prefix: generated.key_prefix,
            key_hash: generated.key_hash,
            permissions,
            rate_limit,
            enabled: true,
            expires_at,
            created_at: now,
            last_used_at: None,
            created_by: normalize_optional(request.created_by),
            notes: normalize_optional(request.notes),
        };
        Ok((key, generated.full_key))
    }

    /// Check a rate limit against the configured bounds
    ///
    /// # Errors
    ///
    /// Returns `ValueOutOfRange` outside `1..=max_rate_limit`
    pub fn validate_rate_limit(&self, rate_limit: u32) -> AppResult<u32> {
        if rate_limit == 0 || rate_limit > self.max_rate_limit {
            return Err(AppError::out_of_range(
                "rate_limit",
                i64::from(rate_limit),
                1,
                i64::from(self.max_rate_limit),
            ));
        }
        Ok(rate_limit)
    }
}

fn validate_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::invalid_input("API key name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::invalid_input(format!(
            "API key name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(AppError::invalid_input(
            "API key name cannot contain control characters",
        ));
    }
    Ok(name.to_owned())
}

/// Expiry `days` after `now`, to millisecond precision
fn expiry_after(now: DateTime<Utc>, days: u32) -> AppResult<DateTime<Utc>> {
    Duration::try_days(i64::from(days))
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map(|at| at.trunc_subsecs(3))
        .ok_or_else(|| {
            AppError::out_of_range(
                "default_key_ttl_days",
                i64::from(days),
                1,
                i64::from(MAX_KEY_TTL_DAYS),
            )
        })
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn env_segment(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    ENV_SEGMENTS
        .iter()
        .find(|segment| lower.contains(**segment))
        .copied()
        .unwrap_or(ENV_SEGMENT_FALLBACK)
}

fn client_segment(name: &str) -> String {
    let client: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(CLIENT_SEGMENT_MAX)
        .collect();
    if client.is_empty() {
        CLIENT_SEGMENT_FALLBACK.to_owned()
    } else {
        client
    }
}
