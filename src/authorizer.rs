// ABOUTME: Request authorization: credential lookup, status, scope and rate checks with auditing
// ABOUTME: Produces one Decision and exactly one audit entry for every call
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Authorizer
//!
//! Checks run in a fixed order and stop at the first blocking condition:
//!
//! 1. credential missing or unknown: [`DecisionReason::InvalidCredential`]
//! 2. key disabled: [`DecisionReason::KeyDisabled`]
//! 3. key expired: [`DecisionReason::KeyExpired`]
//! 4. scope not granted: [`DecisionReason::InsufficientPermission`]
//! 5. over the rate limit: [`DecisionReason::RateLimitExceeded`]
//!
//! The rate limiter is consulted last, so denied requests never consume
//! capacity. The route layer maps the reason to a response with
//! [`DecisionReason::http_status`]; nothing here touches HTTP.

use crate::api_keys::ApiKey;
use crate::constants::audit_actions;
use crate::key_store::KeyStore;
use crate::permissions::Scope;
use crate::rate_limiting::{RateLimitStatus, RateLimiter};
use crate::security::audit::{AuditEntry, AuditKind, AuditLog, AuditOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{field, warn, Span};
use uuid::Uuid;

/// Why a request was allowed or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    /// Every check passed
    Allowed,
    /// No credential, or it matches no stored key
    InvalidCredential,
    /// The key exists but is disabled
    KeyDisabled,
    /// The key exists but has expired
    KeyExpired,
    /// The key does not grant the required scope
    InsufficientPermission,
    /// The key used up its requests for the current window
    RateLimitExceeded,
}

impl DecisionReason {
    /// HTTP status the route layer should answer with
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Allowed => 200,
            Self::InvalidCredential | Self::KeyDisabled | Self::KeyExpired => 401,
            Self::InsufficientPermission => 403,
            Self::RateLimitExceeded => 429,
        }
    }

    /// Stable code recorded in the audit log
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::KeyDisabled => "KEY_DISABLED",
            Self::KeyExpired => "KEY_EXPIRED",
            Self::InsufficientPermission => "INSUFFICIENT_PERMISSION",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }

    /// Caller-facing message that does not reveal key details
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Allowed => "Request authorized",
            Self::InvalidCredential => "Missing or invalid API key",
            Self::KeyDisabled => "API key is disabled",
            Self::KeyExpired => "API key has expired",
            Self::InsufficientPermission => "API key lacks the required permission",
            Self::RateLimitExceeded => "Rate limit exceeded",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of one authorization check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// First blocking condition, or `Allowed`
    pub reason: DecisionReason,
    /// Key the credential resolved to, if any
    pub key_id: Option<Uuid>,
    /// Rate window state when the rate check ran
    pub rate_limit: Option<RateLimitStatus>,
}

impl Decision {
    const fn deny(reason: DecisionReason, key_id: Option<Uuid>) -> Self {
        Self {
            allowed: false,
            reason,
            key_id,
            rate_limit: None,
        }
    }

    /// HTTP status for this decision
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.reason.http_status()
    }

    /// Seconds the caller should wait, for rate limited decisions
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.reason == DecisionReason::RateLimitExceeded {
            self.rate_limit.map(|status| status.retry_after_secs(now))
        } else {
            None
        }
    }
}

/// Answers "may this credential perform this scope" for every inbound request
#[derive(Clone, Debug)]
pub struct Authorizer {
    store: Arc<KeyStore>,
    limiter: RateLimiter,
    audit: AuditLog,
}

impl Authorizer {
    /// Build an authorizer over explicit store, limiter and audit handles
    #[must_use]
    pub const fn new(store: Arc<KeyStore>, limiter: RateLimiter, audit: AuditLog) -> Self {
        Self {
            store,
            limiter,
            audit,
        }
    }

    /// Key store backing this authorizer
    #[must_use]
    pub const fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Rate limiter backing this authorizer
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Authorize a request at the current time
    #[must_use]
    pub fn authorize(
        &self,
        credential: Option<&str>,
        required_scope: &str,
        source_address: &str,
    ) -> Decision {
        self.authorize_at(credential, required_scope, source_address, Utc::now())
    }

    /// Authorize a request as of `now`
    ///
    /// Never fails and never blocks on I/O. The audit entry is queued before
    /// returning; if it cannot be queued the failure goes to the fallback log.
    #[tracing::instrument(
        skip(self, credential),
        fields(
            key_id = field::Empty,
            reason = field::Empty,
        )
    )]
    pub fn authorize_at(
        &self,
        credential: Option<&str>,
        required_scope: &str,
        source_address: &str,
        now: DateTime<Utc>,
    ) -> Decision {
        let (decision, key) = self.evaluate(credential, required_scope, now);

        let span = Span::current();
        if let Some(key_id) = decision.key_id {
            span.record("key_id", field::display(key_id));
        }
        span.record("reason", decision.reason.code());

        self.record(&decision, key.as_deref(), required_scope, source_address, now);

        if decision.allowed {
            if let Some(key) = &key {
                self.store.touch(key.id, now);
            }
        }
        decision
    }

    fn evaluate(
        &self,
        credential: Option<&str>,
        required_scope: &str,
        now: DateTime<Utc>,
    ) -> (Decision, Option<Arc<ApiKey>>) {
        let Some(key) = credential.and_then(|secret| self.store.find_by_secret(secret)) else {
            return (Decision::deny(DecisionReason::InvalidCredential, None), None);
        };
        let key_id = Some(key.id);

        if !key.enabled {
            return (Decision::deny(DecisionReason::KeyDisabled, key_id), Some(key));
        }
        if key.is_expired_at(now) {
            return (Decision::deny(DecisionReason::KeyExpired, key_id), Some(key));
        }

        let permitted = Scope::parse_required(required_scope)
            .is_some_and(|scope| key.permissions.allows_scope(&scope));
        if !permitted {
            return (
                Decision::deny(DecisionReason::InsufficientPermission, key_id),
                Some(key),
            );
        }

        let status = self.limiter.check_at(key.id, key.rate_limit, now);
        let decision = if status.allowed {
            Decision {
                allowed: true,
                reason: DecisionReason::Allowed,
                key_id,
                rate_limit: Some(status),
            }
        } else {
            Decision {
                rate_limit: Some(status),
                ..Decision::deny(DecisionReason::RateLimitExceeded, key_id)
            }
        };
        (decision, Some(key))
    }

    fn record(
        &self,
        decision: &Decision,
        key: Option<&ApiKey>,
        required_scope: &str,
        source_address: &str,
        now: DateTime<Utc>,
    ) {
        let outcome = if decision.allowed {
            AuditOutcome::Allowed
        } else {
            AuditOutcome::Denied
        };
        let mut entry = AuditEntry::new(
            AuditKind::Authorization,
            audit_actions::AUTHORIZE,
            required_scope,
            outcome,
        )
        .at(now)
        .with_source_address(source_address);

        if let Some(key) = key {
            entry = entry.with_key(key);
        }
        if !decision.allowed {
            entry = entry.with_reason(decision.reason.code());
        }
        if let (DecisionReason::RateLimitExceeded, Some(status)) =
            (decision.reason, decision.rate_limit)
        {
            entry = entry.with_detail(json!({
                "limit": status.limit,
                "reset_at": status.reset_at,
            }));
        }

        if let Err(e) = self.audit.record(entry) {
            warn!(error = %e, reason = decision.reason.code(), "Authorization decision returned without a persisted audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(DecisionReason::Allowed.http_status(), 200);
        assert_eq!(DecisionReason::InvalidCredential.http_status(), 401);
        assert_eq!(DecisionReason::KeyDisabled.http_status(), 401);
        assert_eq!(DecisionReason::KeyExpired.http_status(), 401);
        assert_eq!(DecisionReason::InsufficientPermission.http_status(), 403);
        assert_eq!(DecisionReason::RateLimitExceeded.http_status(), 429);
    }

    #[test]
    fn test_reason_serializes_as_code() {
        let json = serde_json::to_string(&DecisionReason::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");
        assert_eq!(DecisionReason::KeyExpired.to_string(), "KEY_EXPIRED");
    }

    #[test]
    fn test_retry_after_only_for_rate_limited() {
        let now = Utc::now();
        let denied = Decision::deny(DecisionReason::KeyDisabled, None);
        assert_eq!(denied.retry_after_secs(now), None);
    }
}
