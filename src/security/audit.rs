// ABOUTME: Append-only audit trail for authorization decisions and key administration
// ABOUTME: Non-blocking buffered writer with a tracing fallback channel when persistence fails
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Security Audit Module
//!
//! Every authorization decision and every administrative action produces one
//! [`AuditEntry`]. Entries are handed to [`AuditLog::record`], which never
//! blocks: it enqueues onto a bounded channel drained by a single background
//! writer that appends to an [`AuditSink`] in batches.
//!
//! When an entry cannot be persisted (queue full, writer gone, sink error) it
//! is emitted as JSON on the `audit_fallback` tracing target and counted in
//! [`AuditStats`]. Failures are never silent, and a caller that needs to
//! know synchronously gets `AuditWriteFailed` from `record`.
//!
//! Persisted entries form a hash chain: each stores the SHA-256 of its
//! predecessor's hash and its own fields. [`AuditLog::verify_chain`] reports
//! the first entry that was edited, inserted or removed out of order.

use crate::api_keys::ApiKey;
use crate::config::AuditConfig;
use crate::constants::defaults::AUDIT_QUERY_DEFAULT_LIMIT;
use crate::errors::{AppError, AppResult};
use crate::logging::AUDIT_FALLBACK_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What produced the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// A call to the authorizer
    Authorization,
    /// An operator action on keys or the audit log
    Administrative,
}

impl AuditKind {
    /// Stored form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authorization => "authorization",
            Self::Administrative => "administrative",
        }
    }
}

impl FromStr for AuditKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization" => Ok(Self::Authorization),
            "administrative" => Ok(Self::Administrative),
            other => Err(AppError::invalid_input(format!("unknown audit kind '{other}'"))),
        }
    }
}

/// Result of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Access granted or operation succeeded
    Allowed,
    /// Access denied or operation rejected
    Denied,
}

impl AuditOutcome {
    /// Stored form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allowed" | "allow" | "success" => Ok(Self::Allowed),
            "denied" | "deny" | "failure" => Ok(Self::Denied),
            other => Err(AppError::invalid_input(format!(
                "unknown audit outcome '{other}' (expected allowed or denied)"
            ))),
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Store-assigned sequence number, `None` until persisted
    pub id: Option<i64>,
    /// When the decision or action happened
    pub timestamp: DateTime<Utc>,
    /// Authorization or administrative
    pub kind: AuditKind,
    /// Key involved, `None` when the caller was unauthenticated
    pub key_id: Option<Uuid>,
    /// Display prefix of the key involved
    pub key_prefix: Option<String>,
    /// Operator performing an administrative action
    pub actor: Option<String>,
    /// Action name (`authorize`, `api_key.create`, ...)
    pub action: String,
    /// Scope or resource acted on
    pub resource: String,
    /// Allowed or denied
    pub outcome: AuditOutcome,
    /// Stable reason code, set on denial
    pub reason: Option<String>,
    /// Caller address as reported by the transport
    pub source_address: Option<String>,
    /// Structured context
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Create an entry timestamped now
    #[must_use]
    pub fn new(
        kind: AuditKind,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            kind,
            key_id: None,
            key_prefix: None,
            actor: None,
            action: action.into(),
            resource: resource.into(),
            outcome,
            reason: None,
            source_address: None,
            detail: None,
        }
    }

    /// Override the timestamp
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attribute the entry to a key
    #[must_use]
    pub fn with_key(mut self, key: &ApiKey) -> Self {
        self.key_id = Some(key.id);
        self.key_prefix = Some(key.key_prefix.clone());
        self
    }

    /// Attribute the entry to a key by id only
    #[must_use]
    pub const fn with_key_id(mut self, key_id: Uuid) -> Self {
        self.key_id = Some(key_id);
        self
    }

    /// Set the acting operator
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the denial reason code
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the caller address
    #[must_use]
    pub fn with_source_address(mut self, source_address: impl Into<String>) -> Self {
        self.source_address = Some(source_address.into());
        self
    }

    /// Attach structured detail
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Filters for reading the audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    /// Exact key id
    pub key_id: Option<Uuid>,
    /// Key prefix (matches entries whose prefix starts with this)
    pub key_prefix: Option<String>,
    /// Exact action name
    pub action: Option<String>,
    /// Exact resource or scope
    pub resource: Option<String>,
    /// Outcome
    pub outcome: Option<AuditOutcome>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    /// Max rows, clamped to the configured maximum
    pub limit: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            key_id: None,
            key_prefix: None,
            action: None,
            resource: None,
            outcome: None,
            since: None,
            until: None,
            limit: AUDIT_QUERY_DEFAULT_LIMIT,
        }
    }
}

impl AuditQuery {
    /// Only entries for this key
    #[must_use]
    pub const fn for_key(mut self, key_id: Uuid) -> Self {
        self.key_id = Some(key_id);
        self
    }

    /// Only entries with this outcome
    #[must_use]
    pub const fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Only entries in `[since, until)`
    #[must_use]
    pub const fn between(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Set the row limit
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Copy with the limit clamped to `1..=max`
    #[must_use]
    pub fn clamped(&self, max: u32) -> Self {
        Self {
            limit: self.limit.clamp(1, max.max(1)),
            ..self.clone()
        }
    }
}

/// Durable storage for audit entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append entries in order; all or nothing
    async fn append(&self, entries: &[AuditEntry]) -> AppResult<()>;

    /// Read entries matching `query`, newest first
    async fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>>;

    /// Remove entries older than `cutoff`; returns how many were removed
    ///
    /// Only a prefix of the log may go, so the remaining entries stay chained
    /// to a recorded anchor.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Recompute the hash chain over every stored entry
    async fn verify_chain(&self) -> AppResult<ChainVerification>;
}

/// Where the audit hash chain stopped matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    /// The entry does not point at the entry before it, so something in
    /// between was removed, inserted or rewritten
    BrokenLink {
        /// Stored id of the entry
        entry_id: i64,
    },
    /// The entry's fields no longer produce its recorded hash
    ContentAltered {
        /// Stored id of the entry
        entry_id: i64,
    },
    /// The newest entries are missing
    HeadMismatch,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenLink { entry_id } => write!(f, "chain link broken at entry {entry_id}"),
            Self::ContentAltered { entry_id } => write!(f, "entry {entry_id} was altered"),
            Self::HeadMismatch => write!(f, "newest entries are missing"),
        }
    }
}

/// Result of [`AuditLog::verify_chain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    /// Entries checked before the first break, or all of them
    pub verified: u64,
    /// First break found
    pub broken: Option<ChainBreak>,
}

impl ChainVerification {
    /// Whether every stored entry checked out
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        self.broken.is_none()
    }
}

/// Snapshot of writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Entries accepted onto the queue
    pub recorded: u64,
    /// Entries persisted by the sink
    pub written: u64,
    /// Entries rejected because the queue was full or closed
    pub dropped: u64,
    /// Entries the sink failed to persist
    pub failed: u64,
}

#[derive(Default)]
struct AuditCounters {
    recorded: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl AuditCounters {
    fn snapshot(&self) -> AuditStats {
        AuditStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum WriterMessage {
    Entry(Box<AuditEntry>),
    Flush(oneshot::Sender<()>),
}

struct AuditLogInner {
    tx: mpsc::Sender<WriterMessage>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<AuditCounters>,
    max_query_limit: u32,
}

/// Cloneable handle to the audit writer
///
/// The background writer exits after draining once every handle is dropped.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditLogInner>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("stats", &self.stats())
            .field("max_query_limit", &self.inner.max_query_limit)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Start the background writer over `sink`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let counters = Arc::new(AuditCounters::default());

        tokio::spawn(run_writer(
            rx,
            Arc::clone(&sink),
            Arc::clone(&counters),
            config.batch_size.max(1),
        ));

        Self {
            inner: Arc::new(AuditLogInner {
                tx,
                sink,
                counters,
                max_query_limit: config.max_query_limit,
            }),
        }
    }

    /// Enqueue an entry without blocking
    ///
    /// # Errors
    ///
    /// Returns `AuditWriteFailed` if the queue is full or the writer has
    /// stopped. The entry has then already been reported on the fallback channel.
    pub fn record(&self, entry: AuditEntry) -> AppResult<()> {
        log_entry(&entry);

        match self.inner.tx.try_send(WriterMessage::Entry(Box::new(entry))) {
            Ok(()) => {
                self.inner.counters.recorded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                let reason = match &err {
                    TrySendError::Full(_) => "audit queue full",
                    TrySendError::Closed(_) => "audit writer stopped",
                };
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if let WriterMessage::Entry(entry) = err.into_inner() {
                    report_fallback(&entry, reason);
                }
                Err(AppError::audit_write_failed(reason))
            }
        }
    }

    /// Wait until every entry recorded before this call has been handed to the sink
    ///
    /// # Errors
    ///
    /// Returns `AuditWriteFailed` if the writer has stopped
    pub async fn flush(&self) -> AppResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .tx
            .send(WriterMessage::Flush(done_tx))
            .await
            .map_err(|_| AppError::audit_write_failed("audit writer stopped"))?;
        done_rx
            .await
            .map_err(|_| AppError::audit_write_failed("audit writer stopped before flushing"))
    }

    /// Read entries, newest first, with the limit clamped
    ///
    /// # Errors
    ///
    /// Returns an error if the sink query fails
    pub async fn query(&self, query: &AuditQuery) -> AppResult<Vec<AuditEntry>> {
        self.inner
            .sink
            .query(&query.clamped(self.inner.max_query_limit))
            .await
    }

    /// Apply retention: remove entries older than `cutoff`
    ///
    /// # Errors
    ///
    /// Returns an error if the sink delete fails
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let removed = self.inner.sink.prune_before(cutoff).await?;
        info!(cutoff = %cutoff, removed, "Audit log pruned");
        Ok(removed)
    }

    /// Check that no persisted entry was altered or removed outside retention
    ///
    /// Entries still queued are not covered until they are written.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be read
    pub async fn verify_chain(&self) -> AppResult<ChainVerification> {
        let verification = self.inner.sink.verify_chain().await?;
        match verification.broken {
            None => debug!(verified = verification.verified, "Audit chain intact"),
            Some(broken) => error!(
                verified = verification.verified,
                broken = %broken,
                "Audit chain verification failed"
            ),
        }
        Ok(verification)
    }

    /// Upper bound applied to query limits
    #[must_use]
    pub fn max_query_limit(&self) -> u32 {
        self.inner.max_query_limit
    }

    /// Current writer counters
    #[must_use]
    pub fn stats(&self) -> AuditStats {
        self.inner.counters.snapshot()
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<WriterMessage>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<AuditCounters>,
    batch_size: usize,
) {
    let mut batch: Vec<AuditEntry> = Vec::with_capacity(batch_size);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    while let Some(message) = rx.recv().await {
        let mut next = Some(message);
        while let Some(message) = next.take() {
            match message {
                WriterMessage::Entry(entry) => batch.push(*entry),
                WriterMessage::Flush(done) => {
                    waiters.push(done);
                    break;
                }
            }
            if batch.len() >= batch_size {
                break;
            }
            next = rx.try_recv().ok();
        }

        write_batch(sink.as_ref(), &counters, &mut batch).await;
        for done in waiters.drain(..) {
            // Receiver may have given up waiting
            let _ = done.send(());
        }
    }

    write_batch(sink.as_ref(), &counters, &mut batch).await;
    debug!("Audit writer stopped");
}

async fn write_batch(sink: &dyn AuditSink, counters: &AuditCounters, batch: &mut Vec<AuditEntry>) {
    if batch.is_empty() {
        return;
    }
    match sink.append(batch).await {
        Ok(()) => {
            counters
                .written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            counters
                .failed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            let reason = format!("audit sink error: {e}");
            for entry in batch.iter() {
                report_fallback(entry, &reason);
            }
        }
    }
    batch.clear();
}

fn log_entry(entry: &AuditEntry) {
    match entry.outcome {
        AuditOutcome::Allowed => debug!(
            kind = entry.kind.as_str(),
            key_id = ?entry.key_id,
            actor = ?entry.actor,
            action = %entry.action,
            resource = %entry.resource,
            source = ?entry.source_address,
            "Security audit event: allowed"
        ),
        AuditOutcome::Denied => warn!(
            kind = entry.kind.as_str(),
            key_id = ?entry.key_id,
            key_prefix = ?entry.key_prefix,
            actor = ?entry.actor,
            action = %entry.action,
            resource = %entry.resource,
            reason = ?entry.reason,
            source = ?entry.source_address,
            "Security audit event: denied"
        ),
    }
}

fn report_fallback(entry: &AuditEntry, reason: &str) {
    match serde_json::to_string(entry) {
        Ok(json) => error!(
            target: AUDIT_FALLBACK_TARGET,
            reason,
            entry = %json,
            "Audit entry not persisted"
        ),
        Err(e) => error!(
            target: AUDIT_FALLBACK_TARGET,
            reason,
            action = %entry.action,
            resource = %entry.resource,
            outcome = entry.outcome.as_str(),
            serialization_error = %e,
            "Audit entry not persisted"
        ),
    }
}
