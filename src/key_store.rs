// ABOUTME: Durable API key store with a lock-free in-memory snapshot for the request path
// ABOUTME: Serialized admin mutations, constant-time secret lookup and buffered usage timestamps
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Key Store
//!
//! The database is the source of truth. Every mutation takes the writer
//! gate, validates against the current snapshot, persists, and only then
//! publishes a new immutable snapshot. Readers load the snapshot pointer and
//! never wait on writers or on the database, and they see either the old or
//! the new version of a key, never a mix.
//!
//! Changes made by another process (for example the operator CLI while a
//! server is running) become visible after [`KeyStore::reload`], which
//! [`KeyStore::with_refresh`] runs on a fixed interval.
//!
//! `last_used_at` is best effort: [`KeyStore::touch`] records the time in
//! memory and a background task persists pending values periodically.

use crate::api_keys::{ApiKey, ApiKeyManager, CreateApiKeyRequest};
use crate::constants::confirmations;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::permissions::PermissionSet;
use arc_swap::ArcSwap;
use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// How an operator addresses a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// By stable id
    Id(Uuid),
    /// By name: the enabled key with this name, else the most recently created disabled one
    Name(String),
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Name(name) => write!(f, "name '{name}'"),
        }
    }
}

impl From<Uuid> for KeySelector {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

/// Immutable view of every key, oldest first
#[derive(Debug, Default)]
struct KeySnapshot {
    keys: Vec<Arc<ApiKey>>,
}

impl KeySnapshot {
    fn from_keys(keys: Vec<ApiKey>) -> Self {
        Self {
            keys: keys.into_iter().map(Arc::new).collect(),
        }
    }

    fn by_id(&self, id: Uuid) -> Option<&Arc<ApiKey>> {
        self.keys.iter().find(|key| key.id == id)
    }

    fn enabled_by_name(&self, name: &str) -> Option<&Arc<ApiKey>> {
        self.keys.iter().find(|key| key.enabled && key.name == name)
    }

    fn resolve(&self, selector: &KeySelector) -> AppResult<Arc<ApiKey>> {
        let found = match selector {
            KeySelector::Id(id) => self.by_id(*id),
            KeySelector::Name(name) => self.enabled_by_name(name).or_else(|| {
                self.keys
                    .iter()
                    .filter(|key| key.name == *name)
                    .max_by_key(|key| key.created_at)
            }),
        };
        found
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("API key with {selector}")))
    }

    fn with_inserted(&self, key: ApiKey) -> Self {
        let mut keys = self.keys.clone();
        keys.push(Arc::new(key));
        Self { keys }
    }

    fn with_replaced(&self, key: ApiKey) -> Self {
        let id = key.id;
        let replacement = Arc::new(key);
        let keys = self
            .keys
            .iter()
            .map(|existing| {
                if existing.id == id {
                    Arc::clone(&replacement)
                } else {
                    Arc::clone(existing)
                }
            })
            .collect();
        Self { keys }
    }

    fn without(&self, id: Uuid) -> Self {
        Self {
            keys: self.keys.iter().filter(|key| key.id != id).cloned().collect(),
        }
    }
}

/// API key store shared by the authorizer and key administration
pub struct KeyStore {
    database: Database,
    manager: ApiKeyManager,
    snapshot: Arc<ArcSwap<KeySnapshot>>,
    write_gate: Arc<Mutex<()>>,
    last_used: Arc<DashMap<Uuid, DateTime<Utc>>>,
    pending_usage: Arc<DashMap<Uuid, DateTime<Utc>>>,
    background_shutdown: Vec<mpsc::Sender<()>>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("keys", &self.snapshot.load().keys.len())
            .field("pending_usage", &self.pending_usage.len())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Load every key from the database
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be read
    pub async fn open(database: Database, manager: ApiKeyManager) -> AppResult<Self> {
        let keys = database.list_all_api_keys().await?;
        info!(keys = keys.len(), "Key store loaded");

        Ok(Self {
            database,
            manager,
            snapshot: Arc::new(ArcSwap::from_pointee(KeySnapshot::from_keys(keys))),
            write_gate: Arc::new(Mutex::new(())),
            last_used: Arc::new(DashMap::new()),
            pending_usage: Arc::new(DashMap::new()),
            background_shutdown: Vec::new(),
        })
    }

    /// Persist pending `last_used_at` values every `interval` on a background task
    ///
    /// Must be called from within a tokio runtime. The task flushes once more
    /// when the store is dropped.
    #[must_use]
    pub fn with_usage_flush(mut self, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let database = self.database.clone();
        let pending = Arc::clone(&self.pending_usage);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = flush_pending(&database, &pending).await {
                            warn!(error = %e, "Failed to persist API key usage");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        if let Err(e) = flush_pending(&database, &pending).await {
                            warn!(error = %e, "Failed to persist API key usage on shutdown");
                        }
                        debug!("Usage flush task received shutdown signal");
                        break;
                    }
                }
            }
        });

        self.background_shutdown.push(shutdown_tx);
        self
    }

    /// Re-read keys from the database every `interval` on a background task
    ///
    /// Picks up changes made by other processes sharing the database, such as
    /// the operator CLI. Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_refresh(mut self, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let database = self.database.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let gate = Arc::clone(&self.write_gate);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the snapshot is fresh from `open`
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match refresh_snapshot(&database, &snapshot, &gate).await {
                            Ok(true) => debug!(keys = snapshot.load().keys.len(), "Key store refreshed from database"),
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "Failed to refresh API keys"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Key refresh task received shutdown signal");
                        break;
                    }
                }
            }
        });

        self.background_shutdown.push(shutdown_tx);
        self
    }

    /// Issue a new key; the plaintext is returned once and never stored
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if an enabled key has the name, a validation
    /// error for a bad request, or a database error
    pub async fn create(
        &self,
        request: CreateApiKeyRequest,
    ) -> AppResult<(ApiKey, Zeroizing<String>)> {
        let _gate = self.write_gate.lock().await;
        let now = Utc::now().trunc_subsecs(3);
        let (key, plaintext) = self.manager.build_key(request, now)?;

        let current = self.snapshot.load_full();
        if current.enabled_by_name(&key.name).is_some() {
            return Err(AppError::duplicate_name(&key.name));
        }

        self.database.create_api_key(&key).await?;
        self.snapshot.store(Arc::new(current.with_inserted(key.clone())));

        info!(key_id = %key.id, key_prefix = %key.key_prefix, name = %key.name, "API key created");
        Ok((key, plaintext))
    }

    /// Find the key whose hash matches `plaintext`
    ///
    /// Compares against every stored hash in constant time and does not stop
    /// at the first match, so timing does not depend on which key matched.
    #[must_use]
    pub fn find_by_secret(&self, plaintext: &str) -> Option<Arc<ApiKey>> {
        let candidate = ApiKeyManager::hash_key(plaintext);
        let snapshot = self.snapshot.load();

        let mut found: Option<&Arc<ApiKey>> = None;
        for key in &snapshot.keys {
            let matches: bool = key.key_hash.as_bytes().ct_eq(candidate.as_bytes()).into();
            if matches && found.is_none() {
                found = Some(key);
            }
        }
        found.cloned()
    }

    /// Get a key by id, with the latest known `last_used_at`
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ApiKey> {
        self.snapshot
            .load()
            .by_id(id)
            .map(|key| self.with_usage(key))
    }

    /// Resolve a selector to a key
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if no key matches
    pub fn resolve(&self, selector: &KeySelector) -> AppResult<ApiKey> {
        let key = self.snapshot.load().resolve(selector)?;
        Ok(self.with_usage(&key))
    }

    /// List keys oldest first, without secrets
    #[must_use]
    pub fn list(&self, include_disabled: bool) -> Vec<ApiKey> {
        self.snapshot
            .load()
            .keys
            .iter()
            .filter(|key| include_disabled || key.enabled)
            .map(|key| self.with_usage(key))
            .collect()
    }

    /// Enable or disable a key; setting the current state again is a no-op
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound`, `DuplicateName` when enabling would give two
    /// enabled keys the same name, or a database error
    pub async fn set_enabled(&self, selector: &KeySelector, enabled: bool) -> AppResult<ApiKey> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot.load_full();
        let key = current.resolve(selector)?;

        if key.enabled == enabled {
            return Ok(self.with_usage(&key));
        }
        if enabled {
            if let Some(other) = current.enabled_by_name(&key.name) {
                if other.id != key.id {
                    return Err(AppError::duplicate_name(&key.name));
                }
            }
        }

        if !self.database.set_api_key_enabled(key.id, &key.name, enabled).await? {
            return Err(AppError::not_found(format!("API key with {selector}")));
        }

        let updated = ApiKey {
            enabled,
            ..(*key).clone()
        };
        self.snapshot
            .store(Arc::new(current.with_replaced(updated.clone())));

        info!(key_id = %updated.id, enabled, "API key status changed");
        Ok(self.with_usage(&updated))
    }

    /// Replace a key's permissions
    ///
    /// # Errors
    ///
    /// Returns `InvalidPermission`, `ResourceNotFound`, or a database error
    pub async fn update_permissions<I, S>(
        &self,
        selector: &KeySelector,
        permissions: I,
    ) -> AppResult<ApiKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let permissions = PermissionSet::parse(permissions)?;

        let _gate = self.write_gate.lock().await;
        let current = self.snapshot.load_full();
        let key = current.resolve(selector)?;

        if !self
            .database
            .update_api_key_permissions(key.id, &permissions)
            .await?
        {
            return Err(AppError::not_found(format!("API key with {selector}")));
        }

        let updated = ApiKey {
            permissions,
            ..(*key).clone()
        };
        self.snapshot
            .store(Arc::new(current.with_replaced(updated.clone())));

        info!(key_id = %updated.id, permissions = %updated.permissions, "API key permissions updated");
        Ok(self.with_usage(&updated))
    }

    /// Change a key's per-window limit
    ///
    /// # Errors
    ///
    /// Returns `ValueOutOfRange`, `ResourceNotFound`, or a database error
    pub async fn update_rate_limit(
        &self,
        selector: &KeySelector,
        rate_limit: u32,
    ) -> AppResult<ApiKey> {
        let rate_limit = self.manager.validate_rate_limit(rate_limit)?;

        let _gate = self.write_gate.lock().await;
        let current = self.snapshot.load_full();
        let key = current.resolve(selector)?;

        if !self
            .database
            .update_api_key_rate_limit(key.id, rate_limit)
            .await?
        {
            return Err(AppError::not_found(format!("API key with {selector}")));
        }

        let updated = ApiKey {
            rate_limit,
            ..(*key).clone()
        };
        self.snapshot
            .store(Arc::new(current.with_replaced(updated.clone())));

        info!(key_id = %updated.id, rate_limit, "API key rate limit updated");
        Ok(self.with_usage(&updated))
    }

    /// Permanently delete a key; `confirm_token` must be exactly `DELETE`
    ///
    /// # Errors
    ///
    /// Returns `ConfirmationMismatch` (nothing is changed), `ResourceNotFound`,
    /// or a database error
    pub async fn delete(&self, selector: &KeySelector, confirm_token: &str) -> AppResult<ApiKey> {
        if confirm_token != confirmations::DELETE {
            return Err(AppError::confirmation_mismatch(confirmations::DELETE));
        }

        let _gate = self.write_gate.lock().await;
        let current = self.snapshot.load_full();
        let key = current.resolve(selector)?;

        if !self.database.delete_api_key(key.id).await? {
            return Err(AppError::not_found(format!("API key with {selector}")));
        }
        self.snapshot.store(Arc::new(current.without(key.id)));
        let deleted = self.with_usage(&key);
        self.last_used.remove(&key.id);
        self.pending_usage.remove(&key.id);

        warn!(key_id = %key.id, key_prefix = %key.key_prefix, name = %key.name, "API key permanently deleted");
        Ok(deleted)
    }

    /// Record a successful use; never blocks and never fails
    pub fn touch(&self, id: Uuid, at: DateTime<Utc>) {
        self.last_used
            .entry(id)
            .and_modify(|last| *last = (*last).max(at))
            .or_insert(at);
        self.pending_usage
            .entry(id)
            .and_modify(|last| *last = (*last).max(at))
            .or_insert(at);
    }

    /// Persist pending `last_used_at` values now
    ///
    /// # Errors
    ///
    /// Returns a database error; pending values are kept for the next attempt
    pub async fn flush_usage(&self) -> AppResult<u64> {
        flush_pending(&self.database, &self.pending_usage).await
    }

    /// Re-read every key from the database and publish the result
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be read; the current snapshot stays in place
    pub async fn reload(&self) -> AppResult<usize> {
        refresh_snapshot(&self.database, &self.snapshot, &self.write_gate).await?;
        let count = self.len();
        debug!(keys = count, "Key store reloaded");
        Ok(count)
    }

    /// Number of keys, enabled or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().keys.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().keys.is_empty()
    }

    fn with_usage(&self, key: &ApiKey) -> ApiKey {
        let mut key = key.clone();
        if let Some(used) = self.last_used.get(&key.id) {
            key.last_used_at = Some(key.last_used_at.map_or(*used, |stored| stored.max(*used)));
        }
        key
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        for tx in &self.background_shutdown {
            if let Err(e) = tx.try_send(()) {
                debug!(error = ?e, "Background task shutdown signal send failed (task likely stopped)");
            }
        }
    }
}

/// Publish the database's keys if they differ from the current snapshot
///
/// Holds the writer gate so a concurrent local mutation cannot be overwritten
/// by an older read.
async fn refresh_snapshot(
    database: &Database,
    snapshot: &ArcSwap<KeySnapshot>,
    gate: &Mutex<()>,
) -> AppResult<bool> {
    let _gate = gate.lock().await;
    let keys = database.list_all_api_keys().await?;
    let current = snapshot.load();
    let unchanged = current.keys.len() == keys.len()
        && current.keys.iter().zip(&keys).all(|(a, b)| **a == *b);
    if unchanged {
        return Ok(false);
    }
    snapshot.store(Arc::new(KeySnapshot::from_keys(keys)));
    Ok(true)
}

async fn flush_pending(
    database: &Database,
    pending: &DashMap<Uuid, DateTime<Utc>>,
) -> AppResult<u64> {
    let batch: Vec<(Uuid, DateTime<Utc>)> = pending
        .iter()
        .map(|entry| (*entry.key(), *entry.value()))
        .collect();
    if batch.is_empty() {
        return Ok(0);
    }

    let updated = database.record_api_keys_last_used(&batch).await?;
    for (id, at) in &batch {
        // Keep values that were touched again while the write was in flight
        pending.remove_if(id, |_, current| current <= at);
    }
    debug!(keys = batch.len(), updated, "API key usage persisted");
    Ok(updated)
}
