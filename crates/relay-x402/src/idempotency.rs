//! Exactly-once processing of client requests.
//!
//! Keyed by the client's `Idempotency-Key` header or, when absent, a key
//! derived from the route and canonical request body, so byte-identical
//! retries are deduplicated even for clients that never send a key.
//!
//! Two-tier storage: a durable [`Store`] primary with an in-memory
//! secondary. When the durable tier is unavailable the guard degrades to
//! the local cache rather than re-running the handler.

use std::future::Future;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::X402Error;
use crate::store::{IdempotencyEntry, Store};

/// Retention window for stored responses (24 hours).
pub const IDEMPOTENCY_RETENTION_SECS: u64 = 24 * 60 * 60;

pub struct IdempotencyGuard {
    store: Option<std::sync::Arc<dyn Store>>,
    local: DashMap<String, IdempotencyEntry>,
    retention_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(store: Option<std::sync::Arc<dyn Store>>) -> Self {
        Self {
            store,
            local: DashMap::new(),
            retention_secs: IDEMPOTENCY_RETENTION_SECS,
        }
    }

    /// Stable key for keyless clients: sha256 over route and body.
    pub fn derive_key(route: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(route.as_bytes());
        hasher.update(b"|");
        hasher.update(body);
        alloy::hex::encode(hasher.finalize())
    }

    /// Fingerprint of the request body, stored alongside the key.
    pub fn fingerprint(body: &[u8]) -> String {
        alloy::hex::encode(Sha256::digest(body))
    }

    /// Run `handler` at most once for this key.
    ///
    /// A fresh entry with a matching fingerprint short-circuits to the
    /// stored response, byte for byte, embedded timestamps included. The
    /// same key with a different fingerprint is a client error
    /// ([`X402Error::IdempotencyKeyConflict`]); the handler does not run.
    /// Expired entries are treated as absent at lookup, and writes purge
    /// opportunistically.
    pub async fn guard<F, Fut>(
        &self,
        key: Option<&str>,
        route: &str,
        body: &[u8],
        handler: F,
    ) -> Result<String, X402Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, X402Error>>,
    {
        let key = match key {
            Some(k) => k.to_string(),
            None => Self::derive_key(route, body),
        };
        let fingerprint = Self::fingerprint(body);

        if let Some(entry) = self.lookup(&key) {
            if entry.request_hash == fingerprint {
                tracing::debug!(key = %key, "idempotent replay, serving stored response");
                return Ok(entry.response);
            }
            // Derived keys hash the body, so a mismatch can only happen
            // with a client-supplied key reused across payloads.
            return Err(X402Error::IdempotencyKeyConflict(key));
        }

        let response = handler().await?;

        let entry = IdempotencyEntry {
            key: key.clone(),
            request_hash: fingerprint,
            response: response.clone(),
            created_at: Utc::now(),
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.put_idempotency(&entry) {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "durable idempotency write failed, keeping local copy only"
                );
            }
            if let Err(e) = store.purge_expired_idempotency(self.retention_secs) {
                tracing::debug!(error = %e, "idempotency purge failed");
            }
        }
        self.local.insert(key, entry);
        self.purge_local();

        Ok(response)
    }

    /// Fresh entry for `key`, preferring the durable tier.
    fn lookup(&self, key: &str) -> Option<IdempotencyEntry> {
        if let Some(store) = &self.store {
            match store.get_idempotency(key) {
                Ok(Some(entry)) if self.fresh(&entry) => return Some(entry),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "durable idempotency lookup failed, falling back to local cache"
                    );
                }
            }
        }
        self.local
            .get(key)
            .map(|e| e.clone())
            .filter(|e| self.fresh(e))
    }

    fn fresh(&self, entry: &IdempotencyEntry) -> bool {
        (Utc::now() - entry.created_at).num_seconds() < self.retention_secs as i64
    }

    fn purge_local(&self) {
        let retention = self.retention_secs as i64;
        let now = Utc::now();
        self.local
            .retain(|_, e| (now - e.created_at).num_seconds() < retention);
    }
}
