//! Pending challenge storage.
//!
//! Each wallet has at most one outstanding challenge. A record is written by
//! `generateAuthMessage`, read by `verifySignatureAndLogin`, and consumed on
//! success so a signed challenge cannot be replayed.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use superpool_auth::timestamp::EpochMillis;

/// Default lifetime of a challenge.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10 * 60);

/// Outstanding challenge for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    /// Challenge nonce.
    pub nonce: String,
    /// Challenge issue time.
    pub timestamp: EpochMillis,
    /// Time after which the challenge is rejected.
    pub expires_at: EpochMillis,
}

impl NonceRecord {
    /// A record issued at `timestamp` living for `ttl`.
    #[must_use]
    pub fn new(nonce: impl Into<String>, timestamp: EpochMillis, ttl: Duration) -> Self {
        Self {
            nonce: nonce.into(),
            timestamp,
            expires_at: timestamp + ttl,
        }
    }

    /// Whether the record is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: EpochMillis) -> bool {
        now > self.expires_at
    }
}

/// Storage for pending challenges, keyed by wallet address.
///
/// Keys are compared case-insensitively.
pub trait NonceStore: Send + Sync {
    /// Stores `record` for `address`, replacing any previous challenge.
    fn put(&self, address: &str, record: NonceRecord) -> impl Future<Output = ()> + Send;

    /// Pending challenge for `address`.
    fn get(&self, address: &str) -> impl Future<Output = Option<NonceRecord>> + Send;

    /// Removes the challenge for `address` if its nonce is `nonce`.
    ///
    /// Returns whether a record was removed. Two concurrent callers with the
    /// same nonce cannot both observe `true`.
    fn consume(&self, address: &str, nonce: &str) -> impl Future<Output = bool> + Send;

    /// Drops the challenge for `address`.
    fn remove(&self, address: &str) -> impl Future<Output = ()> + Send;

    /// Drops every record expired at `now`, returning how many were removed.
    fn purge_expired(&self, now: EpochMillis) -> impl Future<Output = usize> + Send;
}

/// Process-local [`NonceStore`].
#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    records: DashMap<String, NonceRecord>,
}

impl InMemoryNonceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending challenges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no challenge is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn key(address: &str) -> String {
    address.to_ascii_lowercase()
}

impl NonceStore for InMemoryNonceStore {
    async fn put(&self, address: &str, record: NonceRecord) {
        self.records.insert(key(address), record);
    }

    async fn get(&self, address: &str) -> Option<NonceRecord> {
        self.records.get(&key(address)).map(|r| r.value().clone())
    }

    async fn consume(&self, address: &str, nonce: &str) -> bool {
        self.records
            .remove_if(&key(address), |_, record| record.nonce == nonce)
            .is_some()
    }

    async fn remove(&self, address: &str) {
        self.records.remove(&key(address));
    }

    async fn purge_expired(&self, now: EpochMillis) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }
}
