//! Revoked token ids.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Tracks revoked token ids (`jti`) until the token would have expired anyway.
#[async_trait::async_trait]
pub trait RevocationList: Send + Sync + 'static {
    /// Revoke `jti` until `until`.
    async fn revoke(&self, jti: &str, until: DateTime<Utc>);

    /// Whether `jti` is currently revoked.
    async fn is_revoked(&self, jti: &str) -> bool;

    /// Drop entries past their expiry. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

/// `DashMap`-backed revocation list.
#[derive(Debug, Default)]
pub struct InMemoryRevocationList {
    entries: DashMap<String, DateTime<Utc>>,
}

impl InMemoryRevocationList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn revoke(&self, jti: &str, until: DateTime<Utc>) {
        self.entries
            .entry(jti.to_string())
            .and_modify(|existing| *existing = (*existing).max(until))
            .or_insert(until);
    }

    async fn is_revoked(&self, jti: &str) -> bool {
        self.entries.get(jti).is_some_and(|until| *until > Utc::now())
    }

    async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now);
        before - self.entries.len()
    }
}
