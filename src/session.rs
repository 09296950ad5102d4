//! Session store: opaque handles standing in for a verified credential.
//!
//! The [`SessionStore`] trait abstracts over storage backends. The in-memory
//! implementation keeps two `DashMap` indices:
//!
//! - `sessions`:     session id → [`Session`]  (O(1) validation)
//! - `by_principal`: principal  → live ids     (bulk revocation)
//!
//! # Revocation ordering
//!
//! Every `create` and `revoke_all` draws a ticket from one sequence when it
//! starts. `revoke_all` records its ticket on the principal's entry and
//! deletes the entry's sessions while holding that entry. `create` inserts
//! while holding the same entry and refuses if a revocation with a later
//! ticket has been recorded. A session whose creation began before the
//! revocation was requested therefore never survives it, and sessions
//! created afterwards are unaffected.
//!
//! The reaper drops principal entries that hold no sessions. An entry whose
//! revocation ticket is newer than a creation still in flight is kept until
//! that creation has finished.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::credential::CredentialKind;
use crate::identity::{PrincipalId, StoreError};
use crate::token::Claims;

/// Prefix of every session id.
pub const SESSION_PREFIX: &str = "vgs_";

/// The subset of the creating credential's claims kept with a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsSnapshot {
    /// Kind of the credential that created the session
    pub kind: CredentialKind,
    /// Subject as the provider knows it
    pub subject: String,
    /// Issuer
    pub issuer: String,
    /// Token id of the creating credential
    pub token_id: Option<String>,
    /// Email at creation time
    pub email: Option<String>,
}

impl From<&Claims> for ClaimsSnapshot {
    fn from(claims: &Claims) -> Self {
        Self {
            kind: claims.kind,
            subject: claims.subject.clone(),
            issuer: claims.issuer.clone(),
            token_id: claims.token_id.clone(),
            email: claims.email.clone(),
        }
    }
}

/// A server-side session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque handle (`vgs_<43 chars>`)
    pub id: String,
    /// Owning principal
    pub principal_id: PrincipalId,
    /// Provider that authenticated the principal
    pub provider: String,
    /// Claims at creation time
    pub claims: ClaimsSnapshot,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// First characters of the id, safe to log.
    #[must_use]
    pub fn log_id(&self) -> &str {
        log_prefix(&self.id)
    }
}

/// First characters of a session id, safe to log.
#[must_use]
pub fn log_prefix(id: &str) -> &str {
    id.get(..SESSION_PREFIX.len() + 6).unwrap_or(id)
}

/// Outcome of [`SessionStore::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    /// Live session
    Valid(Session),
    /// The session existed but has expired; it has now been deleted
    Expired,
    /// No such session
    NotFound,
}

/// Session store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A bulk revocation for the principal overtook this creation.
    #[error("sessions for principal {0} were revoked while this one was being created")]
    Revoked(PrincipalId),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Trait abstracting the session backend.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Create a session for `principal_id`.
    async fn create(
        &self,
        principal_id: PrincipalId,
        provider: &str,
        claims: ClaimsSnapshot,
    ) -> Result<Session, SessionError>;

    /// Look a session up. Expired sessions are deleted on read.
    async fn validate(&self, id: &str) -> Result<SessionLookup, StoreError>;

    /// Delete one session. Returns `true` if it existed.
    async fn revoke(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete every session of `principal_id`. Returns how many were removed.
    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<usize, StoreError>;

    /// Count live sessions of `principal_id`.
    async fn count_for_principal(&self, principal_id: PrincipalId) -> Result<usize, StoreError>;

    /// Delete all expired sessions. Called by the background reaper.
    async fn reap_expired(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct PrincipalSessions {
    ids: HashSet<String>,
    revoked_through: u64,
}

/// In-memory session store.
pub struct InMemorySessionStore {
    ttl: Duration,
    sessions: DashMap<String, Session>,
    by_principal: DashMap<PrincipalId, PrincipalSessions>,
    tickets: AtomicU64,
    pending: Mutex<BTreeSet<u64>>,
    unavailable: AtomicBool,
}

/// A creation's ticket, registered as pending until dropped.
struct PendingCreate<'a> {
    store: &'a InMemorySessionStore,
    ticket: u64,
}

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        self.store.pending.lock().remove(&self.ticket);
    }
}

impl InMemorySessionStore {
    /// Create an empty store whose sessions live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: DashMap::new(),
            by_principal: DashMap::new(),
            tickets: AtomicU64::new(1),
            pending: Mutex::new(BTreeSet::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Generate a session id: `vgs_` + 256 random bits, URL-safe base64.
    #[must_use]
    pub fn generate_id() -> String {
        let bytes: [u8; 32] = rand::random();
        format!("{SESSION_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Simulate an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored sessions, including expired ones not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` when no session is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("session store marked down".to_string()));
        }
        Ok(())
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst)
    }

    fn begin_create(&self) -> PendingCreate<'_> {
        let mut pending = self.pending.lock();
        let ticket = self.next_ticket();
        pending.insert(ticket);
        PendingCreate { store: self, ticket }
    }

    /// Drop principal entries with no sessions whose revocation ticket no
    /// pending creation could still be refused by.
    fn prune_index(&self) -> usize {
        // No creation may begin while entries are being dropped
        let pending = self.pending.lock();
        let floor = pending.first().copied().unwrap_or(u64::MAX);
        let before = self.by_principal.len();
        self.by_principal
            .retain(|_, entry| !entry.ids.is_empty() || entry.revoked_through > floor);
        drop(pending);
        before.saturating_sub(self.by_principal.len())
    }

    fn insert_with_ticket(
        &self,
        ticket: u64,
        principal_id: PrincipalId,
        provider: &str,
        claims: ClaimsSnapshot,
    ) -> Result<Session, SessionError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let session = Session {
            id: Self::generate_id(),
            principal_id,
            provider: provider.to_string(),
            claims,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut entry = self.by_principal.entry(principal_id).or_default();
        if entry.revoked_through > ticket {
            return Err(SessionError::Revoked(principal_id));
        }
        entry.ids.insert(session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        drop(entry);

        debug!(session = session.log_id(), principal_id = %principal_id, "Created session");
        Ok(session)
    }

    fn forget(&self, session: &Session) {
        if let Some(mut entry) = self.by_principal.get_mut(&session.principal_id) {
            entry.ids.remove(&session.id);
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        principal_id: PrincipalId,
        provider: &str,
        claims: ClaimsSnapshot,
    ) -> Result<Session, SessionError> {
        let pending = self.begin_create();
        self.check()?;
        self.insert_with_ticket(pending.ticket, principal_id, provider, claims)
    }

    async fn validate(&self, id: &str) -> Result<SessionLookup, StoreError> {
        self.check()?;
        let Some(entry) = self.sessions.get(id) else {
            return Ok(SessionLookup::NotFound);
        };
        let session = entry.clone();
        drop(entry);

        if session.is_expired() {
            // Lazy eviction: an expired entry never authenticates
            if self.sessions.remove_if(id, |_, s| s.is_expired()).is_some() {
                self.forget(&session);
                debug!(session = session.log_id(), "Lazy-evicted expired session");
            }
            return Ok(SessionLookup::Expired);
        }

        Ok(SessionLookup::Valid(session))
    }

    async fn revoke(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.forget(&session);
                debug!(session = session.log_id(), "Revoked session");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<usize, StoreError> {
        let ticket = self.next_ticket();
        self.check()?;

        let mut entry = self.by_principal.entry(principal_id).or_default();
        entry.revoked_through = entry.revoked_through.max(ticket);
        let ids: Vec<String> = entry.ids.drain().collect();
        let removed = ids
            .iter()
            .filter(|id| self.sessions.remove(id.as_str()).is_some())
            .count();
        drop(entry);

        debug!(principal_id = %principal_id, count = removed, "Revoked all sessions");
        Ok(removed)
    }

    async fn count_for_principal(&self, principal_id: PrincipalId) -> Result<usize, StoreError> {
        self.check()?;
        let ids: Vec<String> = self
            .by_principal
            .get(&principal_id)
            .map(|entry| entry.ids.iter().cloned().collect())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter(|id| self.sessions.get(id.as_str()).is_some_and(|s| !s.is_expired()))
            .count())
    }

    async fn reap_expired(&self) -> Result<usize, StoreError> {
        self.check()?;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let mut count = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| s.is_expired()) {
                self.forget(&session);
                count += 1;
            }
        }

        let pruned = self.prune_index();
        if pruned > 0 {
            debug!(pruned, "Pruned idle principal entries");
        }
        Ok(count)
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.reap_expired().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Reaped expired sessions"),
                        Err(e) => debug!(error = %e, "Session reap failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    })
}
