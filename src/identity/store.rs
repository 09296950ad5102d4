//! Principal store: the authoritative record of identities, roles and
//! role permissions.
//!
//! The [`PrincipalStore`] trait abstracts over storage backends. The schema
//! and the production database adapter live outside this crate; the
//! [`InMemoryPrincipalStore`] here is the reference implementation used by
//! the standalone server and the tests. Its administrative methods stand in
//! for the external admin path that changes roles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinError;

use super::{Linkage, NewPrincipal, Principal, PrincipalId, ProviderIdentity, LOCAL_PROVIDER};

/// Store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A store call exceeded its time bound.
    #[error("store operation `{operation}` timed out after {timeout:?}")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Configured bound
        timeout: Duration,
    },

    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The referenced principal does not exist.
    #[error("principal {0} not found")]
    NotFound(PrincipalId),

    /// The provider identity is already linked to another principal.
    #[error("identity {provider}:{subject} is linked to another principal")]
    Conflict {
        /// Provider name
        provider: String,
        /// Provider subject
        subject: String,
    },

    /// The email belongs to another principal and was not verified for linking.
    #[error("email is already owned by principal {0}")]
    EmailInUse(PrincipalId),
}


impl From<JoinError> for StoreError {
    fn from(e: JoinError) -> Self {
        Self::Unavailable(format!("store task aborted: {e}"))
    }
}

/// Run a store future under a time bound.
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout { operation, timeout })?
}

/// Result of a provisioning call.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// The principal that now owns the identity
    pub principal: Principal,
    /// `false` when the identity or its verified email already had an owner
    pub created: bool,
}

/// Trait abstracting the authoritative principal store.
///
/// Every write is individually atomic: a principal and its first provider
/// linkage are created together or not at all.
#[async_trait::async_trait]
pub trait PrincipalStore: Send + Sync + 'static {
    /// Fetch a principal by id.
    async fn get(&self, id: PrincipalId) -> Result<Option<Principal>, StoreError>;

    /// Fetch the principal linked to `provider`/`subject`.
    async fn find_by_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<Principal>, StoreError>;

    /// Fetch a principal by email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError>;

    /// Create a principal together with its first provider linkage.
    ///
    /// Never creates a duplicate. Under the same atomic write:
    /// - an external identity that is already linked returns its owner;
    /// - an email owned by another principal links the identity to that
    ///   owner when `new.email_verified`, and fails with
    ///   [`StoreError::EmailInUse`] otherwise.
    ///
    /// Both reuse cases report `created == false`.
    async fn provision(&self, new: NewPrincipal, linkage: Linkage) -> Result<Provisioned, StoreError>;

    /// Link an additional provider identity to an existing principal.
    async fn link_identity(
        &self,
        id: PrincipalId,
        identity: ProviderIdentity,
    ) -> Result<Principal, StoreError>;

    /// Record a successful login.
    async fn record_login(&self, id: PrincipalId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Roles assigned to the principal in addition to its legacy role field.
    async fn assigned_roles(&self, id: PrincipalId) -> Result<Vec<String>, StoreError>;

    /// Permissions granted by a role.
    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct State {
    next_id: u64,
    principals: BTreeMap<PrincipalId, Principal>,
    identities: HashMap<(String, String), PrincipalId>,
    emails: HashMap<String, PrincipalId>,
    assignments: HashMap<PrincipalId, BTreeSet<String>>,
    grants: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn allocate_id(&mut self) -> PrincipalId {
        self.next_id += 1;
        PrincipalId(self.next_id)
    }

    fn index(&mut self, principal: &Principal) {
        if let Some(email) = &principal.email {
            self.emails.insert(email.to_lowercase(), principal.id);
        }
        for identity in &principal.identities {
            self.identities.insert(
                (identity.provider.clone(), identity.subject.clone()),
                principal.id,
            );
        }
    }
}

/// In-memory principal store behind a single `RwLock`.
///
/// Holding one lock for each write makes provisioning atomic with respect
/// to concurrent first logins for the same identity.
#[derive(Default)]
pub struct InMemoryPrincipalStore {
    state: RwLock<State>,
    reads: AtomicU64,
    unavailable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryPrincipalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a principal as-is. Ids above the current
    /// sequence advance it so provisioning never reuses them.
    pub fn insert_principal(&self, principal: Principal) {
        let mut state = self.state.write();
        state.next_id = state.next_id.max(principal.id.0);
        state.index(&principal);
        state.principals.insert(principal.id, principal);
    }

    /// Administrative role change on the legacy role field.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown principals.
    pub fn set_role(&self, id: PrincipalId, role: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let principal = state.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        principal.role = role.to_string();
        Ok(())
    }

    /// Assign an additional role.
    pub fn assign_role(&self, id: PrincipalId, role: &str) {
        self.state
            .write()
            .assignments
            .entry(id)
            .or_default()
            .insert(role.to_string());
    }

    /// Grant permissions to a role.
    pub fn grant<I, S>(&self, role: &str, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .write()
            .grants
            .entry(role.to_string())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
    }

    /// Lock or unlock a principal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown principals.
    pub fn set_locked(&self, id: PrincipalId, locked: bool) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let principal = state.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        principal.locked = locked;
        Ok(())
    }

    /// Activate or deactivate a principal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown principals.
    pub fn set_active(&self, id: PrincipalId, active: bool) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let principal = state.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        principal.active = active;
        Ok(())
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Add artificial latency to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of store calls served so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of principals held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().principals.len()
    }

    /// Returns `true` when no principal is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked down".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn get(&self, id: PrincipalId) -> Result<Option<Principal>, StoreError> {
        self.enter().await?;
        Ok(self.state.read().principals.get(&id).cloned())
    }

    async fn find_by_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<Principal>, StoreError> {
        self.enter().await?;
        let state = self.state.read();
        Ok(state
            .identities
            .get(&(provider.to_string(), subject.to_string()))
            .and_then(|id| state.principals.get(id))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        self.enter().await?;
        let state = self.state.read();
        Ok(state
            .emails
            .get(&email.to_lowercase())
            .and_then(|id| state.principals.get(id))
            .cloned())
    }

    async fn provision(&self, new: NewPrincipal, linkage: Linkage) -> Result<Provisioned, StoreError> {
        self.enter().await?;
        let mut state = self.state.write();

        if let Linkage::External(identity) = &linkage {
            let key = (identity.provider.clone(), identity.subject.clone());
            if let Some(existing) = state.identities.get(&key).and_then(|id| state.principals.get(id)) {
                return Ok(Provisioned {
                    principal: existing.clone(),
                    created: false,
                });
            }
        }

        let email_owner = new
            .email
            .as_ref()
            .and_then(|email| state.emails.get(&email.to_lowercase()).copied())
            .filter(|owner| state.principals.contains_key(owner));
        if let Some(owner) = email_owner {
            let Linkage::External(identity) = linkage else {
                return Err(StoreError::EmailInUse(owner));
            };
            if !new.email_verified {
                return Err(StoreError::EmailInUse(owner));
            }
            let key = (identity.provider.clone(), identity.subject.clone());
            let principal = state.principals.get_mut(&owner).ok_or(StoreError::NotFound(owner))?;
            principal.identities.push(identity);
            let principal = principal.clone();
            state.identities.insert(key, owner);
            return Ok(Provisioned {
                principal,
                created: false,
            });
        }

        let id = state.allocate_id();
        let now = Utc::now();
        let identity = match linkage {
            Linkage::Local => ProviderIdentity {
                provider: LOCAL_PROVIDER.to_string(),
                subject: id.to_string(),
                linked_at: now,
            },
            Linkage::External(identity) => identity,
        };

        let principal = Principal {
            id,
            email: new.email,
            handle: new.handle,
            role: new.role,
            active: true,
            locked: false,
            last_login_at: None,
            created_at: now,
            identities: vec![identity],
        };
        state.index(&principal);
        state.principals.insert(id, principal.clone());

        Ok(Provisioned {
            principal,
            created: true,
        })
    }

    async fn link_identity(
        &self,
        id: PrincipalId,
        identity: ProviderIdentity,
    ) -> Result<Principal, StoreError> {
        self.enter().await?;
        let mut state = self.state.write();
        let key = (identity.provider.clone(), identity.subject.clone());

        match state.identities.get(&key) {
            Some(owner) if *owner == id => {}
            Some(_) => {
                return Err(StoreError::Conflict {
                    provider: identity.provider,
                    subject: identity.subject,
                });
            }
            None => {
                let principal = state.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
                principal.identities.push(identity);
                state.identities.insert(key, id);
            }
        }

        state.principals.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn record_login(&self, id: PrincipalId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.enter().await?;
        let mut state = self.state.write();
        let principal = state.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        principal.last_login_at = Some(at);
        Ok(())
    }

    async fn assigned_roles(&self, id: PrincipalId) -> Result<Vec<String>, StoreError> {
        self.enter().await?;
        Ok(self
            .state
            .read()
            .assignments
            .get(&id)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, StoreError> {
        self.enter().await?;
        Ok(self
            .state
            .read()
            .grants
            .get(role)
            .map(|perms| perms.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external(subject: &str) -> Linkage {
        Linkage::External(ProviderIdentity {
            provider: "google".to_string(),
            subject: subject.to_string(),
            linked_at: Utc::now(),
        })
    }

    fn new_principal(email: &str) -> NewPrincipal {
        NewPrincipal {
            email: Some(email.to_string()),
            handle: None,
            role: "user".to_string(),
            email_verified: true,
        }
    }

    #[tokio::test]
    async fn provision_creates_principal_and_linkage_together() {
        let store = InMemoryPrincipalStore::new();

        let provisioned = store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();

        assert!(provisioned.created);
        let found = store.find_by_identity("google", "g-1").await.unwrap().unwrap();
        assert_eq!(found.id, provisioned.principal.id);
        assert_eq!(found.identities.len(), 1);
        assert!(store.find_by_email("A@Example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn provision_same_identity_twice_returns_existing() {
        let store = InMemoryPrincipalStore::new();
        let first = store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();

        let second = store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(first.principal.id, second.principal.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn provision_links_verified_email_to_its_owner() {
        // GIVEN: a principal owning an email
        let store = InMemoryPrincipalStore::new();
        let first = store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();

        // WHEN: another identity with the same verified email is provisioned
        let second = store
            .provision(new_principal("A@example.com"), external("g-2"))
            .await
            .unwrap();

        // THEN: it is linked to the owner instead of creating a duplicate
        assert!(!second.created);
        assert_eq!(second.principal.id, first.principal.id);
        assert_eq!(second.principal.identities.len(), 2);
        assert_eq!(store.len(), 1);
        let found = store.find_by_identity("google", "g-2").await.unwrap().unwrap();
        assert_eq!(found.id, first.principal.id);
    }

    #[tokio::test]
    async fn provision_refuses_unverified_email_owned_by_another() {
        let store = InMemoryPrincipalStore::new();
        let owner = store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();
        let unverified = NewPrincipal {
            email_verified: false,
            ..new_principal("a@example.com")
        };

        let err = store.provision(unverified, external("g-2")).await.unwrap_err();

        assert_eq!(err, StoreError::EmailInUse(owner.principal.id));
        assert_eq!(store.len(), 1);
        assert!(store.find_by_identity("google", "g-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_registration_never_takes_an_owned_email() {
        let store = InMemoryPrincipalStore::new();
        store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();

        let err = store
            .provision(new_principal("a@example.com"), Linkage::Local)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::EmailInUse(_)));
    }

    #[tokio::test]
    async fn local_linkage_uses_new_principal_id() {
        let store = InMemoryPrincipalStore::new();
        let provisioned = store
            .provision(new_principal("l@example.com"), Linkage::Local)
            .await
            .unwrap();

        let identity = &provisioned.principal.identities[0];
        assert_eq!(identity.provider, LOCAL_PROVIDER);
        assert_eq!(identity.subject, provisioned.principal.id.to_string());
    }

    #[tokio::test]
    async fn link_identity_rejects_identity_owned_by_other_principal() {
        let store = InMemoryPrincipalStore::new();
        store
            .provision(new_principal("a@example.com"), external("g-1"))
            .await
            .unwrap();
        let other = store
            .provision(new_principal("b@example.com"), external("g-2"))
            .await
            .unwrap();

        let err = store
            .link_identity(
                other.principal.id,
                ProviderIdentity {
                    provider: "google".to_string(),
                    subject: "g-1".to_string(),
                    linked_at: Utc::now(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn inserted_ids_advance_sequence() {
        let store = InMemoryPrincipalStore::new();
        store.insert_principal(Principal::new(PrincipalId(7), "user"));

        let provisioned = store
            .provision(new_principal("n@example.com"), Linkage::Local)
            .await
            .unwrap();

        assert_eq!(provisioned.principal.id, PrincipalId(8));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryPrincipalStore::new();
        store.set_unavailable(true);

        let err = store.get(PrincipalId(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn bounded_maps_elapsed_to_timeout() {
        let store = InMemoryPrincipalStore::new();
        store.set_latency(Some(Duration::from_millis(200)));

        let err = bounded("get", Duration::from_millis(10), store.get(PrincipalId(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Timeout { operation: "get", .. }));
    }
}
