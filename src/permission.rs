//! Permission engine
//!
//! Computes a principal's effective permission set and hierarchical level
//! from the authoritative store and caches the result for a fixed TTL.
//!
//! - Expired entries are recomputed, never extended.
//! - [`PermissionEngine::invalidate`] drops an entry immediately. A
//!   computation that was already running when the invalidation arrived is
//!   not cached, so an administrative role change is never undone by a
//!   late write.
//! - Concurrent misses for the same principal share one computation.
//! - [`PermissionEngine::prune`] drops expired entries and invalidation
//!   markers so the maps do not grow with every principal ever seen.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::config::PermissionConfig;
use crate::flight::SingleFlight;
use crate::identity::{PrincipalId, PrincipalStore, StoreError, bounded};

/// Permission lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    /// No such principal.
    #[error("principal {0} not found")]
    UnknownPrincipal(PrincipalId),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<JoinError> for PermissionError {
    fn from(e: JoinError) -> Self {
        Self::Store(StoreError::from(e))
    }
}

/// A principal's resolved capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectivePermissions {
    /// Principal these were computed for
    pub principal_id: PrincipalId,
    /// Union of all role permissions
    pub permissions: BTreeSet<String>,
    /// Highest level among the principal's roles
    pub level: u32,
    /// Roles that contributed
    pub roles: BTreeSet<String>,
    /// When the set was computed
    pub computed_at: DateTime<Utc>,
}

impl EffectivePermissions {
    /// Whether `permission` is granted. A granted `*` matches everything and
    /// a trailing `*` matches by prefix (`documents:*` grants `documents:read`).
    #[must_use]
    pub fn grants(&self, permission: &str) -> bool {
        self.permissions.iter().any(|granted| permission_matches(granted, permission))
    }
}

fn permission_matches(granted: &str, requested: &str) -> bool {
    if let Some(prefix) = granted.strip_suffix('*') {
        requested.starts_with(prefix)
    } else {
        granted == requested
    }
}

struct CachedPermissions {
    value: Arc<EffectivePermissions>,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct PermissionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that needed a computation
    pub misses: u64,
    /// Computations run against the store
    pub computations: u64,
    /// Explicit invalidations
    pub invalidations: u64,
}

type FlightKey = (PrincipalId, u64, u64);

struct Inner {
    store: Arc<dyn PrincipalStore>,
    levels: BTreeMap<String, u32>,
    ttl: Duration,
    timeout: Duration,
    cache: DashMap<PrincipalId, CachedPermissions>,
    /// Marker of the latest invalidation per principal; values never repeat
    generations: DashMap<PrincipalId, u64>,
    generation_seq: AtomicU64,
    epoch: AtomicU64,
    flight: SingleFlight<FlightKey, Arc<EffectivePermissions>, PermissionError>,
    counters: PermissionCounters,
}

/// Cached effective-permission computation.
#[derive(Clone)]
pub struct PermissionEngine {
    inner: Arc<Inner>,
}

impl PermissionEngine {
    /// Create an engine over `store`. Every store call is bounded by
    /// `timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn PrincipalStore>, config: &PermissionConfig, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                levels: config.roles.clone(),
                ttl: config.ttl,
                timeout,
                cache: DashMap::new(),
                generations: DashMap::new(),
                generation_seq: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                flight: SingleFlight::new(),
                counters: PermissionCounters::default(),
            }),
        }
    }

    /// Level of a role, if the role is known.
    #[must_use]
    pub fn level_of(&self, role: &str) -> Option<u32> {
        self.inner.levels.get(role).copied()
    }

    /// Effective permissions of `id`, from cache when fresh.
    pub async fn effective_permissions(
        &self,
        id: PrincipalId,
    ) -> Result<Arc<EffectivePermissions>, PermissionError> {
        let inner = &self.inner;

        if let Some(entry) = inner.cache.get(&id) {
            if entry.cached_at.elapsed() < inner.ttl {
                inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.value));
            }
        }
        inner
            .cache
            .remove_if(&id, |_, entry| entry.cached_at.elapsed() >= inner.ttl);
        inner.counters.misses.fetch_add(1, Ordering::Relaxed);

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let generation = inner.generations.get(&id).map_or(0, |g| *g);
        let work = Arc::clone(inner);
        inner
            .flight
            .run((id, epoch, generation), move || async move {
                let computed = Arc::new(work.compute(id).await?);
                work.store_if_current(id, epoch, generation, &computed);
                Ok(computed)
            })
            .await
    }

    /// Whether `id` holds `permission`.
    pub async fn has(&self, id: PrincipalId, permission: &str) -> Result<bool, PermissionError> {
        Ok(self.effective_permissions(id).await?.grants(permission))
    }

    /// Whether `id` holds every permission. Vacuously true for an empty list.
    pub async fn has_all<S: AsRef<str>>(
        &self,
        id: PrincipalId,
        permissions: &[S],
    ) -> Result<bool, PermissionError> {
        let effective = self.effective_permissions(id).await?;
        Ok(permissions.iter().all(|p| effective.grants(p.as_ref())))
    }

    /// Whether `id` holds at least one permission. False for an empty list.
    pub async fn has_any<S: AsRef<str>>(
        &self,
        id: PrincipalId,
        permissions: &[S],
    ) -> Result<bool, PermissionError> {
        let effective = self.effective_permissions(id).await?;
        Ok(permissions.iter().any(|p| effective.grants(p.as_ref())))
    }

    /// Whether `id`'s level is at least that of `role`. An unknown role is
    /// never reached.
    pub async fn at_least(&self, id: PrincipalId, role: &str) -> Result<bool, PermissionError> {
        let Some(required) = self.level_of(role) else {
            warn!(role, "Level check against unknown role");
            return Ok(false);
        };
        Ok(self.effective_permissions(id).await?.level >= required)
    }

    /// Drop the cached entry of `id`, and refuse to cache any computation
    /// for `id` that is already running.
    pub fn invalidate(&self, id: PrincipalId) {
        let inner = &self.inner;
        let next = inner.generation_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut generation = inner.generations.entry(id).or_insert(0);
        *generation = next;
        inner.cache.remove(&id);
        drop(generation);

        inner.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(principal_id = %id, "Invalidated permission cache entry");
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        let inner = &self.inner;
        // Computations begun before this point are never cached
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.generations.clear();
        inner.cache.clear();

        inner.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("Invalidated all permission cache entries");
    }

    /// Drop expired entries and invalidation markers. Returns the number of
    /// map entries removed.
    ///
    /// Computations already running are not cached afterwards.
    pub fn prune(&self) -> usize {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        let markers = inner.generations.len();
        inner.generations.clear();
        let cached = inner.cache.len();
        inner.cache.retain(|_, entry| entry.cached_at.elapsed() < inner.ttl);

        markers + cached.saturating_sub(inner.cache.len())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PermissionStats {
        let c = &self.inner.counters;
        PermissionStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn compute(&self, id: PrincipalId) -> Result<EffectivePermissions, PermissionError> {
        self.counters.computations.fetch_add(1, Ordering::Relaxed);

        let principal = bounded("get", self.timeout, self.store.get(id))
            .await?
            .ok_or(PermissionError::UnknownPrincipal(id))?;
        let assigned = bounded("assigned_roles", self.timeout, self.store.assigned_roles(id)).await?;

        let mut roles: BTreeSet<String> = assigned.into_iter().collect();
        roles.insert(principal.role);

        let mut permissions = BTreeSet::new();
        let mut level = 0;
        for role in &roles {
            match self.levels.get(role) {
                Some(l) => level = level.max(*l),
                None => debug!(principal_id = %id, role, "Role has no configured level"),
            }
            let granted = bounded("role_permissions", self.timeout, self.store.role_permissions(role)).await?;
            permissions.extend(granted);
        }

        Ok(EffectivePermissions {
            principal_id: id,
            permissions,
            level,
            roles,
            computed_at: Utc::now(),
        })
    }

    fn store_if_current(&self, id: PrincipalId, epoch: u64, generation: u64, value: &Arc<EffectivePermissions>) {
        // Held across the insert so an invalidation cannot slip in between
        let slot = self.generations.entry(id);
        let current = match &slot {
            Entry::Occupied(marker) => *marker.get(),
            Entry::Vacant(_) => 0,
        };
        if current == generation && self.epoch.load(Ordering::SeqCst) == epoch {
            self.cache.insert(
                id,
                CachedPermissions {
                    value: Arc::clone(value),
                    cached_at: Instant::now(),
                },
            );
        } else {
            debug!(principal_id = %id, "Discarding permissions computed before invalidation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{InMemoryPrincipalStore, Principal};
    use pretty_assertions::assert_eq;

    fn seeded() -> Arc<InMemoryPrincipalStore> {
        let store = Arc::new(InMemoryPrincipalStore::new());
        store.insert_principal(Principal::new(PrincipalId(3), "user"));
        store.insert_principal(Principal::new(PrincipalId(9), "admin"));
        store.grant("user", ["documents:read", "profile:*"]);
        store.grant("verifier", ["documents:verify"]);
        store.grant("admin", ["*"]);
        store
    }

    fn engine(store: Arc<InMemoryPrincipalStore>, ttl: Duration) -> PermissionEngine {
        let config = PermissionConfig {
            ttl,
            ..PermissionConfig::default()
        };
        PermissionEngine::new(store, &config, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn union_of_assigned_and_legacy_roles() {
        // GIVEN: a user who was also assigned the verifier role
        let store = seeded();
        store.assign_role(PrincipalId(3), "verifier");
        let engine = engine(store, Duration::from_secs(60));

        // WHEN: computing effective permissions
        let effective = engine.effective_permissions(PrincipalId(3)).await.unwrap();

        // THEN: both roles contribute, level is the higher one
        assert_eq!(
            effective.permissions,
            ["documents:read", "documents:verify", "profile:*"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(effective.level, 20);
    }

    #[tokio::test]
    async fn second_read_within_ttl_does_not_touch_store() {
        let store = seeded();
        let engine = engine(Arc::clone(&store), Duration::from_secs(60));

        let first = engine.effective_permissions(PrincipalId(3)).await.unwrap();
        let reads = store.reads();
        let second = engine.effective_permissions(PrincipalId(3)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.reads(), reads);
        assert_eq!(engine.stats().hits, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recomputed_once() {
        let store = seeded();
        let engine = engine(Arc::clone(&store), Duration::from_millis(20));

        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        engine.effective_permissions(PrincipalId(3)).await.unwrap();

        assert_eq!(engine.stats().computations, 2);
    }

    #[tokio::test]
    async fn invalidate_picks_up_role_change() {
        // GIVEN: a cached user
        let store = seeded();
        let engine = engine(Arc::clone(&store), Duration::from_secs(60));
        assert!(!engine.has(PrincipalId(3), "documents:verify").await.unwrap());

        // WHEN: an administrator promotes them and invalidates
        store.set_role(PrincipalId(3), "verifier").unwrap();
        let stale = engine.has(PrincipalId(3), "documents:verify").await.unwrap();
        engine.invalidate(PrincipalId(3));

        // THEN: the stale answer is served until invalidation, the new one after
        assert!(!stale);
        assert!(engine.has(PrincipalId(3), "documents:verify").await.unwrap());
    }

    #[tokio::test]
    async fn invalidation_during_computation_is_not_undone() {
        // GIVEN: a slow store
        let store = seeded();
        store.set_latency(Some(Duration::from_millis(30)));
        let engine = engine(Arc::clone(&store), Duration::from_secs(60));

        // WHEN: an invalidation lands while a computation is running
        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.effective_permissions(PrincipalId(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.invalidate(PrincipalId(3));
        running.await.unwrap().unwrap();

        // THEN: its result was not cached
        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        assert_eq!(engine.stats().computations, 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_computation() {
        let store = seeded();
        store.set_latency(Some(Duration::from_millis(20)));
        let engine = engine(store, Duration::from_secs(60));

        let lookups: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.effective_permissions(PrincipalId(9)).await })
            })
            .collect();
        for lookup in futures::future::join_all(lookups).await {
            assert_eq!(lookup.unwrap().unwrap().level, 90);
        }

        assert_eq!(engine.stats().computations, 1);
    }

    #[tokio::test]
    async fn check_primitives() {
        let engine = engine(seeded(), Duration::from_secs(60));
        let user = PrincipalId(3);

        assert!(engine.has(user, "profile:edit").await.unwrap());
        assert!(engine.has_all(user, &["documents:read", "profile:view"]).await.unwrap());
        assert!(!engine.has_all(user, &["documents:read", "documents:delete"]).await.unwrap());
        assert!(engine.has_any(user, &["documents:delete", "documents:read"]).await.unwrap());
        assert!(!engine.has_any::<&str>(user, &[]).await.unwrap());
        assert!(engine.has_all::<&str>(user, &[]).await.unwrap());

        assert!(engine.has(PrincipalId(9), "anything:at-all").await.unwrap());
    }

    #[tokio::test]
    async fn at_least_compares_levels() {
        let engine = engine(seeded(), Duration::from_secs(60));

        assert!(engine.at_least(PrincipalId(3), "user").await.unwrap());
        assert!(engine.at_least(PrincipalId(3), "guest").await.unwrap());
        assert!(!engine.at_least(PrincipalId(3), "manager").await.unwrap());
        assert!(engine.at_least(PrincipalId(9), "manager").await.unwrap());
        assert!(!engine.at_least(PrincipalId(9), "emperor").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_principal_and_store_outage() {
        let store = seeded();
        let engine = engine(Arc::clone(&store), Duration::from_secs(60));

        assert_eq!(
            engine.effective_permissions(PrincipalId(404)).await.unwrap_err(),
            PermissionError::UnknownPrincipal(PrincipalId(404))
        );

        store.set_unavailable(true);
        assert!(matches!(
            engine.effective_permissions(PrincipalId(3)).await.unwrap_err(),
            PermissionError::Store(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_entry() {
        let engine = engine(seeded(), Duration::from_secs(60));
        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        engine.effective_permissions(PrincipalId(9)).await.unwrap();

        engine.invalidate_all();
        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        engine.effective_permissions(PrincipalId(9)).await.unwrap();

        assert_eq!(engine.stats().computations, 4);
    }

    #[tokio::test]
    async fn prune_drops_markers_and_expired_entries() {
        // GIVEN: one expired entry and one invalidation marker
        let engine = engine(seeded(), Duration::from_millis(10));
        engine.effective_permissions(PrincipalId(3)).await.unwrap();
        engine.invalidate(PrincipalId(9));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // WHEN: pruning
        let removed = engine.prune();

        // THEN: both maps are empty and lookups still work
        assert_eq!(removed, 2);
        assert!(engine.inner.generations.is_empty());
        assert!(engine.inner.cache.is_empty());
        assert_eq!(engine.effective_permissions(PrincipalId(9)).await.unwrap().level, 90);
    }

    #[tokio::test]
    async fn prune_does_not_resurrect_an_invalidated_computation() {
        // GIVEN: a computation running when an invalidation and a prune land
        let store = seeded();
        store.set_latency(Some(Duration::from_millis(30)));
        let engine = engine(Arc::clone(&store), Duration::from_secs(60));
        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.effective_permissions(PrincipalId(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.invalidate(PrincipalId(3));
        engine.prune();
        running.await.unwrap().unwrap();

        // WHEN: the next lookup arrives
        engine.effective_permissions(PrincipalId(3)).await.unwrap();

        // THEN: it recomputed instead of reading the stale result
        assert_eq!(engine.stats().computations, 2);
    }

    #[test]
    fn permission_glob_matching() {
        assert!(permission_matches("*", "documents:read"));
        assert!(permission_matches("documents:*", "documents:read"));
        assert!(!permission_matches("documents:*", "profile:read"));
        assert!(permission_matches("documents:read", "documents:read"));
        assert!(!permission_matches("documents:read", "documents:readall"));
    }
}
