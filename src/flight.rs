//! Single-flight coalescing for cache population.
//!
//! Concurrent callers asking for the same key share one in-flight
//! computation instead of each hitting the origin. The computation runs on
//! its own task, so it still completes (and populates whatever cache it
//! writes to) when every waiter has been dropped, e.g. on client disconnect.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinError;

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Deduplicates concurrent computations keyed by `K`.
pub struct SingleFlight<K, V, E>
where
    K: Eq + Hash,
{
    in_flight: Arc<DashMap<K, SharedResult<V, E>>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    /// Create an empty flight table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run `make()` for `key`, or join the computation already running for it.
    ///
    /// `make` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let table = Arc::clone(&self.in_flight);
                let work = make();
                // The spawned task cannot remove its own entry until this
                // shard lock is released, so the insert below always lands first.
                let handle = tokio::spawn(async move {
                    let result = work.await;
                    table.remove(&key);
                    result
                });
                let shared = async move { handle.await.unwrap_or_else(|e| Err(E::from(e))) }
                    .boxed()
                    .shared();
                slot.insert(shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of computations currently running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
