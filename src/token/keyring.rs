//! Verification key cache for one external issuer.
//!
//! # Fetch discipline
//!
//! - A fetched key set is served for `ttl`; after that the next lookup
//!   refreshes it.
//! - An unknown `kid` forces one refresh. If the key is still missing the
//!   `kid` is remembered for `negative_ttl` so repeated lookups do not reach
//!   the origin.
//! - Concurrent refreshes coalesce into one origin request.
//! - Refreshes are rate limited to `max_fetches` per `fetch_window`. A
//!   limited refresh falls back to the key set already held, even if stale.
//! - Each fetch is bounded by `fetch_timeout`.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::KeyRingConfig;
use crate::flight::SingleFlight;

type FetchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Why a key set could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFetchError {
    /// Transport failure.
    #[error("key set request failed: {0}")]
    Http(String),

    /// The origin answered with a non-success status.
    #[error("key set origin returned HTTP {0}")]
    Status(u16),

    /// The fetch exceeded its time bound.
    #[error("key set fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The refresh budget for the current window is spent.
    #[error("key set refresh rate limited")]
    RateLimited,

    /// The origin returned something that is not a key set.
    #[error("malformed key set: {0}")]
    Malformed(String),

    /// The fetch task died.
    #[error("key set fetch aborted: {0}")]
    Aborted(String),
}

impl From<JoinError> for KeyFetchError {
    fn from(e: JoinError) -> Self {
        Self::Aborted(e.to_string())
    }
}

/// Key ring lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyRingError {
    /// The issuer does not publish this key id.
    #[error("unknown key id `{0}`")]
    NotFound(String),

    /// The key set could not be obtained.
    #[error(transparent)]
    Fetch(#[from] KeyFetchError),
}

/// Public key family, used to match a key against a token's algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFamily {
    /// RSA (RS*, PS*)
    Rsa,
    /// Elliptic curve (ES*)
    Ec,
    /// Edwards curve (`EdDSA`)
    Ed,
}

impl KeyFamily {
    /// Whether a key of this family can verify `alg`.
    #[must_use]
    pub fn accepts(self, alg: Algorithm) -> bool {
        matches!(
            (self, alg),
            (
                Self::Rsa,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ) | (Self::Ec, Algorithm::ES256 | Algorithm::ES384)
                | (Self::Ed, Algorithm::EdDSA)
        )
    }
}

/// A verification key published by an issuer.
#[derive(Clone)]
pub struct SigningKey {
    /// Key id
    pub kid: String,
    /// Key family
    pub family: KeyFamily,
    /// Key material
    pub key: DecodingKey,
    /// When the containing key set was fetched
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Where key sets come from.
#[async_trait::async_trait]
pub trait KeySetSource: Send + Sync + 'static {
    /// Fetch the key set published at `origin`.
    async fn fetch(&self, origin: &str) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches key sets over HTTPS.
pub struct HttpKeySetSource {
    http: reqwest::Client,
}

impl HttpKeySetSource {
    /// Create a client with the given per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self, origin: &str) -> Result<JwkSet, KeyFetchError> {
        let response = self
            .http
            .get(origin)
            .send()
            .await
            .map_err(|e| KeyFetchError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Status(status.as_u16()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KeyFetchError::Malformed(e.to_string()))?;
        parse_key_set(&body)
    }
}

/// Parse a JWKS document, skipping individual keys this library cannot
/// represent instead of rejecting the whole set.
pub fn parse_key_set(body: &serde_json::Value) -> Result<JwkSet, KeyFetchError> {
    let keys = body
        .get("keys")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| KeyFetchError::Malformed("missing `keys` array".to_string()))?;

    let keys = keys
        .iter()
        .filter_map(|k| match serde_json::from_value::<Jwk>(k.clone()) {
            Ok(jwk) => Some(jwk),
            Err(e) => {
                debug!(error = %e, "Skipping unparseable JWK");
                None
            }
        })
        .collect();

    Ok(JwkSet { keys })
}

/// Snapshot of a fetched key set.
struct KeySnapshot {
    keys: HashMap<String, SigningKey>,
    fetched_at: Instant,
}

/// Key ring counters.
#[derive(Debug, Default)]
struct KeyRingCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
}

/// Point-in-time key ring statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyRingStats {
    /// Lookups served from a fresh key set
    pub hits: u64,
    /// Lookups that needed a refresh
    pub misses: u64,
    /// Lookups answered by the negative cache
    pub negative_hits: u64,
    /// Origin requests made
    pub fetches: u64,
    /// Origin requests that failed
    pub fetch_errors: u64,
}

struct Inner {
    origin: String,
    source: Arc<dyn KeySetSource>,
    ttl: Duration,
    negative_ttl: Duration,
    fetch_timeout: Duration,
    snapshot: RwLock<Option<Arc<KeySnapshot>>>,
    negative: DashMap<String, Instant>,
    limiter: FetchLimiter,
    flight: SingleFlight<(), Arc<KeySnapshot>, KeyFetchError>,
    counters: KeyRingCounters,
}

/// Cached verification keys for one origin.
#[derive(Clone)]
pub struct KeyRing {
    inner: Arc<Inner>,
}

impl KeyRing {
    /// Create an empty key ring for `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>, source: Arc<dyn KeySetSource>, config: &KeyRingConfig) -> Self {
        let burst = NonZeroU32::new(config.max_fetches).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(config.fetch_window / burst.get())
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);

        Self {
            inner: Arc::new(Inner {
                origin: origin.into(),
                source,
                ttl: config.ttl,
                negative_ttl: config.negative_ttl,
                fetch_timeout: config.fetch_timeout,
                snapshot: RwLock::new(None),
                negative: DashMap::new(),
                limiter: RateLimiter::direct(quota),
                flight: SingleFlight::new(),
                counters: KeyRingCounters::default(),
            }),
        }
    }

    /// Look up a verification key by id.
    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, KeyRingError> {
        let inner = &self.inner;
        let current = inner.snapshot.read().clone();

        if let Some(snapshot) = &current
            && snapshot.fetched_at.elapsed() < inner.ttl
        {
            if let Some(key) = snapshot.keys.get(kid) {
                inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(key.clone());
            }
            if self.is_negative(kid) {
                inner.counters.negative_hits.fetch_add(1, Ordering::Relaxed);
                return Err(KeyRingError::NotFound(kid.to_string()));
            }
        }

        inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        match self.refresh().await {
            Ok(snapshot) => {
                if let Some(key) = snapshot.keys.get(kid) {
                    return Ok(key.clone());
                }
                inner.negative.insert(kid.to_string(), Instant::now());
                debug!(origin = %inner.origin, kid, "Key id not published, caching miss");
                Err(KeyRingError::NotFound(kid.to_string()))
            }
            Err(KeyFetchError::RateLimited) => match current {
                Some(snapshot) => {
                    warn!(origin = %inner.origin, kid, "Key refresh rate limited, using held key set");
                    snapshot
                        .keys
                        .get(kid)
                        .cloned()
                        .ok_or_else(|| KeyRingError::NotFound(kid.to_string()))
                }
                None => Err(KeyFetchError::RateLimited.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> KeyRingStats {
        let c = &self.inner.counters;
        KeyRingStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            negative_hits: c.negative_hits.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_errors: c.fetch_errors.load(Ordering::Relaxed),
        }
    }

    fn is_negative(&self, kid: &str) -> bool {
        let ttl = self.inner.negative_ttl;
        if let Some(at) = self.inner.negative.get(kid) {
            if at.elapsed() < ttl {
                return true;
            }
        }
        self.inner.negative.remove_if(kid, |_, at| at.elapsed() >= ttl);
        false
    }

    async fn refresh(&self) -> Result<Arc<KeySnapshot>, KeyFetchError> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .run((), move || async move { inner.fetch_snapshot().await })
            .await
    }
}

impl Inner {
    async fn fetch_snapshot(&self) -> Result<Arc<KeySnapshot>, KeyFetchError> {
        if self.limiter.check().is_err() {
            return Err(KeyFetchError::RateLimited);
        }

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch(&self.origin))
            .await
            .map_err(|_| KeyFetchError::Timeout(self.fetch_timeout))
            .and_then(|r| r);

        let jwks = match fetched {
            Ok(jwks) => jwks,
            Err(e) => {
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(origin = %self.origin, error = %e, "Key set fetch failed");
                return Err(e);
            }
        };

        let now = Utc::now();
        let keys: HashMap<String, SigningKey> = jwks
            .keys
            .iter()
            .filter_map(|jwk| signing_key(jwk, now))
            .map(|key| (key.kid.clone(), key))
            .collect();

        info!(origin = %self.origin, keys = keys.len(), "Fetched key set");

        let snapshot = Arc::new(KeySnapshot {
            keys,
            fetched_at: Instant::now(),
        });
        *self.snapshot.write() = Some(Arc::clone(&snapshot));
        self.negative.retain(|kid, _| !snapshot.keys.contains_key(kid));
        Ok(snapshot)
    }
}

/// Convert a JWK into a verification key. Symmetric keys, encryption keys
/// and keys without an id are skipped.
fn signing_key(jwk: &Jwk, fetched_at: DateTime<Utc>) -> Option<SigningKey> {
    let kid = jwk.common.key_id.clone()?;
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return None;
    }

    let (family, key) = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => (
            KeyFamily::Rsa,
            DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()?,
        ),
        AlgorithmParameters::EllipticCurve(ec) => (
            KeyFamily::Ec,
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()?,
        ),
        AlgorithmParameters::OctetKeyPair(okp) => {
            (KeyFamily::Ed, DecodingKey::from_ed_components(&okp.x).ok()?)
        }
        AlgorithmParameters::OctetKey(_) => return None,
    };

    Some(SigningKey {
        kid,
        family,
        key,
        fetched_at,
    })
}
