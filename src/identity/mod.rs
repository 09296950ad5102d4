//! Identity resolution
//!
//! Maps verified claims onto a [`Principal`] record, provisioning one on the
//! first login from an external provider. The authoritative role always
//! comes from the store; any role-like claim in the token is ignored.

pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::credential::CredentialKind;
use crate::token::Claims;

pub use store::{InMemoryPrincipalStore, PrincipalStore, Provisioned, StoreError, bounded};

/// Provider name recorded for locally registered identities.
pub const LOCAL_PROVIDER: &str = "local";

/// Stable principal identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub u64);

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PrincipalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A provider identity linked to a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    /// Provider name (`local` for this service)
    pub provider: String,
    /// Subject assigned by the provider
    pub subject: String,
    /// When the linkage was created
    pub linked_at: DateTime<Utc>,
}

/// The resolved identity of a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier
    pub id: PrincipalId,
    /// Contact email
    pub email: Option<String>,
    /// Display handle
    pub handle: Option<String>,
    /// Authoritative legacy role
    pub role: String,
    /// Account is active
    pub active: bool,
    /// Account is administratively locked
    pub locked: bool,
    /// Last successful login
    pub last_login_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Linked provider identities
    pub identities: Vec<ProviderIdentity>,
}

impl Principal {
    /// A bare active principal with the given role.
    #[must_use]
    pub fn new(id: PrincipalId, role: &str) -> Self {
        Self {
            id,
            email: None,
            handle: None,
            role: role.to_string(),
            active: true,
            locked: false,
            last_login_at: None,
            created_at: Utc::now(),
            identities: Vec::new(),
        }
    }

    /// Set the email.
    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Link a provider identity.
    #[must_use]
    pub fn with_identity(mut self, provider: &str, subject: &str) -> Self {
        self.identities.push(ProviderIdentity {
            provider: provider.to_string(),
            subject: subject.to_string(),
            linked_at: Utc::now(),
        });
        self
    }

    /// Active and not locked.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.active && !self.locked
    }
}

/// Fields for a principal about to be created.
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    /// Contact email
    pub email: Option<String>,
    /// Display handle
    pub handle: Option<String>,
    /// Initial role
    pub role: String,
    /// The provider vouches for `email`; an existing owner of it receives
    /// the new identity instead of a duplicate principal being created
    pub email_verified: bool,
}

/// The provider linkage written together with a new principal.
#[derive(Debug, Clone)]
pub enum Linkage {
    /// Locally registered; the subject is the new principal id
    Local,
    /// External provider identity
    External(ProviderIdentity),
}

/// Why resolution failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// A local token names a principal that does not exist
    #[error("no principal for subject `{0}`")]
    UnknownPrincipal(String),

    /// An external token carries neither email nor handle
    #[error("claims carry no email or handle to provision from")]
    InsufficientIdentity,

    /// Refused to link an existing account on an unverified email
    #[error("email is not verified by the provider")]
    UnverifiedEmail,

    /// The store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves verified claims to principals, provisioning on first login.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn PrincipalStore>,
    default_role: String,
    timeout: Duration,
}

impl IdentityResolver {
    /// Create a resolver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PrincipalStore>, default_role: &str, timeout: Duration) -> Self {
        Self {
            store,
            default_role: default_role.to_string(),
            timeout,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PrincipalStore> {
        &self.store
    }

    /// Resolve claims to a principal.
    ///
    /// Local tokens name the principal id directly. External tokens are
    /// looked up by `(provider, subject)`, then linked by verified email,
    /// and finally provisioned with the default role.
    pub async fn resolve(&self, claims: &Claims) -> Result<Principal, ResolveError> {
        let principal = match claims.kind {
            CredentialKind::ExternalOidc => self.resolve_external(claims).await?,
            CredentialKind::LocalSigned | CredentialKind::OpaqueSession => {
                let id = claims
                    .subject
                    .parse::<PrincipalId>()
                    .map_err(|_| ResolveError::UnknownPrincipal(claims.subject.clone()))?;
                self.resolve_id(id).await?
            }
        };

        let now = Utc::now();
        bounded("record_login", self.timeout, self.store.record_login(principal.id, now)).await?;

        Ok(Principal {
            last_login_at: Some(now),
            ..principal
        })
    }

    /// Load a principal by id.
    pub async fn resolve_id(&self, id: PrincipalId) -> Result<Principal, ResolveError> {
        bounded("get", self.timeout, self.store.get(id))
            .await?
            .ok_or_else(|| ResolveError::UnknownPrincipal(id.to_string()))
    }

    /// Register a local principal with the default role.
    pub async fn register_local(
        &self,
        email: Option<String>,
        handle: Option<String>,
    ) -> Result<Principal, ResolveError> {
        if email.is_none() && handle.is_none() {
            return Err(ResolveError::InsufficientIdentity);
        }

        let new = NewPrincipal {
            email,
            handle,
            role: self.default_role.clone(),
            email_verified: false,
        };
        let provisioned =
            bounded("provision", self.timeout, self.store.provision(new, Linkage::Local)).await?;

        info!(principal_id = %provisioned.principal.id, "Registered local principal");
        Ok(provisioned.principal)
    }

    async fn resolve_external(&self, claims: &Claims) -> Result<Principal, ResolveError> {
        let provider = claims.provider.as_str();
        let subject = claims.subject.as_str();

        if let Some(principal) = bounded(
            "find_by_identity",
            self.timeout,
            self.store.find_by_identity(provider, subject),
        )
        .await?
        {
            debug!(principal_id = %principal.id, provider, "Resolved linked identity");
            return Ok(principal);
        }

        if claims.email.is_none() && claims.handle.is_none() {
            return Err(ResolveError::InsufficientIdentity);
        }

        let identity = ProviderIdentity {
            provider: provider.to_string(),
            subject: subject.to_string(),
            linked_at: Utc::now(),
        };

        if let Some(email) = &claims.email {
            let existing =
                bounded("find_by_email", self.timeout, self.store.find_by_email(email)).await?;
            if let Some(existing) = existing {
                if !claims.email_verified {
                    warn!(
                        principal_id = %existing.id,
                        provider,
                        "Refusing to link identity on unverified email"
                    );
                    return Err(ResolveError::UnverifiedEmail);
                }
                let linked = bounded(
                    "link_identity",
                    self.timeout,
                    self.store.link_identity(existing.id, identity),
                )
                .await;
                return match linked {
                    Ok(linked) => {
                        info!(principal_id = %linked.id, provider, "Linked provider identity by email");
                        Ok(linked)
                    }
                    // A concurrent login linked this identity first
                    Err(StoreError::Conflict { .. }) => self.linked_owner(provider, subject).await,
                    Err(e) => Err(e.into()),
                };
            }
        }

        let new = NewPrincipal {
            email: claims.email.clone(),
            handle: claims.handle.clone(),
            role: self.default_role.clone(),
            email_verified: claims.email_verified,
        };
        let provisioned = bounded(
            "provision",
            self.timeout,
            self.store.provision(new, Linkage::External(identity)),
        )
        .await
        .map_err(|e| match e {
            StoreError::EmailInUse(owner) => {
                warn!(principal_id = %owner, provider, "Refusing to link identity on unverified email");
                ResolveError::UnverifiedEmail
            }
            other => other.into(),
        })?;

        if provisioned.created {
            info!(
                principal_id = %provisioned.principal.id,
                provider,
                role = %provisioned.principal.role,
                "Provisioned principal on first login"
            );
        } else {
            debug!(principal_id = %provisioned.principal.id, provider, "First login joined an existing principal");
        }
        Ok(provisioned.principal)
    }

    async fn linked_owner(&self, provider: &str, subject: &str) -> Result<Principal, ResolveError> {
        bounded(
            "find_by_identity",
            self.timeout,
            self.store.find_by_identity(provider, subject),
        )
        .await?
        .ok_or_else(|| {
            ResolveError::Store(StoreError::Conflict {
                provider: provider.to_string(),
                subject: subject.to_string(),
            })
        })
    }
}
