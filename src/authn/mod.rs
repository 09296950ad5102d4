//! Authentication decisions
//!
//! [`Authenticator::authenticate`] is the single entry point. Each call walks
//! `NoCredential → Verifying → Resolving → Authorizing → Decided`, produces
//! one [`AuthResult`] and appends exactly one audit event (unless an
//! anonymous health check opted out).
//!
//! Nothing escapes `authenticate()`: component errors fold into
//! [`FailureReason`], panics become [`FailureReason::AuthSystemError`], and
//! an audit write that fails turns the result into a failure.

pub mod middleware;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::config::Config;
use crate::credential::{Credential, CredentialKind, RequestContext};
use crate::identity::{IdentityResolver, Principal, PrincipalId, PrincipalStore, ResolveError, StoreError, bounded};
use crate::permission::{PermissionEngine, PermissionError};
use crate::session::{ClaimsSnapshot, Session, SessionError, SessionLookup, SessionStore};
use crate::token::{
    Claims, KeyFetchError, KeySetSource, LocalTokenVerifier, OidcTokenVerifier, RevocationList, TokenVerifier,
    VerificationFailure,
};

/// How the principal of a result was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Locally signed token
    Local,
    /// External provider token
    Oidc,
    /// Opaque session handle
    Session,
    /// No credential
    Anonymous,
}

impl From<CredentialKind> for AuthMethod {
    fn from(kind: CredentialKind) -> Self {
        match kind {
            CredentialKind::LocalSigned => Self::Local,
            CredentialKind::ExternalOidc => Self::Oidc,
            CredentialKind::OpaqueSession => Self::Session,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Oidc => "oidc",
            Self::Session => "session",
            Self::Anonymous => "anonymous",
        })
    }
}

/// Per-call requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOptions {
    /// Fail with `MissingCredential` when no credential is presented
    pub required: bool,
    /// If non-empty, the principal's stored role must be one of these
    pub allowed_roles: Vec<String>,
    /// If non-empty, the principal must hold at least one of these
    pub allowed_permissions: Vec<String>,
    /// Suppress the audit write. Only honored when no credential was
    /// presented.
    pub skip_audit: bool,
    /// Create a session on successful token authentication
    pub issue_session: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            required: true,
            allowed_roles: Vec::new(),
            allowed_permissions: Vec::new(),
            skip_audit: false,
            issue_session: false,
        }
    }
}

impl AuthOptions {
    /// Authentication required, no role or permission requirement.
    #[must_use]
    pub fn required() -> Self {
        Self::default()
    }

    /// Authentication optional.
    #[must_use]
    pub fn optional() -> Self {
        Self {
            required: false,
            ..Self::default()
        }
    }

    /// Require one of `roles`.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Require at least one of `permissions`.
    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Do not audit anonymous calls.
    #[must_use]
    pub fn skip_audit(mut self) -> Self {
        self.skip_audit = true;
        self
    }

    /// Issue a session on success.
    #[must_use]
    pub fn issue_session(mut self) -> Self {
        self.issue_session = true;
        self
    }
}

/// Why authentication failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// No usable credential where one is required
    #[error("missing credential")]
    MissingCredential,

    /// Every applicable verifier rejected the credential
    #[error("invalid credential: {0}")]
    InvalidCredential(VerificationFailure),

    /// A valid credential names a principal that does not exist
    #[error("unknown principal")]
    UnknownPrincipal,

    /// Not enough identity data to provision a principal
    #[error("insufficient identity data")]
    InsufficientIdentity,

    /// Refused to link on an unverified email
    #[error("unverified email")]
    UnverifiedEmail,

    /// The principal is locked or inactive
    #[error("account disabled")]
    AccountDisabled,

    /// The principal lacks the required role or permission
    #[error("authorization denied: requires one of {required:?}, principal has role `{actual}`")]
    AuthorizationDenied {
        /// Roles or permissions any one of which would have sufficed
        required: Vec<String>,
        /// The principal's stored role
        actual: String,
    },

    /// Verification keys cannot be fetched
    #[error("key fetch failed: {0}")]
    KeyFetch(KeyFetchError),

    /// The principal or session store failed
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unanticipated internal fault
    #[error("internal authentication error")]
    AuthSystemError,
}

impl FailureReason {
    /// Stable internal code, recorded in audit events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential(failure) => failure.code(),
            Self::UnknownPrincipal => "unknown_principal",
            Self::InsufficientIdentity => "insufficient_identity",
            Self::UnverifiedEmail => "unverified_email",
            Self::AccountDisabled => "account_disabled",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::KeyFetch(_) => "key_fetch_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::AuthSystemError => "auth_system_error",
        }
    }

    /// Code safe to show a caller. Credential rejections collapse into one.
    #[must_use]
    pub fn public_code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::InvalidCredential(_) | Self::UnknownPrincipal | Self::InsufficientIdentity | Self::UnverifiedEmail => {
                "invalid_credential"
            }
            Self::AccountDisabled => "account_disabled",
            Self::AuthorizationDenied { .. } => "forbidden",
            Self::KeyFetch(_) | Self::StoreUnavailable(_) => "temporarily_unavailable",
            Self::AuthSystemError => "internal_error",
        }
    }

    /// Message safe to show a caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingCredential => "authentication required",
            Self::InvalidCredential(_) | Self::UnknownPrincipal | Self::InsufficientIdentity | Self::UnverifiedEmail => {
                "invalid or expired credential"
            }
            Self::AccountDisabled => "account disabled",
            Self::AuthorizationDenied { .. } => "insufficient permissions",
            Self::KeyFetch(_) | Self::StoreUnavailable(_) => "authentication temporarily unavailable, retry later",
            Self::AuthSystemError => "internal authentication error",
        }
    }

    /// HTTP status for this failure.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential
            | Self::InvalidCredential(_)
            | Self::UnknownPrincipal
            | Self::InsufficientIdentity
            | Self::UnverifiedEmail => StatusCode::UNAUTHORIZED,
            Self::AccountDisabled | Self::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            Self::KeyFetch(_) | Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AuthSystemError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only infrastructure failures may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyFetch(_) | Self::StoreUnavailable(_))
    }

    fn audit_kind(&self) -> AuditEventKind {
        match self {
            Self::AuthorizationDenied { .. } => AuditEventKind::Denied,
            Self::KeyFetch(_) | Self::StoreUnavailable(_) | Self::AuthSystemError => AuditEventKind::Error,
            _ => AuditEventKind::Failure,
        }
    }
}

impl From<VerificationFailure> for FailureReason {
    fn from(failure: VerificationFailure) -> Self {
        match failure {
            VerificationFailure::KeyUnavailable(e) => Self::KeyFetch(e),
            other => Self::InvalidCredential(other),
        }
    }
}

/// Only outages are retryable; data conditions keep their meaning.
impl From<StoreError> for FailureReason {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout { .. } | StoreError::Unavailable(_) => Self::StoreUnavailable(e.to_string()),
            StoreError::NotFound(_) => Self::UnknownPrincipal,
            StoreError::EmailInUse(_) => Self::UnverifiedEmail,
            StoreError::Conflict { .. } => {
                error!(error = %e, "Identity store reported an unresolved linkage conflict");
                Self::AuthSystemError
            }
        }
    }
}

impl From<ResolveError> for FailureReason {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::UnknownPrincipal(_) => Self::UnknownPrincipal,
            ResolveError::InsufficientIdentity => Self::InsufficientIdentity,
            ResolveError::UnverifiedEmail => Self::UnverifiedEmail,
            ResolveError::Store(e) => e.into(),
        }
    }
}

impl From<PermissionError> for FailureReason {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::UnknownPrincipal(_) => Self::UnknownPrincipal,
            PermissionError::Store(e) => e.into(),
        }
    }
}

/// Decision states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No credential presented
    NoCredential,
    /// Checking the credential
    Verifying,
    /// Mapping claims to a principal
    Resolving,
    /// Checking role and permission requirements
    Authorizing,
    /// Terminal
    Decided,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoCredential => "no_credential",
            Self::Verifying => "verifying",
            Self::Resolving => "resolving",
            Self::Authorizing => "authorizing",
            Self::Decided => "decided",
        })
    }
}

/// Outcome of [`Authenticator::authenticate`]. Immutable.
#[derive(Debug, Clone)]
pub struct AuthResult {
    success: bool,
    principal: Option<Principal>,
    method: AuthMethod,
    failure_reason: Option<FailureReason>,
    timestamp: DateTime<Utc>,
    correlation_id: Uuid,
    session_id: Option<String>,
}

impl AuthResult {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// The authenticated principal. `None` on failure and for anonymous
    /// success.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// How the principal was authenticated.
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Why the call failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure_reason.as_ref()
    }

    /// Decision time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Id shared with the audit event.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Session issued by this call, if requested and created.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Working state of one decision.
struct Decision {
    stage: Stage,
    credential_present: bool,
    credential_kind: Option<CredentialKind>,
    method: AuthMethod,
    principal: Option<Principal>,
    principal_id: Option<PrincipalId>,
    failure: Option<FailureReason>,
    detail: Option<String>,
    session_id: Option<String>,
}

impl Decision {
    fn new() -> Self {
        Self {
            stage: Stage::NoCredential,
            credential_present: false,
            credential_kind: None,
            method: AuthMethod::Anonymous,
            principal: None,
            principal_id: None,
            failure: None,
            detail: None,
            session_id: None,
        }
    }

    fn fail(mut self, reason: FailureReason) -> Self {
        self.detail.get_or_insert_with(|| reason.to_string());
        self.failure = Some(reason);
        self.stage = Stage::Decided;
        self
    }

    fn succeed(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self.stage = Stage::Decided;
        self
    }

    fn audit_event(&self, correlation_id: Uuid, ctx: &RequestContext) -> AuditEvent {
        let kind = self
            .failure
            .as_ref()
            .map_or(AuditEventKind::Success, FailureReason::audit_kind);
        let mut event = AuditEvent::new(kind, correlation_id, ctx);
        event.principal_id = self.principal_id;
        event.credential_kind = self.credential_kind;
        event.method = self.method;
        event.outcome = self
            .failure
            .as_ref()
            .map_or_else(|| "granted".to_string(), |f| f.code().to_string());
        event.detail.clone_from(&self.detail);
        event
    }

    fn into_result(self, correlation_id: Uuid) -> AuthResult {
        let success = self.failure.is_none();
        AuthResult {
            success,
            principal: if success { self.principal } else { None },
            method: self.method,
            failure_reason: self.failure,
            timestamp: Utc::now(),
            correlation_id,
            session_id: if success { self.session_id } else { None },
        }
    }
}

/// What verification produced.
enum Verified {
    Token(Claims),
    Session(Session),
}

/// Everything an [`Authenticator`] drives.
pub struct Components {
    /// Token verification
    pub verifier: TokenVerifier,
    /// Claims to principal mapping
    pub resolver: IdentityResolver,
    /// Session handles
    pub sessions: Arc<dyn SessionStore>,
    /// Effective permissions
    pub permissions: PermissionEngine,
    /// Audit destination
    pub audit: Arc<dyn AuditSink>,
    /// Session cookie name
    pub cookie_name: String,
    /// Bound on each session store call
    pub store_timeout: Duration,
}

/// The authentication orchestrator.
pub struct Authenticator {
    verifier: TokenVerifier,
    resolver: IdentityResolver,
    sessions: Arc<dyn SessionStore>,
    permissions: PermissionEngine,
    audit: Arc<dyn AuditSink>,
    cookie_name: String,
    store_timeout: Duration,
}

impl Authenticator {
    /// Assemble from components.
    #[must_use]
    pub fn new(components: Components) -> Self {
        let Components {
            verifier,
            resolver,
            sessions,
            permissions,
            audit,
            cookie_name,
            store_timeout,
        } = components;
        Self {
            verifier,
            resolver,
            sessions,
            permissions,
            audit,
            cookie_name,
            store_timeout,
        }
    }

    /// Build every component from configuration around the given backends.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn PrincipalStore>,
        sessions: Arc<dyn SessionStore>,
        revocations: Arc<dyn RevocationList>,
        audit: Arc<dyn AuditSink>,
        key_source: Arc<dyn KeySetSource>,
    ) -> crate::Result<Self> {
        let skew = config.verifier.clock_skew;
        let local = LocalTokenVerifier::from_config(&config.local, skew)?;
        if local.is_none() {
            warn!("No local token secret configured, local tokens will be rejected");
        }
        let oidc = OidcTokenVerifier::from_config(&config.providers, &config.key_ring, &key_source, skew)?;

        Ok(Self::new(Components {
            verifier: TokenVerifier::new(local, oidc, revocations),
            resolver: IdentityResolver::new(
                Arc::clone(&store),
                &config.permissions.default_role,
                config.store.timeout,
            ),
            sessions,
            permissions: PermissionEngine::new(store, &config.permissions, config.store.timeout),
            audit,
            cookie_name: config.sessions.cookie_name.clone(),
            store_timeout: config.store.timeout,
        }))
    }

    /// Token verification.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Identity resolution.
    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Permission engine.
    #[must_use]
    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    /// Session cookie name.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Decide one request.
    pub async fn authenticate(&self, ctx: &RequestContext, options: &AuthOptions) -> AuthResult {
        let correlation_id = Uuid::new_v4();

        let mut decision = match AssertUnwindSafe(self.decide(ctx, options)).catch_unwind().await {
            Ok(decision) => decision,
            Err(panic) => {
                error!(
                    %correlation_id,
                    panic = panic_message(panic.as_ref()),
                    "Authentication panicked"
                );
                let mut decision = Decision::new().fail(FailureReason::AuthSystemError);
                decision.credential_present = true;
                decision
            }
        };

        if options.skip_audit && !decision.credential_present {
            debug!(%correlation_id, "Audit skipped for anonymous call");
        } else if let Err(e) = self.audit.append(decision.audit_event(correlation_id, ctx)).await {
            error!(%correlation_id, error = %e, "Audit write failed, failing closed");
            if let Some(session_id) = decision.session_id.take()
                && let Err(e) = self.sessions.revoke(&session_id).await
            {
                warn!(
                    %correlation_id,
                    session_id = crate::session::log_prefix(&session_id),
                    error = %e,
                    "Unaudited session could not be revoked"
                );
            }
            decision.principal = None;
            decision.failure = Some(FailureReason::AuthSystemError);
        }

        debug!(
            %correlation_id,
            stage = %decision.stage,
            method = %decision.method,
            outcome = decision.failure.as_ref().map_or("granted", FailureReason::code),
            "Authentication decided"
        );
        decision.into_result(correlation_id)
    }

    async fn decide(&self, ctx: &RequestContext, options: &AuthOptions) -> Decision {
        let mut decision = Decision::new();

        let Some(credential) = ctx.credential(&self.cookie_name) else {
            return if options.required {
                decision.fail(FailureReason::MissingCredential)
            } else {
                decision.succeed(None)
            };
        };
        decision.credential_present = true;

        decision.stage = Stage::Verifying;
        let (kind, verified) = match self.verify(&credential).await {
            Ok(ok) => ok,
            Err((kind, reason)) => {
                decision.credential_kind = kind;
                return decision.fail(reason);
            }
        };
        decision.credential_kind = Some(kind);
        decision.method = AuthMethod::from(kind);

        decision.stage = Stage::Resolving;
        let resolved = match &verified {
            Verified::Token(claims) => self.resolver.resolve(claims).await,
            Verified::Session(session) => self.resolver.resolve_id(session.principal_id).await,
        };
        let principal = match resolved {
            Ok(principal) => principal,
            Err(e) => return decision.fail(e.into()),
        };
        decision.principal_id = Some(principal.id);

        if !principal.is_enabled() {
            decision.detail = Some(format!(
                "active={} locked={}",
                principal.active, principal.locked
            ));
            return decision.fail(FailureReason::AccountDisabled);
        }

        decision.stage = Stage::Authorizing;
        if !options.allowed_roles.is_empty() && !options.allowed_roles.contains(&principal.role) {
            return decision.fail(FailureReason::AuthorizationDenied {
                required: options.allowed_roles.clone(),
                actual: principal.role.clone(),
            });
        }

        if !options.allowed_permissions.is_empty() {
            match self
                .permissions
                .has_any(principal.id, &options.allowed_permissions)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    return decision.fail(FailureReason::AuthorizationDenied {
                        required: options.allowed_permissions.clone(),
                        actual: principal.role.clone(),
                    });
                }
                Err(e) => return decision.fail(e.into()),
            }
        }

        if options.issue_session
            && let Verified::Token(claims) = &verified
        {
            match self.create_session(&principal, claims).await {
                Ok(session) => decision.session_id = session.map(|s| s.id),
                Err(reason) => return decision.fail(reason),
            }
        }

        decision.succeed(Some(principal))
    }

    /// Try each applicable verifier in priority order. On rejection, return
    /// the most specific failure and the kind that produced it.
    async fn verify(
        &self,
        credential: &Credential,
    ) -> Result<(CredentialKind, Verified), (Option<CredentialKind>, FailureReason)> {
        let mut failure = VerificationFailure::Unrecognized;
        let mut failed_kind = None;

        for kind in self.verifier.candidate_kinds(credential) {
            let attempt = match kind {
                CredentialKind::OpaqueSession => {
                    match bounded("session_validate", self.store_timeout, self.sessions.validate(credential.raw())).await {
                        Ok(SessionLookup::Valid(session)) => Ok(Verified::Session(session)),
                        Ok(SessionLookup::Expired) => Err(VerificationFailure::SessionExpired),
                        Ok(SessionLookup::NotFound) => Err(VerificationFailure::SessionNotFound),
                        Err(e) => return Err((Some(kind), e.into())),
                    }
                }
                CredentialKind::LocalSigned | CredentialKind::ExternalOidc => {
                    self.verifier.verify_as(kind, credential).await.map(Verified::Token)
                }
            };

            match attempt {
                Ok(verified) => return Ok((kind, verified)),
                Err(e) => {
                    debug!(kind = %kind, reason = e.code(), "Verifier rejected credential");
                    if failed_kind.is_none() || e.specificity() > failure.specificity() {
                        failed_kind = Some(kind);
                    }
                    failure = failure.most_specific(e);
                }
            }
        }

        Err((failed_kind, failure.into()))
    }

    /// `Ok(None)` when a concurrent bulk revocation overtook the creation.
    async fn create_session(&self, principal: &Principal, claims: &Claims) -> Result<Option<Session>, FailureReason> {
        let created = tokio::time::timeout(
            self.store_timeout,
            self.sessions.create(principal.id, &claims.provider, ClaimsSnapshot::from(claims)),
        )
        .await;

        match created {
            Ok(Ok(session)) => Ok(Some(session)),
            Ok(Err(SessionError::Revoked(id))) => {
                warn!(principal_id = %id, "Sessions revoked during login, no session issued");
                Ok(None)
            }
            Ok(Err(SessionError::Store(e))) => Err(e.into()),
            Err(_) => Err(FailureReason::StoreUnavailable(format!(
                "session create timed out after {:?}",
                self.store_timeout
            ))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::LocalTokenConfig;
    use crate::identity::InMemoryPrincipalStore;
    use crate::session::InMemorySessionStore;
    use crate::token::{InMemoryRevocationList, LocalTokenIssuer};
    use jsonwebtoken::jwk::JwkSet;

    struct NoKeys;

    #[async_trait::async_trait]
    impl KeySetSource for NoKeys {
        async fn fetch(&self, _origin: &str) -> Result<JwkSet, KeyFetchError> {
            Err(KeyFetchError::Status(503))
        }
    }

    struct Fixture {
        auth: Authenticator,
        store: Arc<InMemoryPrincipalStore>,
        audit: Arc<MemoryAuditSink>,
        issuer: LocalTokenIssuer,
    }

    fn fixture() -> Fixture {
        let mut config = Config::default();
        config.local = LocalTokenConfig {
            secret: Some("unit-test-secret".to_string()),
            ..LocalTokenConfig::default()
        };

        let store = Arc::new(InMemoryPrincipalStore::new());
        store.insert_principal(Principal::new(PrincipalId(3), "user"));
        let audit = Arc::new(MemoryAuditSink::new());
        let auth = Authenticator::from_config(
            &config,
            store.clone(),
            Arc::new(InMemorySessionStore::new(Duration::from_secs(60))),
            Arc::new(InMemoryRevocationList::new()),
            audit.clone(),
            Arc::new(NoKeys),
        )
        .unwrap();

        Fixture {
            auth,
            store,
            audit,
            issuer: LocalTokenIssuer::from_config(&config.local).unwrap(),
        }
    }

    #[test]
    fn default_options_require_authentication() {
        let options = AuthOptions::default();
        assert!(options.required);
        assert!(!options.skip_audit);
        assert!(!options.issue_session);
        assert!(!AuthOptions::optional().required);
    }

    #[test]
    fn failure_taxonomy() {
        let expired = FailureReason::from(VerificationFailure::Expired);
        assert_eq!(expired.code(), "expired");
        assert_eq!(expired.public_code(), "invalid_credential");
        assert_eq!(expired.public_message(), "invalid or expired credential");
        assert_eq!(expired.status_code(), StatusCode::UNAUTHORIZED);
        assert!(!expired.is_retryable());

        let outage = FailureReason::from(VerificationFailure::KeyUnavailable(KeyFetchError::Status(502)));
        assert_eq!(outage.code(), "key_fetch_error");
        assert_eq!(outage.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(outage.is_retryable());

        let denied = FailureReason::AuthorizationDenied {
            required: vec!["admin".to_string()],
            actual: "user".to_string(),
        };
        assert_eq!(denied.status_code(), StatusCode::FORBIDDEN);
        assert!(!denied.public_message().contains("admin"));

        assert_eq!(FailureReason::AuthSystemError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn store_errors_keep_their_meaning() {
        let timeout = FailureReason::from(StoreError::Timeout {
            operation: "get",
            timeout: Duration::from_secs(2),
        });
        assert!(matches!(timeout, FailureReason::StoreUnavailable(_)));
        assert!(timeout.is_retryable());

        let down = FailureReason::from(ResolveError::Store(StoreError::Unavailable("down".to_string())));
        assert!(matches!(down, FailureReason::StoreUnavailable(_)));
        assert!(down.is_retryable());

        let vanished = FailureReason::from(ResolveError::Store(StoreError::NotFound(PrincipalId(3))));
        assert_eq!(vanished, FailureReason::UnknownPrincipal);
        assert!(!vanished.is_retryable());

        let taken = FailureReason::from(ResolveError::Store(StoreError::EmailInUse(PrincipalId(3))));
        assert_eq!(taken, FailureReason::UnverifiedEmail);
        assert_eq!(taken.status_code(), StatusCode::UNAUTHORIZED);

        let conflict = FailureReason::from(PermissionError::Store(StoreError::Conflict {
            provider: "acme".to_string(),
            subject: "ext-1".to_string(),
        }));
        assert_eq!(conflict, FailureReason::AuthSystemError);
        assert!(!conflict.is_retryable());

        let gone = FailureReason::from(PermissionError::Store(StoreError::NotFound(PrincipalId(9))));
        assert_eq!(gone, FailureReason::UnknownPrincipal);
    }

    #[tokio::test]
    async fn anonymous_optional_call_succeeds_without_principal() {
        let f = fixture();

        let result = f.auth.authenticate(&RequestContext::new("/health"), &AuthOptions::optional()).await;

        assert!(result.is_success());
        assert!(result.principal().is_none());
        assert_eq!(result.method(), AuthMethod::Anonymous);
        assert_eq!(f.audit.len(), 1);
    }

    #[tokio::test]
    async fn missing_credential_fails_when_required() {
        let f = fixture();

        let result = f.auth.authenticate(&RequestContext::new("/v1/me"), &AuthOptions::required()).await;

        assert_eq!(result.failure_reason(), Some(&FailureReason::MissingCredential));
        let events = f.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, AuditEventKind::Failure);
        assert_eq!(events[0].correlation_id, result.correlation_id());
    }

    #[tokio::test]
    async fn skip_audit_is_ignored_when_a_credential_is_presented() {
        let f = fixture();
        let options = AuthOptions::optional().skip_audit();

        f.auth.authenticate(&RequestContext::new("/health"), &options).await;
        assert!(f.audit.is_empty());

        let token = f.issuer.issue(PrincipalId(3), None).unwrap().token;
        f.auth
            .authenticate(&RequestContext::new("/health").with_bearer(&token), &options)
            .await;
        assert_eq!(f.audit.len(), 1);
    }

    #[tokio::test]
    async fn invalid_credential_fails_even_when_optional() {
        let f = fixture();
        let ctx = RequestContext::new("/health").with_bearer("vgs_not-a-session");

        let result = f.auth.authenticate(&ctx, &AuthOptions::optional()).await;

        assert_eq!(
            result.failure_reason(),
            Some(&FailureReason::InvalidCredential(VerificationFailure::SessionNotFound))
        );
    }

    #[tokio::test]
    async fn disabled_account_is_distinct_from_bad_credential() {
        let f = fixture();
        f.store.set_locked(PrincipalId(3), true).unwrap();
        let token = f.issuer.issue(PrincipalId(3), None).unwrap().token;

        let result = f
            .auth
            .authenticate(&RequestContext::new("/v1/me").with_bearer(&token), &AuthOptions::required())
            .await;

        assert_eq!(result.failure_reason(), Some(&FailureReason::AccountDisabled));
        assert_eq!(f.audit.events()[0].principal_id, Some(PrincipalId(3)));
    }

    #[tokio::test]
    async fn audit_failure_fails_closed() {
        let f = fixture();
        f.audit.set_failing(true);
        let token = f.issuer.issue(PrincipalId(3), None).unwrap().token;

        let result = f
            .auth
            .authenticate(&RequestContext::new("/v1/me").with_bearer(&token), &AuthOptions::required())
            .await;

        assert!(!result.is_success());
        assert!(result.principal().is_none());
        assert_eq!(result.failure_reason(), Some(&FailureReason::AuthSystemError));
    }

    #[tokio::test]
    async fn store_outage_is_unavailable_not_unauthenticated() {
        let f = fixture();
        f.store.set_unavailable(true);
        let token = f.issuer.issue(PrincipalId(3), None).unwrap().token;

        let result = f
            .auth
            .authenticate(&RequestContext::new("/v1/me").with_bearer(&token), &AuthOptions::required())
            .await;

        let reason = result.failure_reason().unwrap();
        assert!(matches!(reason, FailureReason::StoreUnavailable(_)));
        assert!(reason.is_retryable());
        assert_eq!(f.audit.events()[0].event, AuditEventKind::Error);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("bang");
        let other: Box<dyn std::any::Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(owned.as_ref()), "boom");
        assert_eq!(panic_message(borrowed.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
