//! Token verification
//!
//! One verifier per credential kind, selected by an explicit priority list:
//!
//! 1. [`oidc::OidcTokenVerifier`] for tokens from configured external
//!    providers, keys resolved through a [`keyring::KeyRing`].
//! 2. [`local::LocalTokenVerifier`] for tokens this service signs itself.
//!
//! Opaque session handles are not tokens; they are validated against the
//! session store by the orchestrator.
//!
//! Every check has its own [`VerificationFailure`] so audit records can
//! tell an expired token from a forged one. Callers only ever see the
//! collapsed public message.

pub mod keyring;
pub mod local;
pub mod oidc;
pub mod revocation;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::credential::{Credential, CredentialKind, CredentialShape};

pub use keyring::{KeyFetchError, KeyRing, KeyRingError, KeySetSource};
pub use local::{IssuedToken, LocalTokenIssuer, LocalTokenVerifier};
pub use oidc::OidcTokenVerifier;
pub use revocation::{InMemoryRevocationList, RevocationList};

/// Validated token payload.
///
/// `custom` holds every claim not modelled here. It is carried for logging
/// and must never feed an authorization decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Which verifier accepted the credential
    pub kind: CredentialKind,
    /// Provider name (`local` for this service)
    pub provider: String,
    /// Subject, external or local
    pub subject: String,
    /// Issuer
    pub issuer: String,
    /// Audience
    pub audience: Vec<String>,
    /// Issued-at
    pub issued_at: Option<DateTime<Utc>>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Not-before
    pub not_before: Option<DateTime<Utc>>,
    /// Token id
    pub token_id: Option<String>,
    /// Email
    pub email: Option<String>,
    /// Whether the provider verified `email`
    pub email_verified: bool,
    /// Stable handle (`preferred_username`)
    pub handle: Option<String>,
    /// Remaining claims, untrusted
    pub custom: Map<String, Value>,
}

#[cfg(test)]
impl Claims {
    pub(crate) fn test(kind: CredentialKind, provider: &str, subject: &str) -> Self {
        Self {
            kind,
            provider: provider.to_string(),
            subject: subject.to_string(),
            issuer: provider.to_string(),
            audience: Vec::new(),
            issued_at: Some(Utc::now()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            not_before: None,
            token_id: None,
            email: None,
            email_verified: false,
            handle: None,
            custom: Map::new(),
        }
    }
}

/// Why a credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationFailure {
    /// Not a decodable token
    #[error("malformed token")]
    Malformed,

    /// Algorithm not on the allow-list
    #[error("algorithm `{0}` is not allowed")]
    UnsupportedAlgorithm(String),

    /// Asymmetric token without `kid`
    #[error("token header has no key id")]
    MissingKeyId,

    /// Issuer does not publish the key
    #[error("unknown key id `{0}`")]
    UnknownKey(String),

    /// Signature does not verify
    #[error("bad signature")]
    BadSignature,

    /// `exp` is in the past
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future
    #[error("token not yet valid")]
    NotYetValid,

    /// `iat` is in the future beyond the allowed skew
    #[error("token issued in the future")]
    IssuedInFuture,

    /// `iss` is not a configured issuer
    #[error("unknown issuer `{0}`")]
    UnknownIssuer(String),

    /// `aud` does not name this service
    #[error("audience mismatch")]
    InvalidAudience,

    /// `jti` is on the revocation list
    #[error("token revoked")]
    Revoked,

    /// No `sub`
    #[error("token has no subject")]
    MissingSubject,

    /// Session handle past its expiry
    #[error("session expired")]
    SessionExpired,

    /// Unknown session handle
    #[error("session not found")]
    SessionNotFound,

    /// Verification keys cannot be fetched right now
    #[error("verification keys unavailable: {0}")]
    KeyUnavailable(KeyFetchError),

    /// No verifier applies
    #[error("unrecognized credential")]
    Unrecognized,
}

impl VerificationFailure {
    /// Stable machine-readable code, used in audit records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::MissingKeyId => "missing_key_id",
            Self::UnknownKey(_) => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::IssuedInFuture => "issued_in_future",
            Self::UnknownIssuer(_) => "unknown_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::Revoked => "revoked",
            Self::MissingSubject => "missing_subject",
            Self::SessionExpired => "session_expired",
            Self::SessionNotFound => "session_not_found",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Rank used to pick the most informative failure when several
    /// verifiers reject the same credential. Higher wins.
    ///
    /// Key unavailability outranks everything: reporting a different
    /// verifier's rejection instead would turn an outage into a 401.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        match self {
            Self::KeyUnavailable(_) => 100,
            Self::Revoked => 90,
            Self::Expired | Self::NotYetValid | Self::IssuedInFuture | Self::SessionExpired => 80,
            Self::BadSignature => 70,
            Self::UnknownKey(_) | Self::InvalidAudience => 60,
            Self::MissingKeyId | Self::MissingSubject => 40,
            Self::UnknownIssuer(_) => 30,
            Self::UnsupportedAlgorithm(_) => 20,
            Self::SessionNotFound => 10,
            Self::Malformed => 5,
            Self::Unrecognized => 0,
        }
    }

    /// Keep whichever of `self` and `other` is more specific.
    #[must_use]
    pub fn most_specific(self, other: Self) -> Self {
        if other.specificity() > self.specificity() {
            other
        } else {
            self
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationFailure {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidAlgorithm => Self::UnsupportedAlgorithm("mismatch".to_string()),
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            _ => {
                debug!(error = %e, "Token rejected as malformed");
                Self::Malformed
            }
        }
    }
}

/// Header and issuer read from a token before any verification.
///
/// Only used to pick a verifier and a key; nothing here is trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct UnverifiedToken {
    /// Algorithm as written in the header
    pub alg: String,
    /// Key id
    pub kid: Option<String>,
    /// Issuer claim
    pub iss: Option<String>,
}

impl UnverifiedToken {
    /// Decode the header and payload segments without verifying anything.
    pub fn peek(raw: &str) -> Result<Self, VerificationFailure> {
        let mut parts = raw.split('.');
        let (Some(header), Some(payload)) = (parts.next(), parts.next()) else {
            return Err(VerificationFailure::Malformed);
        };

        let header = decode_segment(header)?;
        let payload = decode_segment(payload)?;

        let alg = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or(VerificationFailure::Malformed)?
            .to_string();

        Ok(Self {
            alg,
            kid: header.get("kid").and_then(Value::as_str).map(str::to_string),
            iss: payload.get("iss").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Parse the algorithm and check it against an allow-list.
    ///
    /// `none` never parses, so unsigned tokens fail here.
    pub fn algorithm(&self, allowed: &[Algorithm]) -> Result<Algorithm, VerificationFailure> {
        self.alg
            .parse::<Algorithm>()
            .ok()
            .filter(|alg| allowed.contains(alg))
            .ok_or_else(|| VerificationFailure::UnsupportedAlgorithm(self.alg.clone()))
    }

    /// Whether the header names an asymmetric algorithm.
    #[must_use]
    pub fn is_asymmetric(&self) -> bool {
        !matches!(self.alg.as_str(), "HS256" | "HS384" | "HS512") && self.alg.parse::<Algorithm>().is_ok()
    }
}

fn decode_segment(segment: &str) -> Result<Value, VerificationFailure> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| VerificationFailure::Malformed)?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|_| VerificationFailure::Malformed)?;
    value
        .is_object()
        .then_some(value)
        .ok_or(VerificationFailure::Malformed)
}

/// `aud` as either a string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

/// Claims as they appear on the wire.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<Value>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(flatten)]
    custom: Map<String, Value>,
}

/// Expectations applied after the signature has been verified.
pub(crate) struct Expected<'a> {
    pub kind: CredentialKind,
    pub provider: &'a str,
    pub issuer: &'a str,
    pub audiences: &'a [String],
    pub skew: Duration,
}

/// Signature, `exp` and `nbf` checks are delegated to `jsonwebtoken`;
/// issuer, audience and `iat` are checked in [`RawClaims::into_claims`].
pub(crate) fn validation(alg: Algorithm, skew: Duration) -> Validation {
    let mut validation = Validation::new(alg);
    validation.leeway = skew.as_secs();
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation
}

impl RawClaims {
    pub(crate) fn into_claims(self, expected: &Expected<'_>) -> Result<Claims, VerificationFailure> {
        let issuer = self.iss.unwrap_or_default();
        if issuer != expected.issuer {
            return Err(VerificationFailure::UnknownIssuer(issuer));
        }

        let audience = match self.aud {
            Some(Audience::One(aud)) => vec![aud],
            Some(Audience::Many(auds)) => auds,
            None => Vec::new(),
        };
        if !expected.audiences.is_empty() && !audience.iter().any(|a| expected.audiences.contains(a)) {
            return Err(VerificationFailure::InvalidAudience);
        }

        let skew = i64::try_from(expected.skew.as_secs()).unwrap_or(i64::MAX);
        let now = Utc::now().timestamp();
        if let Some(iat) = self.iat
            && iat > now.saturating_add(skew)
        {
            return Err(VerificationFailure::IssuedInFuture);
        }

        let subject = self
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(VerificationFailure::MissingSubject)?;

        let email_verified = match self.email_verified {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        Ok(Claims {
            kind: expected.kind,
            provider: expected.provider.to_string(),
            subject,
            issuer,
            audience,
            issued_at: self.iat.and_then(timestamp),
            expires_at: timestamp(self.exp).ok_or(VerificationFailure::Malformed)?,
            not_before: self.nbf.and_then(timestamp),
            token_id: self.jti,
            email: self.email.filter(|e| !e.is_empty()),
            email_verified,
            handle: self.preferred_username.filter(|h| !h.is_empty()),
            custom: self.custom,
        })
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Dispatches signed credentials to the right verifier and enforces the
/// revocation list.
pub struct TokenVerifier {
    local: Option<LocalTokenVerifier>,
    oidc: OidcTokenVerifier,
    revocations: Arc<dyn RevocationList>,
}

impl TokenVerifier {
    /// Create a verifier. Without a local verifier, only external tokens
    /// are accepted.
    #[must_use]
    pub fn new(
        local: Option<LocalTokenVerifier>,
        oidc: OidcTokenVerifier,
        revocations: Arc<dyn RevocationList>,
    ) -> Self {
        Self {
            local,
            oidc,
            revocations,
        }
    }

    /// The revocation list checked after signature verification.
    #[must_use]
    pub fn revocations(&self) -> &Arc<dyn RevocationList> {
        &self.revocations
    }

    /// The verifiers applicable to `credential`, in the order they must be
    /// tried.
    ///
    /// External is tried first when the token is structurally plausible for
    /// it: its unverified issuer is a configured provider, or it names an
    /// asymmetric algorithm. Local is always tried for signed tokens when
    /// configured. Opaque credentials only ever map to a session lookup.
    #[must_use]
    pub fn candidate_kinds(&self, credential: &Credential) -> Vec<CredentialKind> {
        match credential.shape() {
            CredentialShape::Opaque => vec![CredentialKind::OpaqueSession],
            CredentialShape::Signed => {
                let mut kinds = Vec::with_capacity(2);
                if let Ok(token) = UnverifiedToken::peek(credential.raw())
                    && self.oidc.is_plausible(&token)
                {
                    kinds.push(CredentialKind::ExternalOidc);
                }
                if self.local.is_some() {
                    kinds.push(CredentialKind::LocalSigned);
                }
                kinds
            }
        }
    }

    /// Verify `credential` as exactly `kind`.
    pub async fn verify_as(
        &self,
        kind: CredentialKind,
        credential: &Credential,
    ) -> Result<Claims, VerificationFailure> {
        let token = UnverifiedToken::peek(credential.raw())?;
        let claims = match kind {
            CredentialKind::ExternalOidc => self.oidc.verify(credential.raw(), &token).await?,
            CredentialKind::LocalSigned => self
                .local
                .as_ref()
                .ok_or(VerificationFailure::Unrecognized)?
                .verify(credential.raw(), &token)?,
            CredentialKind::OpaqueSession => return Err(VerificationFailure::Unrecognized),
        };

        if let Some(jti) = &claims.token_id
            && self.revocations.is_revoked(jti).await
        {
            return Err(VerificationFailure::Revoked);
        }

        Ok(claims)
    }

    /// Verify a signed credential, trying each applicable verifier in
    /// priority order. Returns the first acceptance, or the most specific
    /// rejection.
    pub async fn verify(&self, credential: &Credential) -> Result<Claims, VerificationFailure> {
        let mut failure = VerificationFailure::Unrecognized;
        for kind in self.candidate_kinds(credential) {
            if kind == CredentialKind::OpaqueSession {
                continue;
            }
            match self.verify_as(kind, credential).await {
                Ok(claims) => return Ok(claims),
                Err(e) => failure = failure.most_specific(e),
            }
        }
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(value: &Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn peek_reads_header_and_issuer() {
        let raw = format!(
            "{}.{}.sig",
            segment(&serde_json::json!({"alg": "ES256", "kid": "k1"})),
            segment(&serde_json::json!({"iss": "https://idp.example.com"}))
        );

        let token = UnverifiedToken::peek(&raw).unwrap();

        assert_eq!(token.alg, "ES256");
        assert_eq!(token.kid.as_deref(), Some("k1"));
        assert_eq!(token.iss.as_deref(), Some("https://idp.example.com"));
        assert!(token.is_asymmetric());
    }

    #[test]
    fn alg_none_is_never_allowed() {
        let raw = format!(
            "{}.{}.",
            segment(&serde_json::json!({"alg": "none"})),
            segment(&serde_json::json!({"sub": "1"}))
        );
        let token = UnverifiedToken::peek(&raw).unwrap();

        let err = token
            .algorithm(&[Algorithm::HS256, Algorithm::ES256])
            .unwrap_err();

        assert_eq!(err, VerificationFailure::UnsupportedAlgorithm("none".to_string()));
        assert!(!token.is_asymmetric());
    }

    #[test]
    fn peek_rejects_non_json_segments() {
        assert_eq!(
            UnverifiedToken::peek("bm90IGpzb24.bm90IGpzb24.x").unwrap_err(),
            VerificationFailure::Malformed
        );
    }

    #[test]
    fn most_specific_prefers_signature_over_unrecognized() {
        let picked = VerificationFailure::Unrecognized
            .most_specific(VerificationFailure::UnsupportedAlgorithm("ES256".to_string()))
            .most_specific(VerificationFailure::Expired)
            .most_specific(VerificationFailure::Malformed);
        assert_eq!(picked, VerificationFailure::Expired);

        let outage = VerificationFailure::Revoked
            .most_specific(VerificationFailure::KeyUnavailable(KeyFetchError::Status(503)));
        assert_eq!(outage.code(), "key_unavailable");
    }

    #[test]
    fn jwt_error_kinds_map_to_failures() {
        let map = |kind: ErrorKind| VerificationFailure::from(jsonwebtoken::errors::Error::from(kind));
        assert_eq!(map(ErrorKind::InvalidSignature), VerificationFailure::BadSignature);
        assert_eq!(map(ErrorKind::ExpiredSignature), VerificationFailure::Expired);
        assert_eq!(map(ErrorKind::ImmatureSignature), VerificationFailure::NotYetValid);
        assert_eq!(map(ErrorKind::InvalidToken), VerificationFailure::Malformed);
    }

    #[test]
    fn into_claims_checks_issuer_audience_and_iat() {
        let raw = |value: Value| serde_json::from_value::<RawClaims>(value).unwrap();
        let audiences = vec!["api".to_string()];
        let expected = Expected {
            kind: CredentialKind::LocalSigned,
            provider: "local",
            issuer: "verigate",
            audiences: &audiences,
            skew: Duration::from_secs(10),
        };
        let exp = Utc::now().timestamp() + 60;

        let ok = raw(serde_json::json!({"iss": "verigate", "aud": ["x", "api"], "sub": "7", "exp": exp, "role": "admin"}))
            .into_claims(&expected)
            .unwrap();
        assert_eq!(ok.subject, "7");
        assert_eq!(ok.custom.get("role"), Some(&serde_json::json!("admin")));

        let wrong_iss = raw(serde_json::json!({"iss": "evil", "aud": "api", "sub": "7", "exp": exp}));
        assert_eq!(
            wrong_iss.into_claims(&expected).unwrap_err(),
            VerificationFailure::UnknownIssuer("evil".to_string())
        );

        let wrong_aud = raw(serde_json::json!({"iss": "verigate", "aud": "other", "sub": "7", "exp": exp}));
        assert_eq!(wrong_aud.into_claims(&expected).unwrap_err(), VerificationFailure::InvalidAudience);

        let future = raw(serde_json::json!({
            "iss": "verigate", "aud": "api", "sub": "7", "exp": exp,
            "iat": Utc::now().timestamp() + 300
        }));
        assert_eq!(future.into_claims(&expected).unwrap_err(), VerificationFailure::IssuedInFuture);

        let no_sub = raw(serde_json::json!({"iss": "verigate", "aud": "api", "exp": exp}));
        assert_eq!(no_sub.into_claims(&expected).unwrap_err(), VerificationFailure::MissingSubject);
    }
}
