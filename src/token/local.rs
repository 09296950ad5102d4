//! Tokens this service signs with its own shared secret.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;
use uuid::Uuid;

use super::{Claims, Expected, RawClaims, UnverifiedToken, VerificationFailure, validation};
use crate::config::{LocalTokenConfig, parse_algorithm};
use crate::credential::CredentialKind;
use crate::identity::{LOCAL_PROVIDER, PrincipalId};
use crate::{Error, Result};

fn algorithms(config: &LocalTokenConfig) -> Result<Vec<Algorithm>> {
    let algorithms = config
        .algorithms
        .iter()
        .map(|name| parse_algorithm(name))
        .collect::<Result<Vec<_>>>()?;

    if let Some(alg) = algorithms
        .iter()
        .find(|alg| !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
    {
        return Err(Error::Config(format!(
            "local tokens use a shared secret, {alg:?} is not an HMAC algorithm"
        )));
    }
    if algorithms.is_empty() {
        return Err(Error::Config("local.algorithms is empty".to_string()));
    }
    Ok(algorithms)
}

/// Verifies HMAC-signed local tokens.
pub struct LocalTokenVerifier {
    issuer: String,
    audience: Vec<String>,
    algorithms: Vec<Algorithm>,
    key: DecodingKey,
    skew: Duration,
}

impl LocalTokenVerifier {
    /// Build from config. Returns `None` when no secret is configured.
    pub fn from_config(config: &LocalTokenConfig, skew: Duration) -> Result<Option<Self>> {
        let Some(secret) = config.resolve_secret() else {
            return Ok(None);
        };

        Ok(Some(Self {
            issuer: config.issuer.clone(),
            audience: vec![config.audience.clone()],
            algorithms: algorithms(config)?,
            key: DecodingKey::from_secret(secret.as_bytes()),
            skew,
        }))
    }

    /// Verify `raw`, whose header has already been peeked into `token`.
    pub fn verify(&self, raw: &str, token: &UnverifiedToken) -> std::result::Result<Claims, VerificationFailure> {
        let alg = token.algorithm(&self.algorithms)?;
        let data = jsonwebtoken::decode::<RawClaims>(raw, &self.key, &validation(alg, self.skew))?;

        data.claims.into_claims(&Expected {
            kind: CredentialKind::LocalSigned,
            provider: LOCAL_PROVIDER,
            issuer: &self.issuer,
            audiences: &self.audience,
            skew: self.skew,
        })
    }
}

/// A freshly minted local token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// Encoded token
    pub token: String,
    /// Token id, for later revocation
    pub jti: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct IssueClaims<'a> {
    iss: &'a str,
    sub: String,
    aud: &'a str,
    iat: i64,
    nbf: i64,
    exp: i64,
    jti: &'a str,
}

/// Mints local tokens. Tokens carry identity only, never a role.
pub struct LocalTokenIssuer {
    issuer: String,
    audience: String,
    algorithm: Algorithm,
    key: EncodingKey,
    default_ttl: Duration,
}

impl LocalTokenIssuer {
    /// Build from config, signing with the first allowed algorithm.
    pub fn from_config(config: &LocalTokenConfig) -> Result<Self> {
        let secret = config
            .resolve_secret()
            .ok_or_else(|| Error::Config("local.secret is not set".to_string()))?;
        let algorithm = algorithms(config)?[0];

        Ok(Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            algorithm,
            key: EncodingKey::from_secret(secret.as_bytes()),
            default_ttl: config.token_ttl,
        })
    }

    /// Issue a token for `principal_id`, valid for `ttl` (or the configured
    /// default).
    pub fn issue(&self, principal_id: PrincipalId, ttl: Option<Duration>) -> Result<IssuedToken> {
        let ttl = chrono::Duration::from_std(ttl.unwrap_or(self.default_ttl))
            .map_err(|e| Error::Config(format!("token ttl out of range: {e}")))?;
        let now = Utc::now();
        let expires_at = now + ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = IssueClaims {
            iss: &self.issuer,
            sub: principal_id.to_string(),
            aud: &self.audience,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: &jti,
        };
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.key)?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }
}
