//! Configuration management

use std::{collections::BTreeMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before secrets are resolved.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Locally signed token configuration
    pub local: LocalTokenConfig,
    /// External OIDC providers
    pub providers: Vec<ProviderConfig>,
    /// Signing key cache for external providers
    pub key_ring: KeyRingConfig,
    /// Token verification tolerances
    pub verifier: VerifierConfig,
    /// Session store configuration
    pub sessions: SessionConfig,
    /// Permission engine configuration
    pub permissions: PermissionConfig,
    /// Principal store configuration
    pub store: StoreConfig,
    /// Audit sink configuration
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (VERIGATE_ prefix)
        figment = figment.merge(Env::prefixed("VERIGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before secrets are expanded
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in provider URLs.
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for provider in &mut self.providers {
            provider.issuer = Self::expand_string(&re, &provider.issuer);
            if let Some(uri) = provider.jwks_uri.as_mut() {
                *uri = Self::expand_string(&re, uri);
            }
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Validate cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        for alg in &self.local.algorithms {
            let parsed = parse_algorithm(alg)?;
            if !matches!(parsed, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                return Err(Error::Config(format!(
                    "local.algorithms: {alg} is not a shared-secret algorithm"
                )));
            }
        }

        for provider in &self.providers {
            if provider.issuer.is_empty() {
                return Err(Error::Config(format!(
                    "providers.{}: issuer is required",
                    provider.name
                )));
            }
            for alg in &provider.algorithms {
                let parsed = parse_algorithm(alg)?;
                if matches!(parsed, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    return Err(Error::Config(format!(
                        "providers.{}: symmetric algorithm {alg} is not allowed for external tokens",
                        provider.name
                    )));
                }
            }
        }

        if self.key_ring.max_fetches == 0 {
            return Err(Error::Config("key_ring.max_fetches must be at least 1".to_string()));
        }

        if !self.permissions.roles.contains_key(&self.permissions.default_role) {
            return Err(Error::Config(format!(
                "permissions.default_role '{}' is not in permissions.roles",
                self.permissions.default_role
            )));
        }

        Ok(())
    }
}

/// Parse an algorithm name from configuration.
///
/// `none` is not an [`Algorithm`] variant, so it is rejected here along with
/// any other unknown name.
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown names.
pub fn parse_algorithm(name: &str) -> Result<Algorithm> {
    name.parse::<Algorithm>()
        .map_err(|_| Error::Config(format!("Unsupported algorithm: {name}")))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Locally signed token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTokenConfig {
    /// Expected (and issued) `iss` claim
    pub issuer: String,
    /// Expected (and issued) `aud` claim
    pub audience: String,
    /// Shared secret. Supports a literal value or `env:VAR_NAME`.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Allowed algorithms
    pub algorithms: Vec<String>,
    /// Lifetime of issued tokens
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for LocalTokenConfig {
    fn default() -> Self {
        Self {
            issuer: "verigate".to_string(),
            audience: "verigate-api".to_string(),
            secret: None,
            algorithms: vec!["HS256".to_string()],
            token_ttl: Duration::from_secs(3600),
        }
    }
}

impl LocalTokenConfig {
    /// Resolve the shared secret (expand `env:` references).
    ///
    /// Returns `None` when no secret is configured or the resolved value is
    /// empty, which disables local token verification.
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        let raw = self.secret.as_ref()?;
        let value = if let Some(var_name) = raw.strip_prefix("env:") {
            env::var(var_name).ok()?
        } else {
            raw.clone()
        };
        (!value.is_empty()).then_some(value)
    }
}

/// External OIDC provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Short provider name recorded on identity links (e.g. `"google"`)
    pub name: String,
    /// Exact issuer URL expected in the `iss` claim
    pub issuer: String,
    /// JWKS URI (defaults to `{issuer}/.well-known/jwks.json`)
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Accepted audiences (empty disables the audience check)
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Allowed algorithms
    #[serde(default = "default_provider_algorithms")]
    pub algorithms: Vec<String>,
}

impl ProviderConfig {
    /// Effective JWKS URI.
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&self.issuer))
    }
}

fn default_provider_algorithms() -> Vec<String> {
    vec!["RS256".to_string(), "ES256".to_string()]
}

/// Derive the default JWKS URI from the issuer URL using OIDC discovery conventions.
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

/// Signing key cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRingConfig {
    /// How long a fetched key set is served before it is refetched
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long an unknown key id is remembered as absent
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
    /// Maximum fetches per `fetch_window`
    pub max_fetches: u32,
    /// Window for `max_fetches`
    #[serde(with = "humantime_serde")]
    pub fetch_window: Duration,
    /// Bound on a single key set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for KeyRingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_secs(30),
            max_fetches: 10,
            fetch_window: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Token verification tolerances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Clock skew tolerance for `exp`, `nbf` and `iat`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            clock_skew: Duration::from_secs(10),
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Background reaper interval
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Cookie carrying the session handle
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8 * 3600),
            reap_interval: Duration::from_secs(60),
            cookie_name: "verigate_session".to_string(),
        }
    }
}

/// Permission engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Cache TTL for computed permission sets
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Role assigned to newly provisioned principals
    pub default_role: String,
    /// Role name to hierarchical level
    pub roles: BTreeMap<String, u32>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        let roles = [
            ("guest", 0),
            ("user", 10),
            ("verifier", 20),
            ("manager", 50),
            ("admin", 90),
            ("superadmin", 100),
        ]
        .into_iter()
        .map(|(name, level)| (name.to_string(), level))
        .collect();

        Self {
            ttl: Duration::from_secs(300),
            default_role: "user".to_string(),
            roles,
        }
    }
}

/// Principal store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bound on every store call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

/// Audit sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record format for the tracing sink (`json` or `text`)
    pub format: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Parse `"30s"`, `"5m"`, `"1h"`, `"100ms"` or bare seconds.
///
/// # Errors
///
/// Returns a message when the number part does not parse.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    // "ms" must be checked before "s" and "m"
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().map(Duration::from_secs)
    };
    parsed.map_err(|e| format!("invalid duration '{s}': {e}"))
}
