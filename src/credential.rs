//! Raw credentials and the request context they are extracted from.

use std::fmt;
use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use serde::{Deserialize, Serialize};

/// Header carrying an opaque session handle for clients that cannot use cookies.
pub const SESSION_HEADER: &str = "x-session-token";

/// The closed set of credential formats this core accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// HS-signed token minted by this service
    LocalSigned,
    /// Token minted by an external identity provider, verified against its JWKS
    ExternalOidc,
    /// Opaque session handle, validated against the session store
    OpaqueSession,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalSigned => "local_signed",
            Self::ExternalOidc => "external_oidc",
            Self::OpaqueSession => "opaque_session",
        })
    }
}

/// Structural family of a raw credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialShape {
    /// `header.payload.signature`
    Signed,
    /// Anything else
    Opaque,
}

/// Where in the request the credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// `Authorization: Bearer ...`
    Authorization,
    /// Session cookie
    Cookie,
    /// `X-Session-Token` header
    SessionHeader,
}

/// A raw bearer value presented by a caller. Never persisted, never logged.
#[derive(Clone)]
pub struct Credential {
    raw: String,
    source: CredentialSource,
}

impl Credential {
    /// Wrap a raw value.
    #[must_use]
    pub fn new(raw: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            raw: raw.into(),
            source,
        }
    }

    /// The raw credential string.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Where the credential came from.
    #[must_use]
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Detect the structural family.
    ///
    /// Three dot-separated segments whose header and payload are non-empty
    /// base64url are treated as a signed token. The signature segment may be
    /// empty so that unsigned (`alg: none`) tokens reach the algorithm check
    /// and are rejected there rather than looked up as sessions.
    #[must_use]
    pub fn shape(&self) -> CredentialShape {
        let mut parts = self.raw.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return CredentialShape::Opaque;
        };

        let is_b64url = |s: &str| {
            s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        };

        if !header.is_empty()
            && !payload.is_empty()
            && is_b64url(header)
            && is_b64url(payload)
            && is_b64url(signature)
        {
            CredentialShape::Signed
        } else {
            CredentialShape::Opaque
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("shape", &self.shape())
            .field("len", &self.raw.len())
            .finish_non_exhaustive()
    }
}

/// Everything the core needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Resource path being accessed
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Client network address
    pub client_addr: Option<IpAddr>,
}

impl RequestContext {
    /// Create a context for `path` with no headers.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HeaderMap::new(),
            client_addr: None,
        }
    }

    /// Add a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Add `Authorization: Bearer <token>`.
    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", &format!("Bearer {token}"))
    }

    /// Set the client address.
    #[must_use]
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// The `User-Agent` header, if present and valid UTF-8.
    #[must_use]
    pub fn user_agent(&self) -> Option<String> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Extract the credential, in priority order: bearer header, session
    /// cookie, session header. Empty values count as absent.
    #[must_use]
    pub fn credential(&self, cookie_name: &str) -> Option<Credential> {
        if let Some(token) = self.bearer_token() {
            return Some(Credential::new(token, CredentialSource::Authorization));
        }

        if let Some(value) = self.cookie(cookie_name) {
            return Some(Credential::new(value, CredentialSource::Cookie));
        }

        self.headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Credential::new(v, CredentialSource::SessionHeader))
    }

    fn bearer_token(&self) -> Option<&str> {
        let value = self.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, v)| *k == name && !v.is_empty())
            .map(|(_, v)| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOKIE: &str = "verigate_session";

    #[test]
    fn bearer_wins_over_cookie() {
        let ctx = RequestContext::new("/v1/me")
            .with_header("cookie", "verigate_session=vgs_abc")
            .with_bearer("a.b.c");

        let credential = ctx.credential(COOKIE).unwrap();
        assert_eq!(credential.raw(), "a.b.c");
        assert_eq!(credential.source(), CredentialSource::Authorization);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let ctx = RequestContext::new("/").with_header("authorization", "bearer tok");
        assert_eq!(ctx.credential(COOKIE).unwrap().raw(), "tok");
    }

    #[test]
    fn non_bearer_scheme_is_ignored() {
        let ctx = RequestContext::new("/").with_header("authorization", "Basic dXNlcjpwdw==");
        assert!(ctx.credential(COOKIE).is_none());
    }

    #[test]
    fn empty_bearer_counts_as_absent() {
        let ctx = RequestContext::new("/").with_header("authorization", "Bearer   ");
        assert!(ctx.credential(COOKIE).is_none());
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let ctx = RequestContext::new("/")
            .with_header("cookie", "theme=dark; verigate_session=vgs_xyz; lang=en");

        let credential = ctx.credential(COOKIE).unwrap();
        assert_eq!(credential.raw(), "vgs_xyz");
        assert_eq!(credential.source(), CredentialSource::Cookie);
    }

    #[test]
    fn session_header_is_last_resort() {
        let ctx = RequestContext::new("/").with_header(SESSION_HEADER, "vgs_hdr");
        let credential = ctx.credential(COOKIE).unwrap();
        assert_eq!(credential.source(), CredentialSource::SessionHeader);
    }

    #[test]
    fn shape_detection() {
        let signed = Credential::new("eyJh.eyJz.c2ln", CredentialSource::Authorization);
        assert_eq!(signed.shape(), CredentialShape::Signed);

        let unsigned = Credential::new("eyJh.eyJz.", CredentialSource::Authorization);
        assert_eq!(unsigned.shape(), CredentialShape::Signed);

        let session = Credential::new("vgs_AbC-123", CredentialSource::Cookie);
        assert_eq!(session.shape(), CredentialShape::Opaque);

        let four = Credential::new("a.b.c.d", CredentialSource::Authorization);
        assert_eq!(four.shape(), CredentialShape::Opaque);

        let junk = Credential::new("a b.c.d", CredentialSource::Authorization);
        assert_eq!(junk.shape(), CredentialShape::Opaque);
    }

    #[test]
    fn debug_does_not_leak_raw_value() {
        let credential = Credential::new("super-secret-token", CredentialSource::Authorization);
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret-token"));
    }
}
