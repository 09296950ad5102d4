//! Verigate Library
//!
//! Identity and access-control core: decides who a caller is and whether
//! they may act.
//!
//! # Components
//!
//! - **Credentials**: bearer tokens, session cookies and session headers
//! - **Tokens**: locally signed (HMAC) and external OIDC (JWKS) verification
//! - **Key ring**: cached, rate-limited, coalesced provider key fetches
//! - **Identity**: claims to principal resolution with first-login provisioning
//! - **Sessions**: opaque server-side handles with bulk revocation
//! - **Permissions**: cached role and permission evaluation
//! - **Audit**: one record per authentication decision
//!
//! [`authn::Authenticator::authenticate`] ties them together and never
//! returns an error: every outcome is an [`authn::AuthResult`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authn;
pub mod cli;
pub mod config;
pub mod credential;
pub mod error;
pub mod flight;
pub mod identity;
pub mod permission;
pub mod server;
pub mod session;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
