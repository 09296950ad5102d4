//! HTTP server
//!
//! Every route sits behind [`auth_middleware`] with its own [`AuthOptions`]:
//!
//! | Route | Requirement |
//! |-------|-------------|
//! | `GET /health` | optional, anonymous calls not audited |
//! | `GET /v1/me` | authenticated |
//! | `POST /v1/sessions` | signed token, issues a session |
//! | `DELETE /v1/sessions/current` | session |
//! | `DELETE /v1/admin/principals/{id}/sessions` | admin |
//! | `POST /v1/admin/principals/{id}/permissions/invalidate` | admin |
//! | `DELETE /v1/admin/tokens/{jti}` | admin |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditFormat, AuditSink, TracingAuditSink};
use crate::authn::middleware::{AuthLayerState, auth_middleware, failure_response};
use crate::authn::{AuthMethod, AuthOptions, AuthResult, Authenticator, FailureReason};
use crate::config::Config;
use crate::credential::RequestContext;
use crate::identity::{InMemoryPrincipalStore, PrincipalId, PrincipalStore};
use crate::permission::PermissionEngine;
use crate::session::{InMemorySessionStore, SessionStore, spawn_reaper};
use crate::token::keyring::HttpKeySetSource;
use crate::token::{InMemoryRevocationList, KeySetSource, RevocationList};
use crate::{Error, Result};

/// Roles allowed on the admin routes.
pub const ADMIN_ROLES: [&str; 2] = ["admin", "superadmin"];

/// Storage and I/O backends the server runs on.
pub struct Backends {
    /// Authoritative principal store
    pub principals: Arc<dyn PrincipalStore>,
    /// Session store
    pub sessions: Arc<dyn SessionStore>,
    /// Revoked token ids
    pub revocations: Arc<dyn RevocationList>,
    /// Audit destination
    pub audit: Arc<dyn AuditSink>,
    /// JWKS fetcher
    pub key_source: Arc<dyn KeySetSource>,
}

impl Backends {
    /// In-memory stores, tracing audit sink and an HTTPS key fetcher.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        Self {
            principals: Arc::new(InMemoryPrincipalStore::new()),
            sessions: Arc::new(InMemorySessionStore::new(config.sessions.ttl)),
            revocations: Arc::new(InMemoryRevocationList::new()),
            audit: Arc::new(TracingAuditSink::new(AuditFormat::from_name(&config.audit.format))),
            key_source: Arc::new(HttpKeySetSource::new(config.key_ring.fetch_timeout)),
        }
    }
}

/// Shared application state
pub struct AppState {
    /// The authentication core
    pub authenticator: Arc<Authenticator>,
    /// Lifetime of issued sessions, reported to clients
    pub session_ttl: Duration,
    /// How long a revoked jti is remembered when the caller gives no expiry
    pub revocation_ttl: Duration,
}

impl AppState {
    /// Build the authenticator over `backends`.
    pub fn from_config(config: &Config, backends: Backends) -> Result<Self> {
        let Backends {
            principals,
            sessions,
            revocations,
            audit,
            key_source,
        } = backends;

        let authenticator = Authenticator::from_config(config, principals, sessions, revocations, audit, key_source)?;

        Ok(Self {
            authenticator: Arc::new(authenticator),
            session_ttl: config.sessions.ttl,
            revocation_ttl: config.local.token_ttl,
        })
    }
}

fn guarded(router: Router<Arc<AppState>>, state: &AppState, options: AuthOptions) -> Router<Arc<AppState>> {
    let layer = AuthLayerState::new(Arc::clone(&state.authenticator), options);
    router.route_layer(middleware::from_fn_with_state(layer, auth_middleware))
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let health = Router::new().route("/health", get(health_handler));
    let authenticated = Router::new()
        .route("/v1/me", get(me_handler))
        .route("/v1/sessions/current", delete(logout_handler));
    let login = Router::new().route("/v1/sessions", post(login_handler));
    let admin = Router::new()
        .route("/v1/admin/principals/{id}/sessions", delete(revoke_sessions_handler))
        .route(
            "/v1/admin/principals/{id}/permissions/invalidate",
            post(invalidate_permissions_handler),
        )
        .route("/v1/admin/tokens/{jti}", delete(revoke_token_handler));

    Router::new()
        .merge(guarded(health, &state, AuthOptions::optional().skip_audit()))
        .merge(guarded(authenticated, &state, AuthOptions::required()))
        .merge(guarded(login, &state, AuthOptions::required().issue_session()))
        .merge(guarded(admin, &state, AuthOptions::required().with_roles(ADMIN_ROLES)))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(HandleErrorLayer::new(handle_timeout))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

async fn handle_timeout(err: tower::BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        error_response(StatusCode::REQUEST_TIMEOUT, "timeout", "request timed out", None)
    } else {
        warn!(error = %err, "Unhandled middleware error");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error", None)
    }
}

fn error_response(status: StatusCode, code: &str, message: &str, correlation_id: Option<Uuid>) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
                "correlation_id": correlation_id.map(|id| id.to_string())
            }
        })),
    )
        .into_response()
}

/// GET /health
async fn health_handler(Extension(result): Extension<AuthResult>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated": result.principal().is_some()
    }))
}

/// GET /v1/me
async fn me_handler(State(state): State<Arc<AppState>>, Extension(result): Extension<AuthResult>) -> Response {
    let Some(principal) = result.principal() else {
        return failure_response(&FailureReason::AuthSystemError, result.correlation_id());
    };

    match state.authenticator.permissions().effective_permissions(principal.id).await {
        Ok(effective) => Json(json!({
            "principal_id": principal.id,
            "email": principal.email,
            "handle": principal.handle,
            "role": principal.role,
            "method": result.method(),
            "level": effective.level,
            "roles": effective.roles,
            "permissions": effective.permissions,
            "correlation_id": result.correlation_id().to_string()
        }))
        .into_response(),
        Err(e) => failure_response(&FailureReason::from(e), result.correlation_id()),
    }
}

/// POST /v1/sessions
async fn login_handler(State(state): State<Arc<AppState>>, Extension(result): Extension<AuthResult>) -> Response {
    if result.method() == AuthMethod::Session {
        return error_response(
            StatusCode::BAD_REQUEST,
            "signed_token_required",
            "present a signed token to open a session",
            Some(result.correlation_id()),
        );
    }

    let Some(session_id) = result.session_id() else {
        return error_response(
            StatusCode::CONFLICT,
            "sessions_revoked",
            "sessions were revoked during login, retry",
            Some(result.correlation_id()),
        );
    };

    let cookie = format!(
        "{}={session_id}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={}",
        state.authenticator.cookie_name(),
        state.session_ttl.as_secs()
    );
    (
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "session_id": session_id,
            "principal_id": result.principal().map(|p| p.id),
            "expires_in": state.session_ttl.as_secs()
        })),
    )
        .into_response()
}

/// DELETE /v1/sessions/current
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(result): Extension<AuthResult>,
    headers: HeaderMap,
) -> Response {
    let cookie_name = state.authenticator.cookie_name();
    let ctx = RequestContext {
        headers,
        ..RequestContext::default()
    };
    let credential = ctx.credential(cookie_name);

    let (AuthMethod::Session, Some(credential)) = (result.method(), credential) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "session_required",
            "no session presented",
            Some(result.correlation_id()),
        );
    };

    match state.authenticator.sessions().revoke(credential.raw()).await {
        Ok(_) => {
            debug!(principal_id = ?result.principal().map(|p| p.id), "Session closed");
            let clear = format!("{cookie_name}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0");
            (StatusCode::NO_CONTENT, [(header::SET_COOKIE, clear)]).into_response()
        }
        Err(e) => failure_response(&FailureReason::StoreUnavailable(e.to_string()), result.correlation_id()),
    }
}

/// DELETE /v1/admin/principals/{id}/sessions
async fn revoke_sessions_handler(
    State(state): State<Arc<AppState>>,
    Extension(result): Extension<AuthResult>,
    Path(principal_id): Path<PrincipalId>,
) -> Response {
    match state.authenticator.sessions().revoke_all(principal_id).await {
        Ok(revoked) => {
            info!(
                %principal_id,
                revoked,
                actor = ?result.principal().map(|p| p.id),
                "Revoked all sessions"
            );
            Json(json!({ "principal_id": principal_id, "revoked": revoked })).into_response()
        }
        Err(e) => failure_response(&FailureReason::StoreUnavailable(e.to_string()), result.correlation_id()),
    }
}

/// POST /v1/admin/principals/{id}/permissions/invalidate
async fn invalidate_permissions_handler(
    State(state): State<Arc<AppState>>,
    Extension(result): Extension<AuthResult>,
    Path(principal_id): Path<PrincipalId>,
) -> StatusCode {
    state.authenticator.permissions().invalidate(principal_id);
    info!(
        %principal_id,
        actor = ?result.principal().map(|p| p.id),
        "Invalidated cached permissions"
    );
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct RevokeTokenQuery {
    until: Option<DateTime<Utc>>,
}

/// DELETE /v1/admin/tokens/{jti}
async fn revoke_token_handler(
    State(state): State<Arc<AppState>>,
    Extension(result): Extension<AuthResult>,
    Path(jti): Path<String>,
    Query(query): Query<RevokeTokenQuery>,
) -> Response {
    let until = match query.until {
        Some(until) => until,
        None => match chrono::Duration::from_std(state.revocation_ttl) {
            Ok(ttl) => Utc::now() + ttl,
            Err(_) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "revocation horizon out of range",
                    Some(result.correlation_id()),
                );
            }
        },
    };

    state.authenticator.verifier().revocations().revoke(&jti, until).await;
    info!(jti = %jti, %until, actor = ?result.principal().map(|p| p.id), "Revoked token");
    StatusCode::NO_CONTENT.into_response()
}

/// The verigate HTTP server
pub struct Server {
    config: Config,
    state: Arc<AppState>,
    revocations: Arc<dyn RevocationList>,
}

impl Server {
    /// Create a server over `backends`.
    pub fn new(config: Config, backends: Backends) -> Result<Self> {
        let revocations = Arc::clone(&backends.revocations);
        let state = Arc::new(AppState::from_config(&config, backends)?);
        Ok(Self {
            config,
            state,
            revocations,
        })
    }

    /// Shared state, for embedding the router elsewhere.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let reaper = spawn_reaper(
            Arc::clone(self.state.authenticator.sessions()),
            self.config.sessions.reap_interval,
            shutdown_tx.subscribe(),
        );
        let purger = spawn_maintenance(
            Arc::clone(&self.revocations),
            self.state.authenticator.permissions().clone(),
            self.config.sessions.reap_interval,
            shutdown_tx.subscribe(),
        );

        let app = create_router(Arc::clone(&self.state), self.config.server.request_timeout);
        let listener = TcpListener::bind(addr).await?;
        info!(
            %addr,
            providers = self.config.providers.len(),
            local_tokens = self.config.local.resolve_secret().is_some(),
            "verigate listening"
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        for task in [reaper, purger] {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("verigate stopped");
        Ok(())
    }
}

/// Purge expired revocations and prune the permission cache every `interval`.
fn spawn_maintenance(
    revocations: Arc<dyn RevocationList>,
    permissions: PermissionEngine,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = revocations.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "Purged expired revocations");
                    }
                    let pruned = permissions.prune();
                    if pruned > 0 {
                        debug!(pruned, "Pruned permission cache");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
