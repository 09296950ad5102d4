//! axum adapter for [`Authenticator`]
//!
//! Builds a [`RequestContext`] from the request, runs `authenticate()` with
//! the route's [`AuthOptions`], and either inserts the [`AuthResult`](super::AuthResult) into the
//! request extensions or answers with the failure.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AuthOptions, Authenticator, FailureReason};
use crate::credential::RequestContext;

/// Seconds a client should wait before retrying a 503.
const RETRY_AFTER_SECS: &str = "5";

/// Per-route middleware state.
#[derive(Clone)]
pub struct AuthLayerState {
    authenticator: Arc<Authenticator>,
    options: Arc<AuthOptions>,
}

impl AuthLayerState {
    /// Authenticate with `options` on every request.
    #[must_use]
    pub fn new(authenticator: Arc<Authenticator>, options: AuthOptions) -> Self {
        Self {
            authenticator,
            options: Arc::new(options),
        }
    }
}

/// Build the core's view of an HTTP request. The client address is only
/// known when the server was started with connect info.
#[must_use]
pub fn request_context(request: &Request<Body>) -> RequestContext {
    RequestContext {
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        client_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AuthLayerState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = request_context(&request);
    let result = state.authenticator.authenticate(&ctx, &state.options).await;

    if let Some(reason) = result.failure_reason() {
        warn!(
            path = %ctx.path,
            correlation_id = %result.correlation_id(),
            reason = reason.code(),
            "Request rejected"
        );
        return failure_response(reason, result.correlation_id());
    }

    debug!(
        path = %ctx.path,
        method = %result.method(),
        principal_id = ?result.principal().map(|p| p.id),
        "Authenticated request"
    );
    request.extensions_mut().insert(result);
    next.run(request).await
}

/// The caller-facing response for a failed decision. Carries only public
/// codes and messages.
#[must_use]
pub fn failure_response(reason: &FailureReason, correlation_id: Uuid) -> Response {
    let status = reason.status_code();
    let mut response = (
        status,
        Json(json!({
            "error": {
                "code": reason.public_code(),
                "message": reason.public_message(),
                "correlation_id": correlation_id.to_string()
            }
        })),
    )
        .into_response();

    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    if reason.is_retryable() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{KeyFetchError, VerificationFailure};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_carries_challenge_and_public_message() {
        // GIVEN: a credential rejection with an internal cause
        let reason = FailureReason::InvalidCredential(VerificationFailure::BadSignature);
        let id = Uuid::new_v4();

        // WHEN: render it
        let response = failure_response(&reason, id);

        // THEN: 401 with a challenge, and the cause stays internal
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "invalid_credential");
        assert_eq!(body["error"]["message"], "invalid or expired credential");
        assert_eq!(body["error"]["correlation_id"], id.to_string());
    }

    #[tokio::test]
    async fn outage_is_retryable_503() {
        let reason = FailureReason::KeyFetch(KeyFetchError::Timeout(std::time::Duration::from_secs(5)));

        let response = failure_response(&reason, Uuid::new_v4());

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], RETRY_AFTER_SECS);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn request_context_reads_path_headers_and_peer() {
        let mut request = Request::builder()
            .uri("/v1/me?verbose=1")
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 40000))));

        let ctx = request_context(&request);

        assert_eq!(ctx.path, "/v1/me");
        assert_eq!(ctx.user_agent().as_deref(), Some("test-agent"));
        assert_eq!(ctx.client_addr, Some("192.0.2.4".parse().unwrap()));
    }
}
