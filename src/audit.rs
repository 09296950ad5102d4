//! Audit trail for authentication decisions.
//!
//! Every decision produces exactly one [`AuditEvent`], appended to an
//! [`AuditSink`]. The default sink writes each event as structured log
//! output on the `verigate::audit` target, making the trail queryable by
//! any log aggregator:
//!
//! ```text
//! INFO verigate::audit audit={"event":"failure","outcome":"expired",...}
//! ```
//!
//! | Event | When |
//! |-------|------|
//! | `success` | A credential was accepted and every requirement met |
//! | `failure` | No acceptable credential, or the account is disabled |
//! | `denied` | A valid principal lacks the required role or permission |
//! | `error` | A dependency or internal fault prevented a decision |

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::authn::AuthMethod;
use crate::credential::{CredentialKind, RequestContext};
use crate::identity::PrincipalId;

/// Kind of decision recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Authenticated and authorized
    Success,
    /// Not authenticated
    Failure,
    /// Authenticated, not authorized
    Denied,
    /// No decision could be reached
    Error,
}

/// One record per authentication decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Decision kind
    pub event: AuditEventKind,
    /// Ties the record to the caller-visible result
    pub correlation_id: Uuid,
    /// Resolved principal, when resolution got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<PrincipalId>,
    /// Kind of the credential presented
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_kind: Option<CredentialKind>,
    /// Authentication method of the result
    pub method: AuthMethod,
    /// Client network address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Client user agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Resource path requested
    pub resource: String,
    /// `granted`, or the internal failure code
    pub outcome: String,
    /// Operator-facing detail (required vs actual role, store error text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Start an event for a request.
    #[must_use]
    pub fn new(event: AuditEventKind, correlation_id: Uuid, ctx: &RequestContext) -> Self {
        Self {
            event,
            correlation_id,
            principal_id: None,
            credential_kind: None,
            method: AuthMethod::Anonymous,
            client_ip: ctx.client_addr,
            user_agent: ctx.user_agent(),
            resource: ctx.path.clone(),
            outcome: String::new(),
            detail: None,
            timestamp: Utc::now(),
        }
    }
}

/// Audit sink failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// The event could not be serialized.
    #[error("failed to serialize audit event: {0}")]
    Serialize(String),

    /// The sink refused the write.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-only destination for audit events.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Append one event.
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Output format of [`TracingAuditSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditFormat {
    /// One JSON blob in the `audit` field
    Json,
    /// Individual structured fields
    Fields,
}

impl AuditFormat {
    /// Parse the configured format name. Anything but `json` selects fields.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Fields
        }
    }
}

/// Writes events through `tracing` on the `verigate::audit` target.
#[derive(Debug, Clone, Copy)]
pub struct TracingAuditSink {
    format: AuditFormat,
}

impl TracingAuditSink {
    /// Create a sink with the given format.
    #[must_use]
    pub fn new(format: AuditFormat) -> Self {
        Self { format }
    }
}

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        match self.format {
            AuditFormat::Json => {
                let json = serde_json::to_string(&event).map_err(|e| AuditError::Serialize(e.to_string()))?;
                tracing::info!(target: "verigate::audit", audit = %json, "verigate audit");
            }
            AuditFormat::Fields => {
                tracing::info!(
                    target: "verigate::audit",
                    event = ?event.event,
                    correlation_id = %event.correlation_id,
                    principal_id = ?event.principal_id,
                    credential_kind = ?event.credential_kind,
                    method = %event.method,
                    client_ip = ?event.client_ip,
                    resource = %event.resource,
                    outcome = %event.outcome,
                    detail = ?event.detail,
                    "verigate audit"
                );
            }
        }
        Ok(())
    }
}

/// Keeps events in memory. Used by tests and embedders that forward
/// events elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every append fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory sink set to fail".to_string()));
        }
        self.events.lock().push(event);
        Ok(())
    }
}
