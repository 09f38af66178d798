//! Captured request/response pairs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::http_message::{HttpRequest, HttpResponse};

/// Why a flow failed. One category per recoverable error class, so
/// observers can aggregate without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    HttpProtocol,
    TcpConnectFailed,
    TcpRead,
    TcpWrite,
    Timeout,
    TlsHandshakeClient,
    TlsHandshakeOrigin,
    TlsVerifyOrigin,
    CertificateAuthority,
    Cancelled,
}

impl FailureKind {
    pub fn from_error(err: &ProxyError) -> FailureKind {
        match err {
            ProxyError::Http(_) => FailureKind::HttpProtocol,
            ProxyError::Ca(_) => FailureKind::CertificateAuthority,
            ProxyError::TcpConnect { .. } => FailureKind::TcpConnectFailed,
            ProxyError::TcpRead(_) => FailureKind::TcpRead,
            ProxyError::TcpWrite(_) => FailureKind::TcpWrite,
            ProxyError::TcpTimeout => FailureKind::Timeout,
            ProxyError::TlsHandshakeClient(_) => FailureKind::TlsHandshakeClient,
            ProxyError::TlsHandshakeOrigin(_) => FailureKind::TlsHandshakeOrigin,
            ProxyError::TlsVerifyOrigin(_) => FailureKind::TlsVerifyOrigin,
            ProxyError::Cancelled => FailureKind::Cancelled,
            // Server lifecycle errors never reach a flow; classify them as
            // transport if they somehow do.
            ProxyError::AlreadyRunning | ProxyError::Bind { .. } | ProxyError::Config(_) => {
                FailureKind::TcpRead
            }
        }
    }
}

/// Flow lifecycle state. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Completed,
    Failed { kind: FailureKind },
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Pending)
    }
}

/// Metadata handed to interceptors alongside the message they may mutate.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub id: Uuid,
    pub client_addr: String,
    pub started_at: DateTime<Utc>,
}

impl FlowContext {
    pub fn new(client_addr: String) -> FlowContext {
        FlowContext {
            id: Uuid::new_v4(),
            client_addr,
            started_at: Utc::now(),
        }
    }
}

fn serialize_duration_ms<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_millis() as u64)
}

/// One captured request/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub id: Uuid,
    pub client_addr: String,
    pub started_at: DateTime<Utc>,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    #[serde(serialize_with = "serialize_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub status: FlowStatus,
}

impl Flow {
    /// A completed exchange.
    pub fn completed(
        ctx: &FlowContext,
        request: HttpRequest,
        response: HttpResponse,
        duration: Duration,
    ) -> Flow {
        Flow {
            id: ctx.id,
            client_addr: ctx.client_addr.clone(),
            started_at: ctx.started_at,
            request,
            response: Some(response),
            duration,
            status: FlowStatus::Completed,
        }
    }

    /// A failed exchange. `response` is whatever was synthesized for the
    /// client, if anything.
    pub fn failed(
        ctx: &FlowContext,
        request: HttpRequest,
        response: Option<HttpResponse>,
        duration: Duration,
        kind: FailureKind,
    ) -> Flow {
        Flow {
            id: ctx.id,
            client_addr: ctx.client_addr.clone(),
            started_at: ctx.started_at,
            request,
            response,
            duration,
            status: FlowStatus::Failed { kind },
        }
    }
}
