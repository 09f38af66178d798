//! Error types for the proxy core.
//!
//! Errors are grouped the way they are recovered: codec errors and CA errors
//! have their own enums because their callers handle them locally, and
//! everything rolls up into [`ProxyError`] at the connection boundary.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors produced by the HTTP/1.1 codec.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request line: {0}")]
    BadRequestLine(String),

    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("message body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("unexpected end of stream inside an HTTP message")]
    UnexpectedEof,

    #[error("invalid chunked encoding: {0}")]
    InvalidChunk(String),

    /// Socket-level failure while feeding the parser. Mapped to a transport
    /// error at the connection boundary.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the certificate authority and its ports.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate storage I/O failed: {0}")]
    Io(String),

    #[error("certificate operation failed: {0}")]
    Crypto(String),

    #[error("wrong password for the CA container")]
    BadPassword,

    #[error("root CA is not initialized")]
    NotInitialized,

    #[error("trust store operation failed: {0}")]
    TrustStore(String),

    #[error("no OS trust store is available on this platform")]
    TrustStoreUnsupported,
}

impl CaError {
    pub(crate) fn io(err: impl std::fmt::Display) -> Self {
        CaError::Io(err.to_string())
    }

    pub(crate) fn crypto(err: impl std::fmt::Display) -> Self {
        CaError::Crypto(err.to_string())
    }
}

/// Top-level error type of the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("connecting to {authority} failed: {source}")]
    TcpConnect {
        authority: String,
        source: io::Error,
    },

    #[error("socket read failed: {0}")]
    TcpRead(io::Error),

    #[error("socket write failed: {0}")]
    TcpWrite(io::Error),

    #[error("timed out waiting for the peer")]
    TcpTimeout,

    #[error("TLS handshake with the client failed: {0}")]
    TlsHandshakeClient(io::Error),

    #[error("TLS handshake with the origin failed: {0}")]
    TlsHandshakeOrigin(io::Error),

    #[error("origin certificate verification failed: {0}")]
    TlsVerifyOrigin(String),

    #[error("connection cancelled by shutdown")]
    Cancelled,

    #[error("proxy server is already running")]
    AlreadyRunning,

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    /// Classify an error returned by the origin-side TLS connector.
    ///
    /// tokio-rustls surfaces rustls failures as `io::Error`s wrapping a
    /// [`rustls::Error`]; certificate verification failures are pulled out so
    /// flows can record them distinctly from plain handshake failures.
    pub(crate) fn from_origin_tls(err: io::Error) -> Self {
        if let Some(inner) = err.get_ref() {
            if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
                if matches!(tls, rustls::Error::InvalidCertificate(_)) {
                    return ProxyError::TlsVerifyOrigin(tls.to_string());
                }
            }
        }
        ProxyError::TlsHandshakeOrigin(err)
    }

    /// Lift a codec error into the transport category when it was really a
    /// socket failure.
    pub(crate) fn from_codec(err: HttpError) -> Self {
        match err {
            HttpError::Io(io) => ProxyError::TcpRead(io),
            other => ProxyError::Http(other),
        }
    }
}
