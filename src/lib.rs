//! Snitcher proxy core
//!
//! An in-process HTTPS interception proxy: it terminates client TCP
//! connections, proxies plain HTTP/1.1, implements `CONNECT` tunneling, and
//! (when interception is enabled) terminates TLS with per-host certificates
//! minted by a local root CA, re-encrypts toward the origin, and records
//! every request/response exchange as a flow.
//!
//! Embedders construct a [`ProxyServer`] from its collaborators and consume
//! flows through [`ProxyServer::flow_events`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use snitcher_proxy::{
//!     CaStorage, CertificateAuthority, FlowStore, FsCaStorage, InterceptorPipeline,
//!     NativeTrustStore, ProxyOptions, ProxyServer, TracingLogger,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let options = ProxyOptions::default();
//! let storage: Arc<dyn CaStorage> = Arc::new(FsCaStorage::new(&options.tls.state_dir));
//! let ca = Arc::new(CertificateAuthority::new(storage, Arc::new(NativeTrustStore)));
//! ca.get_or_create_root("change-me").await?;
//!
//! let flows = Arc::new(FlowStore::new(4096, 256));
//! let server = ProxyServer::new(
//!     options,
//!     ca,
//!     flows,
//!     InterceptorPipeline::new(),
//!     Arc::new(TracingLogger),
//! )?;
//! server.start().await?;
//!
//! let mut events = server.flow_events();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod ca_container;
pub mod certificate_authority;
mod connection;
pub mod error;
pub mod flow;
pub mod flow_store;
pub mod http_codec;
pub mod http_message;
pub mod interceptor;
pub mod logger;
pub mod proxy_config;
pub mod proxy_server;
pub mod trust_store;

// Re-export commonly used types
pub use ca_container::{CaStorage, FsCaStorage, MemoryCaStorage};
pub use certificate_authority::{CertificateAuthority, LeafIdentity, CA_COMMON_NAME};
pub use error::{CaError, HttpError, ProxyError};
pub use flow::{FailureKind, Flow, FlowContext, FlowStatus};
pub use flow_store::{FlowEvent, FlowStore, FlowSubscription};
pub use http_message::{Header, Headers, HttpRequest, HttpResponse, RequestTarget, Scheme, Url};
pub use interceptor::{InterceptorPipeline, RequestInterceptor, ResponseInterceptor};
pub use logger::{NullLogger, ProxyLogger, TracingLogger};
pub use proxy_config::{ProxyOptions, TlsOptions};
pub use proxy_server::ProxyServer;
pub use trust_store::{MemoryTrustStore, NativeTrustStore, TrustStore};
