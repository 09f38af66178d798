//! Common test utilities and helpers

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use snitcher_proxy::certificate_authority::CertificateAuthority;
use snitcher_proxy::http_codec::MessageStream;
use snitcher_proxy::http_message::HttpRequest;
use snitcher_proxy::{
    CaStorage, Flow, FlowStore, InterceptorPipeline, MemoryCaStorage, MemoryTrustStore,
    ProxyLogger, ProxyOptions, ProxyServer,
};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub const TEST_CA_PASSWORD: &str = "test-ca-password";

/// Logger that records everything for assertions.
#[derive(Default)]
pub struct CollectingLogger {
    pub infos: Mutex<Vec<String>>,
    pub warns: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
    pub flows: Mutex<Vec<String>>,
}

impl ProxyLogger for CollectingLogger {
    fn log_info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn log_warn(&self, message: &str) {
        self.warns.lock().unwrap().push(message.to_string());
    }

    fn log_error(&self, error: &dyn std::error::Error, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push(format!("{message}: {error}"));
    }

    fn log_flow(&self, flow: &Flow) {
        self.flows.lock().unwrap().push(flow.id.to_string());
    }
}

/// Requests an origin server has received.
pub type RequestLog = Arc<Mutex<Vec<HttpRequest>>>;

/// Spawn a plain HTTP origin that answers every request with `response`.
/// Keep-alive friendly as long as `response` carries explicit framing.
pub async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let conn_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let log = conn_log.clone();
            tokio::spawn(async move {
                let mut ms = MessageStream::new(stream, 1024 * 1024);
                while let Ok(Some(request)) = ms.read_request().await {
                    log.lock().unwrap().push(request);
                    if ms.write_raw(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, log)
}

/// Spawn an origin that stalls for `delay` after reading a request before
/// answering. Used for shutdown tests.
#[allow(dead_code)]
pub async fn spawn_slow_origin(delay: std::time::Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut ms = MessageStream::new(stream, 1024 * 1024);
                while let Ok(Some(_)) = ms.read_request().await {
                    tokio::time::sleep(delay).await;
                    let canned = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow";
                    if ms.write_raw(canned).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a TLS origin presenting `config`, answering with `response`.
#[allow(dead_code)]
pub async fn spawn_tls_origin(
    config: Arc<rustls::ServerConfig>,
    response: &'static [u8],
) -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let conn_log = log.clone();
    tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(config);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let log = conn_log.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut ms = MessageStream::new(tls, 1024 * 1024);
                while let Ok(Some(request)) = ms.read_request().await {
                    log.lock().unwrap().push(request);
                    if ms.write_raw(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, log)
}

/// A throwaway CA acting as the "real" PKI of a test origin: returns the TLS
/// server config for `host` and a PEM file of the CA root for the proxy's
/// origin verification.
#[allow(dead_code)]
pub async fn origin_identity(host: &str) -> (Arc<rustls::ServerConfig>, NamedTempFile) {
    let ca = CertificateAuthority::new(
        Arc::new(MemoryCaStorage::new()),
        Arc::new(MemoryTrustStore::new()),
    );
    ca.get_or_create_root("origin-pki").await.unwrap();
    let leaf = ca.get_cert_for_host(host).await.unwrap();
    let config = leaf.server_config().unwrap();

    let root_pem = NamedTempFile::new().unwrap();
    std::fs::write(root_pem.path(), ca.root_certificate_pem().unwrap()).unwrap();
    (config, root_pem)
}

/// Build and start a proxy with an in-memory CA, returning the server, its
/// address, and the logger.
pub async fn start_proxy(
    mutate: impl FnOnce(&mut ProxyOptions),
    pipeline: InterceptorPipeline,
) -> (ProxyServer, SocketAddr, Arc<CollectingLogger>) {
    let mut options = ProxyOptions::default();
    options.listen_port = 0;
    options.tls.use_system_roots = false;
    options.intercept_https = false;
    mutate(&mut options);

    let storage: Arc<dyn CaStorage> = Arc::new(MemoryCaStorage::new());
    let ca = Arc::new(CertificateAuthority::new(
        storage,
        Arc::new(MemoryTrustStore::new()),
    ));
    ca.get_or_create_root(TEST_CA_PASSWORD).await.unwrap();

    let flows = Arc::new(FlowStore::new(options.flow_capacity, options.subscriber_queue));
    let logger = Arc::new(CollectingLogger::default());
    let server = ProxyServer::new(options, ca, flows, pipeline, logger.clone()).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr, logger)
}

/// Client TLS configuration trusting exactly one root certificate.
#[allow(dead_code)]
pub fn client_tls_config(
    root: rustls::pki_types::CertificateDer<'static>,
) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root).unwrap();
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Read the proxy's `200 Connection established` reply (it has no framing
/// headers, so it must be consumed byte-by-byte up to the blank line).
#[allow(dead_code)]
pub async fn read_established(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}
