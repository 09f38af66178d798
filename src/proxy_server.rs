//! Proxy server: listener ownership, accept loop, graceful shutdown.
//!
//! The server is explicitly constructed from its collaborators (certificate
//! authority, flow store, interceptor pipeline, logger) and owns nothing
//! global. `start` spawns one accept task; each accepted connection runs on
//! its own task, bounded by a semaphore and tracked for shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::certificate_authority::CertificateAuthority;
use crate::connection::{handle_connection, ConnectionContext};
use crate::error::ProxyError;
use crate::flow_store::{FlowStore, FlowSubscription};
use crate::interceptor::InterceptorPipeline;
use crate::logger::ProxyLogger;
use crate::proxy_config::ProxyOptions;

/// How long `stop` waits for in-flight connections before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

pub struct ProxyServer {
    options: ProxyOptions,
    ca: Arc<CertificateAuthority>,
    flows: Arc<FlowStore>,
    pipeline: Arc<InterceptorPipeline>,
    logger: Arc<dyn ProxyLogger>,
    origin_tls: Arc<rustls::ClientConfig>,
    state: Mutex<Option<Running>>,
}

impl ProxyServer {
    /// Build a server. The interceptor pipeline is taken by value: once the
    /// server exists the chains cannot be mutated.
    pub fn new(
        options: ProxyOptions,
        ca: Arc<CertificateAuthority>,
        flows: Arc<FlowStore>,
        pipeline: InterceptorPipeline,
        logger: Arc<dyn ProxyLogger>,
    ) -> Result<Self, ProxyError> {
        let origin_tls = Arc::new(build_origin_tls(&options)?);
        Ok(ProxyServer {
            options,
            ca,
            flows,
            pipeline: Arc::new(pipeline),
            logger,
            origin_tls,
            state: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting. Fails with `AlreadyRunning` if
    /// called while running. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let addr = SocketAddr::new(self.options.listen_addr, self.options.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let semaphore = Arc::new(Semaphore::new(
            self.options.max_concurrent_connections.max(1),
        ));
        let ctx = Arc::new(ConnectionContext {
            intercept_https: self.options.intercept_https,
            enable_logging: self.options.enable_logging,
            idle_timeout: self.options.idle_timeout(),
            max_body_bytes: self.options.max_body_bytes,
            ca: self.ca.clone(),
            flows: self.flows.clone(),
            pipeline: self.pipeline.clone(),
            logger: self.logger.clone(),
            origin_tls: self.origin_tls.clone(),
            cancel: cancel.clone(),
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            tracker.clone(),
            semaphore,
            cancel.clone(),
        ));

        self.logger
            .log_info(&format!("proxy listening on {local_addr}"));
        *state = Some(Running {
            cancel,
            accept_task,
            tracker,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Signal shutdown, stop accepting, and wait (bounded) for in-flight
    /// connection tasks. Tasks that outlive the grace period have already
    /// observed the cancellation signal and exit at their next suspension.
    /// Idempotent.
    pub async fn stop(&self) {
        let running = self.state.lock().await.take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        let _ = running.accept_task.await;
        running.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, running.tracker.wait())
            .await
            .is_err()
        {
            self.logger
                .log_warn("connection tasks still draining after the shutdown grace period");
        }
        self.logger.log_info("proxy stopped");
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Subscribe to captured flows.
    pub fn flow_events(&self) -> FlowSubscription {
        self.flows.subscribe()
    }

    pub fn flows(&self) -> Arc<FlowStore> {
        self.flows.clone()
    }

    pub fn ca(&self) -> Arc<CertificateAuthority> {
        self.ca.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    tracker: TaskTracker,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        // Respect the connection cap before accepting, so the backlog sits
        // in the kernel rather than in unbounded tasks.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    ctx.logger.log_warn(&format!("accept failed: {err}"));
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        tracker.spawn(async move {
            handle_connection(ctx, stream, peer).await;
            drop(permit);
        });
    }
}

fn build_origin_tls(options: &ProxyOptions) -> Result<rustls::ClientConfig, ProxyError> {
    let mut roots = rustls::RootCertStore::empty();

    if options.tls.use_system_roots {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!("skipping unreadable system root: {err}");
        }
        for cert in loaded.certs {
            if roots.add(cert).is_err() {
                tracing::debug!("skipping invalid system root certificate");
            }
        }
    }

    for path in &options.tls.extra_origin_roots {
        let pem = std::fs::read(path)
            .map_err(|e| ProxyError::Config(format!("reading {}: {e}", path.display())))?;
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = cert
                .map_err(|e| ProxyError::Config(format!("parsing {}: {e}", path.display())))?;
            roots.add(cert).map_err(|e| {
                ProxyError::Config(format!("adding root from {}: {e}", path.display()))
            })?;
        }
    }

    if roots.is_empty() && options.intercept_https {
        return Err(ProxyError::Config(
            "interception is enabled but no origin trust roots are available".to_string(),
        ));
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
