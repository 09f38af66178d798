//! Per-connection state machine.
//!
//! Each accepted socket is driven through one of three paths: plain HTTP
//! proxying, a blind `CONNECT` tunnel, or an intercepted TLS tunnel. The
//! plain and intercepted paths share the same exchange loop: parse a client
//! request, run request interceptors, forward upstream, parse the response,
//! run response interceptors, forward back, and record the flow. Every error
//! is recovered here; nothing propagates into the accept loop.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::certificate_authority::CertificateAuthority;
use crate::error::ProxyError;
use crate::flow::{FailureKind, Flow, FlowContext};
use crate::flow_store::FlowStore;
use crate::http_codec::MessageStream;
use crate::http_message::{
    parse_authority, HttpRequest, HttpResponse, RequestTarget, Scheme, Url,
};
use crate::interceptor::InterceptorPipeline;
use crate::logger::ProxyLogger;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Everything a connection task needs, shared across all connections.
pub(crate) struct ConnectionContext {
    pub intercept_https: bool,
    pub enable_logging: bool,
    pub idle_timeout: Duration,
    pub max_body_bytes: usize,
    pub ca: Arc<CertificateAuthority>,
    pub flows: Arc<FlowStore>,
    pub pipeline: Arc<InterceptorPipeline>,
    pub logger: Arc<dyn ProxyLogger>,
    pub origin_tls: Arc<rustls::ClientConfig>,
    pub cancel: CancellationToken,
}

impl ConnectionContext {
    fn record_flow(&self, flow: Flow) {
        let flow = self.flows.append(flow);
        if self.enable_logging {
            self.logger.log_flow(&flow);
        }
    }
}

/// A flow that has been opened by a parsed request but not yet finished.
struct PendingFlow {
    ctx: FlowContext,
    timer: Instant,
}

impl PendingFlow {
    fn new(client_addr: &str) -> PendingFlow {
        PendingFlow {
            ctx: FlowContext::new(client_addr.to_string()),
            timer: Instant::now(),
        }
    }

    fn complete(self, request: HttpRequest, response: HttpResponse) -> Flow {
        Flow::completed(&self.ctx, request, response, self.timer.elapsed())
    }

    fn fail(self, request: HttpRequest, response: Option<HttpResponse>, kind: FailureKind) -> Flow {
        Flow::failed(&self.ctx, request, response, self.timer.elapsed(), kind)
    }
}

/// Entry point for one accepted connection. Never returns an error to the
/// caller; failures are logged and the sockets torn down.
pub(crate) async fn handle_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match drive(&ctx, stream, peer).await {
        Ok(()) => {}
        Err(ProxyError::Cancelled) => {
            ctx.logger
                .log_info(&format!("connection from {peer} cancelled by shutdown"));
        }
        Err(err) => {
            ctx.logger
                .log_error(&err, &format!("connection from {peer} closed"));
        }
    }
}

async fn drive(
    ctx: &ConnectionContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let client_addr = peer.to_string();
    let mut client = MessageStream::new(stream, ctx.max_body_bytes);

    let first = match read_client_request(ctx, &mut client).await {
        Ok(Some(request)) => request,
        // Closed or idled out before sending anything; not an error.
        Ok(None) => return Ok(()),
        Err(ProxyError::TcpTimeout) => return Ok(()),
        Err(err @ ProxyError::Http(_)) => {
            let resp = HttpResponse::synthetic(400, "Bad Request", "malformed request");
            let _ = client.send_response(&resp).await;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    if first.is_connect() {
        handle_connect(ctx, client, &client_addr, first).await
    } else {
        serve_plain(ctx, client, &client_addr, first).await
    }
}

/// Read one request from the client side, racing shutdown and the idle
/// timeout.
async fn read_client_request<S: AsyncRead + Unpin>(
    ctx: &ConnectionContext,
    stream: &mut MessageStream<S>,
) -> Result<Option<HttpRequest>, ProxyError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
        result = tokio::time::timeout(ctx.idle_timeout, stream.read_request()) => match result {
            Err(_) => Err(ProxyError::TcpTimeout),
            Ok(Ok(request)) => Ok(request),
            Ok(Err(err)) => Err(ProxyError::from_codec(err)),
        }
    }
}

async fn read_origin_response<S: AsyncRead + Unpin>(
    ctx: &ConnectionContext,
    stream: &mut MessageStream<S>,
    head_request: bool,
) -> Result<HttpResponse, ProxyError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
        result = tokio::time::timeout(ctx.idle_timeout, stream.read_response(head_request)) => match result {
            Err(_) => Err(ProxyError::TcpTimeout),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(ProxyError::from_codec(err)),
        }
    }
}

async fn connect_upstream(
    ctx: &ConnectionContext,
    host: &str,
    port: u16,
) -> Result<TcpStream, ProxyError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
        result = TcpStream::connect((host, port)) => result.map_err(|source| ProxyError::TcpConnect {
            authority: format!("{host}:{port}"),
            source,
        }),
    }
}

/// Plain HTTP proxying with keep-alive, reconnecting the upstream when a
/// request targets a different authority.
async fn serve_plain(
    ctx: &ConnectionContext,
    mut client: MessageStream<TcpStream>,
    client_addr: &str,
    first: HttpRequest,
) -> Result<(), ProxyError> {
    let mut upstream: Option<(String, MessageStream<TcpStream>)> = None;
    let mut next = Some(first);

    loop {
        let request = match next.take() {
            Some(request) => request,
            None => match read_client_request(ctx, &mut client).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(ProxyError::TcpTimeout) => return Ok(()),
                // Idle between exchanges; no in-flight flow to record.
                Err(ProxyError::Cancelled) => return Ok(()),
                Err(err @ ProxyError::Http(_)) => {
                    let resp = HttpResponse::synthetic(400, "Bad Request", "malformed request");
                    let _ = client.send_response(&resp).await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            },
        };

        let pending = PendingFlow::new(client_addr);
        let Some(url) = request.url(Scheme::Http) else {
            let resp =
                HttpResponse::synthetic(400, "Bad Request", "cannot determine request target");
            let _ = client.send_response(&resp).await;
            return Ok(());
        };

        let authority = format!("{}:{}", url.host, url.port);
        let reusable = matches!(&upstream, Some((current, _)) if *current == authority);
        if !reusable {
            match connect_upstream(ctx, &url.host, url.port).await {
                Ok(socket) => {
                    upstream = Some((authority, MessageStream::new(socket, ctx.max_body_bytes)));
                }
                Err(err) => {
                    let kind = FailureKind::from_error(&err);
                    let resp = HttpResponse::synthetic(
                        502,
                        "Bad Gateway",
                        "upstream connection failed",
                    );
                    let _ = client.send_response(&resp).await;
                    let mut request = request;
                    request.target = RequestTarget::Absolute(url);
                    ctx.record_flow(pending.fail(request, Some(resp), kind));
                    return Err(err);
                }
            }
        }
        let Some((_, upstream_stream)) = upstream.as_mut() else {
            return Ok(());
        };

        let keep = run_exchange(ctx, pending, request, url, upstream_stream, &mut client).await?;
        if !keep {
            return Ok(());
        }
    }
}

/// Dispatch a `CONNECT` to the blind or intercepting tunnel path.
async fn handle_connect(
    ctx: &ConnectionContext,
    mut client: MessageStream<TcpStream>,
    client_addr: &str,
    request: HttpRequest,
) -> Result<(), ProxyError> {
    let authority = match &request.target {
        RequestTarget::Authority(authority) => authority.clone(),
        _ => {
            let resp =
                HttpResponse::synthetic(400, "Bad Request", "CONNECT requires host:port");
            let _ = client.send_response(&resp).await;
            return Ok(());
        }
    };
    // The tunnel target must carry an explicit port.
    let Some((host, port)) = parse_authority(&authority, None) else {
        let resp = HttpResponse::synthetic(400, "Bad Request", "CONNECT requires host:port");
        let _ = client.send_response(&resp).await;
        return Ok(());
    };

    if ctx.intercept_https {
        intercepted_tunnel(ctx, client, client_addr, host, port).await
    } else {
        blind_tunnel(ctx, client, client_addr, request, host, port).await
    }
}

/// Byte-forwarding tunnel: no TLS termination, no inner parsing, no flows.
async fn blind_tunnel(
    ctx: &ConnectionContext,
    mut client: MessageStream<TcpStream>,
    client_addr: &str,
    request: HttpRequest,
    host: String,
    port: u16,
) -> Result<(), ProxyError> {
    let pending = PendingFlow::new(client_addr);
    let mut upstream = match connect_upstream(ctx, &host, port).await {
        Ok(socket) => socket,
        Err(err) => {
            let kind = FailureKind::from_error(&err);
            let resp =
                HttpResponse::synthetic(502, "Bad Gateway", "upstream connection failed");
            let _ = client.send_response(&resp).await;
            ctx.record_flow(pending.fail(request, Some(resp), kind));
            return Err(err);
        }
    };

    client
        .write_raw(ESTABLISHED)
        .await
        .map_err(ProxyError::TcpWrite)?;

    let (stream, leftover) = client.into_parts();
    let mut client_stream = Rewind::new(stream, leftover.freeze());
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
        result = tokio::io::copy_bidirectional(&mut client_stream, &mut upstream) => {
            // Either side closing, cleanly or not, just ends the tunnel.
            if let Err(err) = result {
                tracing::debug!("tunnel to {host}:{port} ended: {err}");
            }
            Ok(())
        }
    }
}

/// Terminate the client's TLS with a minted certificate, open a verified
/// TLS session to the origin, and run the exchange loop over both.
async fn intercepted_tunnel(
    ctx: &ConnectionContext,
    mut client: MessageStream<TcpStream>,
    client_addr: &str,
    host: String,
    port: u16,
) -> Result<(), ProxyError> {
    client
        .write_raw(ESTABLISHED)
        .await
        .map_err(ProxyError::TcpWrite)?;

    let leaf = ctx.ca.get_cert_for_host(&host).await?;
    let acceptor = TlsAcceptor::from(leaf.server_config()?);
    let (stream, leftover) = client.into_parts();
    let rewound = Rewind::new(stream, leftover.freeze());

    let tls_client = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(ProxyError::Cancelled),
        result = tokio::time::timeout(ctx.idle_timeout, acceptor.accept(rewound)) => match result {
            Err(_) => return Err(ProxyError::TcpTimeout),
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ProxyError::TlsHandshakeClient(err)),
        }
    };
    let mut client = MessageStream::new(tls_client, ctx.max_body_bytes);

    let upstream = match open_origin_tls(ctx, &host, port).await {
        Ok(stream) => stream,
        Err(err) => return refuse_tunnel(ctx, client, client_addr, &host, port, err).await,
    };
    let mut upstream = MessageStream::new(upstream, ctx.max_body_bytes);

    loop {
        let request = match read_client_request(ctx, &mut client).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(ProxyError::TcpTimeout) => return Ok(()),
            Err(ProxyError::Cancelled) => return Ok(()),
            Err(err @ ProxyError::Http(_)) => {
                let resp = HttpResponse::synthetic(400, "Bad Request", "malformed request");
                let _ = client.send_response(&resp).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let pending = PendingFlow::new(client_addr);
        let Some(url) = tunnel_url(&request, &host, port) else {
            let resp =
                HttpResponse::synthetic(400, "Bad Request", "cannot determine request target");
            let _ = client.send_response(&resp).await;
            return Ok(());
        };

        let keep = run_exchange(ctx, pending, request, url, &mut upstream, &mut client).await?;
        if !keep {
            return Ok(());
        }
    }
}

async fn open_origin_tls(
    ctx: &ConnectionContext,
    host: &str,
    port: u16,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let tcp = connect_upstream(ctx, host, port).await?;
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::TlsVerifyOrigin(format!("invalid server name {host:?}")))?;
    let connector = TlsConnector::from(ctx.origin_tls.clone());
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled),
        result = tokio::time::timeout(ctx.idle_timeout, connector.connect(server_name, tcp)) => match result {
            Err(_) => Err(ProxyError::TcpTimeout),
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(ProxyError::from_origin_tls(err)),
        }
    }
}

/// The origin is unreachable or failed TLS: answer the first inner request
/// with a synthesized 502 inside the client's TLS session so it sees a
/// structured failure, and record a failed flow.
async fn refuse_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &ConnectionContext,
    mut client: MessageStream<S>,
    client_addr: &str,
    host: &str,
    port: u16,
    err: ProxyError,
) -> Result<(), ProxyError> {
    let kind = FailureKind::from_error(&err);
    let mut request = match read_client_request(ctx, &mut client).await {
        Ok(Some(request)) => request,
        // The client went away before asking for anything; the handshake
        // failure alone is not a flow.
        _ => return Err(err),
    };

    let pending = PendingFlow::new(client_addr);
    if let Some(url) = tunnel_url(&request, host, port) {
        request.target = RequestTarget::Absolute(url);
    }
    let resp = HttpResponse::synthetic(502, "Bad Gateway", "origin unreachable");
    let _ = client.send_response(&resp).await;
    ctx.record_flow(pending.fail(request, Some(resp), kind));
    Err(err)
}

/// Absolute URL for a request seen inside a tunnel to `host:port`.
fn tunnel_url(request: &HttpRequest, host: &str, port: u16) -> Option<Url> {
    match &request.target {
        RequestTarget::Origin { path_and_query } => {
            let mut url = Url::from_authority(Scheme::Https, host, path_and_query)?;
            url.port = port;
            Some(url)
        }
        RequestTarget::Absolute(url) => Some(url.clone()),
        _ => None,
    }
}

/// One request/response exchange over an established socket pair.
/// Returns whether the connection pair may be reused. The flow is recorded
/// exactly once on every path out of this function.
async fn run_exchange<U, C>(
    ctx: &ConnectionContext,
    pending: PendingFlow,
    mut request: HttpRequest,
    url: Url,
    upstream: &mut MessageStream<U>,
    client: &mut MessageStream<C>,
) -> Result<bool, ProxyError>
where
    U: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    // Rewrite to absolute form and pin the Host header to the target.
    request.headers.set("Host", url.authority());
    request.target = RequestTarget::Absolute(url);

    let mut request = ctx
        .pipeline
        .apply_request(request, &pending.ctx, ctx.logger.as_ref());
    sync_request_framing(&mut request);
    let head_request = request.method == "HEAD";

    if let Err(err) = upstream.send_request(&request, true).await {
        let err = ProxyError::TcpWrite(err);
        let kind = FailureKind::from_error(&err);
        let resp = HttpResponse::synthetic(502, "Bad Gateway", "upstream write failed");
        let _ = client.send_response(&resp).await;
        ctx.record_flow(pending.fail(request, Some(resp), kind));
        return Err(err);
    }

    let response = match read_origin_response(ctx, upstream, head_request).await {
        Ok(response) => response,
        Err(err) => {
            let kind = FailureKind::from_error(&err);
            let synthesized = if matches!(err, ProxyError::Cancelled) {
                None
            } else {
                let resp =
                    HttpResponse::synthetic(502, "Bad Gateway", "upstream request failed");
                let _ = client.send_response(&resp).await;
                Some(resp)
            };
            ctx.record_flow(pending.fail(request, synthesized, kind));
            return Err(err);
        }
    };
    // Reuse is decided on the response as the origin framed it.
    let origin_keep_alive = response.allows_keep_alive(head_request);

    let mut response = ctx
        .pipeline
        .apply_response(response, &pending.ctx, ctx.logger.as_ref());
    sync_response_framing(&mut response);

    if let Err(err) = client.send_response(&response).await {
        let err = ProxyError::TcpWrite(err);
        ctx.record_flow(pending.fail(request, Some(response), FailureKind::TcpWrite));
        return Err(err);
    }

    let keep = request.wants_keep_alive() && origin_keep_alive;
    ctx.record_flow(pending.complete(request, response));
    Ok(keep)
}

/// Re-align `Content-Length` with the body after interceptors ran. A chunked
/// request is re-emitted chunked and needs no length.
fn sync_request_framing(request: &mut HttpRequest) {
    if request.headers.contains_token("Transfer-Encoding", "chunked") {
        return;
    }
    if !request.body.is_empty() || request.headers.get("Content-Length").is_some() {
        request
            .headers
            .set("Content-Length", request.body.len().to_string());
    }
}

/// Responses only get their `Content-Length` refreshed when they had one;
/// close-delimited responses stay close-delimited.
fn sync_response_framing(response: &mut HttpResponse) {
    if response.headers.contains_token("Transfer-Encoding", "chunked") {
        return;
    }
    if response.headers.get("Content-Length").is_some() {
        response
            .headers
            .set("Content-Length", response.body.len().to_string());
    }
}

/// Stream adapter that replays already-buffered bytes before reading from
/// the underlying socket. Needed when the codec read ahead of a `CONNECT`
/// and the tunnel takes over the raw stream.
pub(crate) struct Rewind<S> {
    pre: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub(crate) fn new(inner: S, pre: Bytes) -> Self {
        Rewind {
            pre: if pre.is_empty() { None } else { Some(pre) },
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(pre) = self.pre.as_mut() {
            use bytes::Buf;
            let n = pre.len().min(buf.remaining());
            buf.put_slice(&pre[..n]);
            pre.advance(n);
            let drained = pre.is_empty();
            if drained {
                self.pre = None;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_message::{Headers, Version};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn rewind_replays_buffered_bytes_first() {
        let inner: &[u8] = b" world";
        let mut rewound = Rewind::new(inner, Bytes::from_static(b"hello"));
        let mut out = String::new();
        rewound.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn rewind_with_empty_prefix_is_transparent() {
        let inner: &[u8] = b"data";
        let mut rewound = Rewind::new(inner, Bytes::new());
        let mut out = Vec::new();
        rewound.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");
    }

    fn origin_request(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            target: RequestTarget::Origin {
                path_and_query: path.to_string(),
            },
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn tunnel_url_joins_host_and_path() {
        let request = origin_request("/v1/items?page=2");
        let url = tunnel_url(&request, "origin.test", 8443).unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.host, "origin.test");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/v1/items");
        assert_eq!(url.query.as_deref(), Some("page=2"));
    }

    #[test]
    fn tunnel_url_rejects_connect_targets() {
        let mut request = origin_request("/");
        request.target = RequestTarget::Authority("a:1".to_string());
        assert!(tunnel_url(&request, "a", 1).is_none());
    }

    #[test]
    fn request_framing_follows_body() {
        let mut request = origin_request("/");
        request.body = Bytes::from_static(b"12345");
        sync_request_framing(&mut request);
        assert_eq!(request.headers.get("Content-Length"), Some("5"));

        // Chunked requests are left alone.
        let mut chunked = origin_request("/");
        chunked.headers.push("Transfer-Encoding", "chunked");
        chunked.body = Bytes::from_static(b"12345");
        sync_request_framing(&mut chunked);
        assert!(chunked.headers.get("Content-Length").is_none());
    }

    #[test]
    fn response_framing_only_updates_existing_length() {
        let mut response = HttpResponse::synthetic(200, "OK", "four");
        response.body = Bytes::from_static(b"now longer");
        sync_response_framing(&mut response);
        assert_eq!(response.headers.get("Content-Length"), Some("10"));

        let mut close_delimited = HttpResponse {
            version: Version::Http11,
            status: 200,
            reason: "OK".to_string(),
            headers: Headers::new(),
            body: Bytes::from_static(b"stream"),
        };
        sync_response_framing(&mut close_delimited);
        assert!(close_delimited.headers.get("Content-Length").is_none());
    }
}
