//! Entry point listeners and request forwarding
//!
//! Each [`ProxyServer`] serves one entry point. `websecure` terminates TLS
//! (the certificate is picked by SNI) and forwards by `Host`; `web` either
//! redirects to HTTPS or forwards its own routes. Both speak HTTP/1.1 and
//! HTTP/2 and pass `Upgrade` requests (WebSocket) through as raw streams.
//!
//! On shutdown the listener closes first, open connections are asked to
//! finish their current requests, and anything still open when the grace
//! period ends is aborted. Upgraded tunnels share the same deadline.

use crate::error::{json_error_response, GatewayError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use crate::routing::{EntryPoint, RouteTable};
use crate::upstream::{SelectError, UpstreamRegistry};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::http::uri::Authority;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;
/// Upper bound on an upstream's upgrade response head
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// State shared by every connection of every entry point
pub struct ProxyContext {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<UpstreamRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub request_timeout: Duration,
}

/// Plain HTTP to HTTPS redirect settings for the `web` entry point
#[derive(Debug, Clone, Copy)]
pub struct HttpsRedirect {
    pub https_port: u16,
    pub status: StatusCode,
}

impl HttpsRedirect {
    /// `status` must be 301 or 308; anything else falls back to 308
    pub fn new(https_port: u16, status: u16) -> Self {
        let status = match status {
            301 => StatusCode::MOVED_PERMANENTLY,
            _ => StatusCode::PERMANENT_REDIRECT,
        };
        Self { https_port, status }
    }
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    entry_point: EntryPoint,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    redirect: Option<HttpsRedirect>,
    grace_period: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        entry_point: EntryPoint,
        ctx: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            entry_point,
            ctx,
            shutdown_rx,
            tls_acceptor: None,
            redirect: None,
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Answer every request with a redirect to HTTPS instead of routing it
    pub fn with_https_redirect(mut self, redirect: HttpsRedirect) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %listener.local_addr()?,
            entry_point = %self.entry_point,
            protocol,
            redirect = self.redirect.is_some(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();
        let tunnels: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let conn = ConnectionContext {
                                ctx: Arc::clone(&self.ctx),
                                entry_point: self.entry_point,
                                redirect: self.redirect,
                                addr,
                                tunnels: Arc::clone(&tunnels),
                            };
                            let tls_acceptor = self.tls_acceptor.clone();
                            let shutdown = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                match tls_acceptor {
                                    Some(acceptor) => {
                                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                                            Ok(Ok(tls_stream)) => {
                                                if let Err(e) = handle_connection(tls_stream, conn, true, shutdown).await {
                                                    debug!(addr = %addr, error = %e, "TLS connection error");
                                                }
                                            }
                                            Ok(Err(e)) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
                                            Err(_) => debug!(addr = %addr, "TLS handshake timed out"),
                                        }
                                    }
                                    None => {
                                        if let Err(e) = handle_connection(stream, conn, false, shutdown).await {
                                            debug!(addr = %addr, error = %e, "Connection error");
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(entry_point = %self.entry_point, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        let deadline = tokio::time::Instant::now() + self.grace_period;
        drain(connections, deadline, self.entry_point, "connections").await;
        // Connections are gone, so no new tunnel can be added past this point
        let tunnels = std::mem::take(&mut *tunnels.lock());
        drain(tunnels, deadline, self.entry_point, "upgraded tunnels").await;
        Ok(())
    }
}

/// Wait for `tasks` to finish, aborting whatever outlives `deadline`
async fn drain(
    mut tasks: JoinSet<()>,
    deadline: tokio::time::Instant,
    entry_point: EntryPoint,
    what: &'static str,
) {
    if tasks.is_empty() {
        return;
    }
    let open = tasks.len();
    info!(entry_point = %entry_point, open, what, "Draining");

    let drained = tokio::time::timeout_at(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(entry_point = %entry_point, remaining = tasks.len(), what, "Grace period elapsed, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

#[derive(Clone)]
struct ConnectionContext {
    ctx: Arc<ProxyContext>,
    entry_point: EntryPoint,
    redirect: Option<HttpsRedirect>,
    addr: SocketAddr,
    /// Upgraded connections outlive the hyper connection that created them
    tunnels: Arc<Mutex<JoinSet<()>>>,
}

async fn handle_connection<S>(
    stream: S,
    conn: ConnectionContext,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let conn = conn.clone();
        async move { handle_request(req, conn, is_tls).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let connection = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_rx.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

async fn handle_request(
    mut req: Request<Incoming>,
    conn: ConnectionContext,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    if let Some(redirect) = conn.redirect {
        return Ok(build_https_redirect(&req, &hostname, redirect));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = &conn.ctx;
    let route = match ctx
        .routes
        .resolve_request(&hostname, req.uri().path(), conn.entry_point)
    {
        Ok(route) => route,
        Err(e) => {
            debug!(hostname, request_id, error = %e, "No route");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
    };

    let target = match ctx.registry.select(&route.service) {
        Ok(target) => target,
        Err(e) => {
            match &e {
                SelectError::NoTargets(_) => warn!(hostname, service = %route.service, "No targets registered"),
                SelectError::AllUnhealthy(_) => warn!(hostname, service = %route.service, "All targets unhealthy"),
            }
            return Ok(json_error_response(
                ProxyErrorCode::NoHealthyUpstream,
                "No healthy upstream available",
            ));
        }
    };
    let authority = target.authority();

    // Overwrite rather than append: the gateway is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&conn.addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&hostname) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(
        hostname,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        route = %route.name,
        upstream = %authority,
        "Forwarding request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &hostname, &authority, request_id, &conn).await;
    }

    let result = tokio::time::timeout(ctx.request_timeout, ctx.pool.send_request(req, &authority)).await;

    match result {
        Ok(Ok(response)) => {
            debug!(
                hostname,
                request_id,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request completed"
            );
            Ok(response)
        }
        Ok(Err(e @ PoolError::RequestBuild(_))) => {
            error!(hostname, request_id, upstream = %authority, error = %e, "Could not build upstream request");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Internal gateway error",
            ))
        }
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnreachable {
                target: authority,
                reason: e.to_string(),
            };
            error!(hostname, request_id, error = %err, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                upstream = %authority,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Lowercased host from `Host` (HTTP/1.1) or the URI authority (HTTP/2), port stripped.
/// IPv6 literals keep their brackets.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let authority = match req.headers().get(hyper::header::HOST) {
        Some(value) => value.to_str().ok()?.parse::<Authority>().ok()?,
        None => req.uri().authority()?.clone(),
    };
    let host = authority.host();

    if let Some(literal) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let addr: Ipv6Addr = literal.parse().ok()?;
        return Some(format!("[{}]", addr));
    }

    let hostname = host.trim_end_matches('.');
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Alphanumeric, hyphen, underscore and dot only; keeps junk out of logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }
    Some(hostname.to_ascii_lowercase())
}

fn build_https_redirect<B>(req: &Request<B>, hostname: &str, redirect: HttpsRedirect) -> Response<ProxyBody> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if redirect.https_port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, redirect.https_port, path)
    };

    let mut response = Response::new(full_body("Redirecting to HTTPS"));
    *response.status_mut() = redirect.status;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn full_body(text: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request head for the upstream, Host preserved
fn build_upgrade_request<B>(req: &Request<B>, hostname: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        head.push_str(&format!("host: {}\r\n", hostname));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Status and headers of an upstream response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.splitn(3, ' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Read until the end of the response head; returns (head, bytes read past it)
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    hostname: &str,
    authority: &str,
    request_id: String,
    conn: &ConnectionContext,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let timeout = conn.ctx.request_timeout;
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, hostname);

    let handshake = async {
        let mut upstream = TcpStream::connect(authority).await?;
        upstream.write_all(&raw_request).await?;
        let (head, rest) = read_response_head(&mut upstream).await?;
        Ok::<_, std::io::Error>((upstream, head, rest))
    };

    let (upstream, head, leftover) = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            let err = GatewayError::UpstreamUnreachable {
                target: authority.to_string(),
                reason: e.to_string(),
            };
            error!(hostname, request_id, error = %err, "Upgrade handshake failed");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Failed to connect to upstream",
            ));
        }
        Err(_) => {
            warn!(hostname, upstream = %authority, "Upgrade handshake timed out");
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                "Upstream did not answer the upgrade in time",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(hostname, upstream = %authority, "Invalid upgrade response from upstream");
        return Ok(json_error_response(
            ProxyErrorCode::UpstreamUnreachable,
            "Invalid upgrade response from upstream",
        ));
    };

    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    for (name, value) in &response_headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Upstream rejected upgrade request");
        return Ok(response);
    }

    info!(hostname, request_id, upgrade_type, "Upgrade accepted");

    let hostname = hostname.to_string();
    let tunnel = async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, upstream, leftover, &hostname, &request_id).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to upgrade client connection");
            }
        }
    };
    {
        let mut tunnels = conn.tunnels.lock();
        while tunnels.try_join_next().is_some() {}
        tunnels.spawn(tunnel);
    }

    Ok(response)
}

async fn forward_bidirectional(
    client: Upgraded,
    mut upstream: TcpStream,
    leftover: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(hostname, request_id, error = %e, "Client went away before forwarding started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(hostname, request_id, to_upstream, to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
