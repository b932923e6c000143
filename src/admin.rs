//! Loopback admin API
//!
//! | Endpoint | Auth |
//! |---|---|
//! | `GET /health` | none |
//! | `GET /version` | none |
//! | `GET /routes` | bearer |
//! | `GET /certificates` | bearer |
//! | `GET /upstreams` | bearer |
//! | `GET /alerts` | bearer |

use crate::acme::AcmeManager;
use crate::alerts::AlertRegistry;
use crate::certs::CertificateStore;
use crate::pool::PoolStats;
use crate::routing::{Route, RouteTable};
use crate::upstream::UpstreamRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Everything the admin API reports on
pub struct AdminState {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<UpstreamRegistry>,
    pub certs: Arc<CertificateStore>,
    pub alerts: Arc<AlertRegistry>,
    pub pool_stats: Arc<PoolStats>,
    /// Unset when ACME is disabled
    pub acme: Option<Arc<AcmeManager>>,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    let token = Arc::clone(&auth_token);
                                    async move { handle_admin_request(req, &state, &token) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == expected_token)
}

fn handle_admin_request<B>(
    req: Request<B>,
    state: &AdminState,
    auth_token: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let public = matches!(path, "/health" | "/version");
    if !public && !check_auth(&req, auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/routes") => {
            let snapshot = state.routes.snapshot();
            let routes = snapshot.routes();
            let routes: Vec<&Route> = routes.iter().map(|r| r.as_ref()).collect();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "routes": routes,
                    "count": routes.len(),
                    "generation": snapshot.generation(),
                    "degraded": snapshot.is_degraded(),
                }),
            )
        }

        (&Method::GET, "/certificates") => {
            let certificates = state.certs.summaries();
            let in_flight = state
                .acme
                .as_ref()
                .map(|acme| acme.in_flight())
                .unwrap_or_default();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "certificates": certificates,
                    "count": certificates.len(),
                    "in_flight": in_flight,
                }),
            )
        }

        (&Method::GET, "/upstreams") => {
            let targets = state.registry.targets();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "targets": targets,
                    "count": targets.len(),
                    "requests": state.pool_stats.total_requests(),
                    "failed_requests": state.pool_stats.failed_requests(),
                }),
            )
        }

        (&Method::GET, "/alerts") => {
            let alerts = state.alerts.list();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "alerts": alerts,
                    "count": alerts.len(),
                }),
            )
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
