use edgegate::acme::{AcmeManager, CloudflareDns, LazyAcmeAuthority};
use edgegate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use edgegate::alerts::AlertRegistry;
use edgegate::backoff::Backoff;
use edgegate::certs::{self, CertificateStore, SniResolver};
use edgegate::config::{Config, DiscoveryProvider};
use edgegate::discovery::labels::LabelConfig;
use edgegate::discovery::{DiscoverySource, DiscoveryWatcher, DockerSource, StaticSource};
use edgegate::healthcheck::{HealthCheckConfig, HealthCheckerBuilder};
use edgegate::pool::{ConnectionPool, PoolConfig};
use edgegate::proxy::{HttpsRedirect, ProxyContext, ProxyServer};
use edgegate::routing::{EntryPoint, RouteTable};
use edgegate::upstream::UpstreamRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    certs::install_crypto_provider();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgegate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let routes = Arc::new(RouteTable::new());
    let registry = Arc::new(UpstreamRegistry::new());
    let alerts = Arc::new(AlertRegistry::new());

    let store = if config.acme.enabled {
        let store = CertificateStore::open(&config.acme.storage_dir)?;
        info!(dir = %config.acme.storage_dir, certificates = store.len(), "Certificate store loaded");
        Arc::new(store)
    } else {
        Arc::new(CertificateStore::in_memory())
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Discovery
    let source: Arc<dyn DiscoverySource> = match config.discovery.provider {
        DiscoveryProvider::Static => Arc::new(StaticSource::new(
            &config.discovery.services,
            &config.discovery.label_prefix,
        )),
        DiscoveryProvider::Docker => Arc::new(
            DockerSource::connect(
                config.discovery.docker_host.as_deref(),
                &config.discovery.label_prefix,
                config.discovery.network.as_deref(),
                config.discovery.exposed_by_default,
            )
            .await?,
        ),
    };
    let watcher = DiscoveryWatcher::new(
        source,
        LabelConfig::from(&config.discovery),
        Arc::clone(&routes),
        Arc::clone(&registry),
        Arc::clone(&alerts),
    )
    .with_backoff(Backoff::new(
        Duration::from_millis(config.discovery.reconnect_base_ms),
        Duration::from_secs(config.discovery.reconnect_max_secs),
    ))
    .with_staleness_ceiling(config.discovery.staleness_ceiling());
    tasks.push(tokio::spawn(watcher.run(shutdown_rx.clone())));

    // Health checks
    if let Some(checker) = HealthCheckerBuilder::new()
        .registry(Arc::clone(&registry))
        .config(HealthCheckConfig::from(&config.health))
        .shutdown_receiver(shutdown_rx.clone())
        .build()
    {
        tasks.push(tokio::spawn(checker.run()));
    }

    // Certificates
    let acme_manager = if config.acme.enabled {
        let dns = CloudflareDns::from_config(&config.acme.dns)?;
        // The CA is contacted by the first order, never before the listeners are up
        let ca = LazyAcmeAuthority::new(
            config.acme.directory_url(),
            config.acme.email.as_deref().unwrap_or_default(),
            &config.acme.storage_dir,
        );
        info!(
            directory = config.acme.directory_url(),
            resolver = %config.acme.resolver,
            domains = ?config.acme.domains,
            "ACME DNS-01 certificate automation enabled"
        );

        let manager = Arc::new(AcmeManager::new(
            &config.acme,
            Arc::new(dns),
            Arc::new(ca),
            Arc::clone(&store),
            Arc::clone(&alerts),
            Arc::clone(&routes),
        ));
        tasks.push(tokio::spawn(Arc::clone(&manager).run(shutdown_rx.clone())));
        Some(manager)
    } else {
        None
    };

    let default_cert = if !config.server.fallback_to_default_cert {
        None
    } else if let (Some(cert), Some(key)) = (&config.server.default_cert, &config.server.default_key) {
        info!(cert = %cert, key = %key, "Default certificate loaded");
        Some(certs::load_default_certificate(cert, key)?)
    } else {
        warn!("Using a generated self-signed default certificate (not for production)");
        Some(certs::self_signed_default_certificate(&["localhost".to_string()])?)
    };
    let resolver = Arc::new(SniResolver::new(Arc::clone(&store), default_cert));
    let tls_acceptor = TlsAcceptor::from(Arc::new(certs::server_config(resolver)?));

    // Proxies
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
    let ctx = Arc::new(ProxyContext {
        routes: Arc::clone(&routes),
        registry: Arc::clone(&registry),
        pool: Arc::clone(&pool),
        request_timeout: config.server.request_timeout(),
    });
    let grace_period = config.server.shutdown_grace_period();

    let mut proxies: Vec<JoinHandle<()>> = Vec::new();

    if config.server.http_port > 0 {
        let addr = bind_addr(&config.server.bind, config.server.http_port)?;
        let mut proxy = ProxyServer::new(addr, EntryPoint::Web, Arc::clone(&ctx), shutdown_rx.clone())
            .with_grace_period(grace_period);
        if config.server.redirect_to_https && config.server.https_port > 0 {
            proxy = proxy.with_https_redirect(HttpsRedirect::new(
                config.server.https_port,
                config.server.redirect_status,
            ));
            info!(
                http_port = config.server.http_port,
                https_port = config.server.https_port,
                status = config.server.redirect_status,
                "HTTP to HTTPS redirect enabled"
            );
        }
        proxies.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    if config.server.https_port > 0 {
        let addr = bind_addr(&config.server.bind, config.server.https_port)?;
        let proxy = ProxyServer::new(addr, EntryPoint::Websecure, Arc::clone(&ctx), shutdown_rx.clone())
            .with_tls(tls_acceptor)
            .with_grace_period(grace_period);
        proxies.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));
    }

    // Admin API
    if config.server.admin_port > 0 {
        let admin_addr = bind_addr("127.0.0.1", config.server.admin_port)?;
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });
        let state = Arc::new(AdminState {
            routes: Arc::clone(&routes),
            registry: Arc::clone(&registry),
            certs: Arc::clone(&store),
            alerts: Arc::clone(&alerts),
            pool_stats: pool.stats(),
            acme: acme_manager.clone(),
        });
        let admin_server = AdminServer::new(admin_addr, state, shutdown_rx.clone(), admin_token);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }));
    }

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    // Proxies drain within the grace period on their own; allow a little slack
    let drained = tokio::time::timeout(grace_period + Duration::from_secs(2), async {
        for handle in proxies {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Proxies did not stop within the grace period");
    }

    // Covers the certificate supervisor's order drain
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        for handle in tasks {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        error!(bind = %host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        admin_port = config.server.admin_port,
        redirect_to_https = config.server.redirect_to_https,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Request handling"
    );
    info!(
        provider = ?config.discovery.provider,
        label_prefix = %config.discovery.label_prefix,
        static_services = config.discovery.services.len(),
        "Discovery"
    );
    info!(
        interval_secs = config.health.interval_secs,
        timeout_ms = config.health.timeout_ms,
        path = ?config.health.path,
        unhealthy_threshold = config.health.unhealthy_threshold,
        "Health checks"
    );
}
