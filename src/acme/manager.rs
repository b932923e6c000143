//! Renewal supervisor
//!
//! Scans the desired domain set on an interval and spawns one issuance
//! state machine per domain that has no certificate or is inside the
//! renewal window. Proxying never waits on it: the old certificate stays
//! in the store until a new one replaces it.

use super::client::CertificateAuthority;
use super::dns::DnsProvider;
use super::order::{CertificateOrder, OrderContext, OrderSettings};
use crate::alerts::{AlertKind, AlertRegistry, Severity};
use crate::certs::{CertificateStore, StoredCertificate};
use crate::config::AcmeConfig;
use crate::error::{GatewayError, Result};
use crate::routing::RouteTable;
use crate::rule::normalize_host_pattern;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long shutdown waits for cancelled orders to clean up
const ORDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of [`AcmeManager::ensure_certificate`]
#[derive(Debug)]
pub enum IssueOutcome {
    /// Current certificate is valid and outside the renewal window
    AlreadyValid,
    Issued(Arc<StoredCertificate>),
}

/// Removes the domain from the in-flight set when the order ends
struct InFlightGuard {
    in_flight: Arc<DashMap<String, DateTime<Utc>>>,
    domain: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.domain);
    }
}

pub struct AcmeManager {
    ctx: OrderContext,
    routes: Arc<RouteTable>,
    resolver: String,
    static_domains: Vec<String>,
    renew_before: chrono::Duration,
    check_interval: Duration,
    in_flight: Arc<DashMap<String, DateTime<Utc>>>,
    /// Flipped on shutdown; every order watches it
    cancel: watch::Sender<bool>,
}

impl AcmeManager {
    pub fn new(
        config: &AcmeConfig,
        dns: Arc<dyn DnsProvider>,
        ca: Arc<dyn CertificateAuthority>,
        store: Arc<CertificateStore>,
        alerts: Arc<AlertRegistry>,
        routes: Arc<RouteTable>,
    ) -> Self {
        let static_domains = config
            .domains
            .iter()
            .filter_map(|d| normalize_host_pattern(d).ok())
            .collect();

        Self {
            ctx: OrderContext {
                dns,
                ca,
                store,
                alerts,
                settings: OrderSettings::from(config),
            },
            routes,
            resolver: config.resolver.clone(),
            static_domains,
            renew_before: config.renew_before(),
            check_interval: config.check_interval(),
            in_flight: Arc::new(DashMap::new()),
            cancel: watch::channel(false).0,
        }
    }

    /// Override the per-order settings (timings, attempts)
    pub fn with_settings(mut self, settings: OrderSettings) -> Self {
        self.ctx.settings = settings;
        self
    }

    /// Static domains plus route hosts that ask for this resolver
    pub fn desired_domains(&self) -> Vec<String> {
        let mut domains: BTreeSet<String> = self.static_domains.iter().cloned().collect();
        for route in self.routes.snapshot().routes() {
            if route.tls_cert_resolver.as_deref() == Some(self.resolver.as_str()) {
                domains.insert(route.host_pattern.clone());
            }
        }
        domains.into_iter().collect()
    }

    /// Domains with an order currently running
    pub fn in_flight(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Issue or renew the certificate of `domain` if needed.
    ///
    /// A valid certificate outside the renewal window is a no-op. A second
    /// call while an order for the domain is running returns
    /// [`GatewayError::AlreadyInFlight`] without contacting the CA.
    pub async fn ensure_certificate(&self, domain: &str) -> Result<IssueOutcome> {
        let domain = domain.to_lowercase();
        if !self.ctx.store.needs_renewal(&domain, self.renew_before) {
            debug!(domain = %domain, "Certificate valid, nothing to do");
            return Ok(IssueOutcome::AlreadyValid);
        }

        let _guard = self.begin(&domain)?;
        let mut order =
            CertificateOrder::new(&domain, self.ctx.clone()).with_cancel(self.cancel.subscribe());
        let cert = order.run().await?;
        self.ctx
            .alerts
            .resolve(AlertKind::CertificateExpired, &domain);
        Ok(IssueOutcome::Issued(cert))
    }

    fn begin(&self, domain: &str) -> Result<InFlightGuard> {
        match self.in_flight.entry(domain.to_string()) {
            Entry::Occupied(_) => {
                debug!(domain, "Order already in flight");
                Err(GatewayError::AlreadyInFlight(domain.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    domain: domain.to_string(),
                })
            }
        }
    }

    /// Raise alerts for expired certificates and spawn orders where needed.
    /// Returns the number of orders started.
    pub fn scan(self: &Arc<Self>, orders: &mut JoinSet<()>) -> usize {
        for cert in self.ctx.store.summaries() {
            if cert.expired {
                let expired = GatewayError::CertificateExpired(cert.domain.clone());
                warn!(domain = %cert.domain, expires_at = %cert.expires_at, "{}", expired);
                self.ctx.alerts.raise(
                    AlertKind::CertificateExpired,
                    &cert.domain,
                    Severity::Critical,
                    format!("{} (at {})", expired, cert.expires_at),
                );
            }
        }

        let mut started = 0;
        for domain in self.desired_domains() {
            if !self.ctx.store.needs_renewal(&domain, self.renew_before)
                || self.in_flight.contains_key(&domain)
            {
                continue;
            }
            let manager = Arc::clone(self);
            orders.spawn(async move {
                match manager.ensure_certificate(&domain).await {
                    Ok(_) | Err(GatewayError::AlreadyInFlight(_)) | Err(GatewayError::Cancelled(_)) => {}
                    Err(e) => warn!(domain = %domain, error = %e, "Certificate order ended without a certificate"),
                }
            });
            started += 1;
        }

        if started > 0 {
            info!(orders = started, "Started certificate orders");
        }
        started
    }

    /// Scan immediately, on every route table change, and every
    /// `check_interval` until shutdown. On shutdown running orders are
    /// cancelled and given `ORDER_DRAIN_TIMEOUT` to remove their records.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            resolver = %self.resolver,
            interval_secs = self.check_interval.as_secs(),
            stored = self.ctx.store.len(),
            "Certificate supervisor started"
        );

        let mut route_changes = self.routes.subscribe();
        let mut ticker = tokio::time::interval(self.check_interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        let mut orders = JoinSet::new();
        self.scan(&mut orders);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(&mut orders);
                }
                Ok(()) = route_changes.changed() => {
                    debug!("Route table changed, rescanning certificates");
                    self.scan(&mut orders);
                }
                Some(_) = orders.join_next(), if !orders.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate supervisor shutting down");
                        break;
                    }
                }
            }
        }

        self.cancel.send_replace(true);
        let drained = tokio::time::timeout(ORDER_DRAIN_TIMEOUT, async {
            while orders.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(orders = orders.len(), "Certificate orders did not stop in time, aborting");
            orders.abort_all();
            while orders.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::order::tests::{context, fast_settings, FakeCa, FakeDns, FakeOutcome};
    use crate::certs::self_signed_pem;
    use crate::routing::{test_route, EntryPoint};
    use std::sync::atomic::Ordering;

    fn manager(dns: Arc<FakeDns>, ca: Arc<FakeCa>, routes: Arc<RouteTable>) -> Arc<AcmeManager> {
        manager_with_settings(dns, ca, routes, fast_settings())
    }

    fn manager_with_settings(
        dns: Arc<FakeDns>,
        ca: Arc<FakeCa>,
        routes: Arc<RouteTable>,
        settings: OrderSettings,
    ) -> Arc<AcmeManager> {
        let config = AcmeConfig {
            domains: vec!["static.example.com".to_string()],
            ..AcmeConfig::default()
        };
        let ctx = context(dns, ca);
        Arc::new(
            AcmeManager::new(&config, ctx.dns, ctx.ca, ctx.store, ctx.alerts, routes)
                .with_settings(settings),
        )
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let reached = tokio::time::timeout(Duration::from_secs(3), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_valid_certificate_is_a_noop() {
        let ca = Arc::new(FakeCa::new(FakeOutcome::Issue));
        let mgr = manager(Arc::new(FakeDns::default()), ca.clone(), Arc::new(RouteTable::new()));

        let (cert_pem, key_pem) = self_signed_pem(&["api.example.com".to_string()], None).unwrap();
        mgr.ctx
            .store
            .replace("api.example.com", &cert_pem, &key_pem, "letsencrypt")
            .unwrap();

        let outcome = mgr.ensure_certificate("api.example.com").await.unwrap();
        assert!(matches!(outcome, IssueOutcome::AlreadyValid));
        assert_eq!(ca.orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_order_in_flight_per_domain() {
        let mut slow = FakeCa::new(FakeOutcome::Issue);
        slow.delay = Duration::from_millis(200);
        let ca = Arc::new(slow);
        let dns = Arc::new(FakeDns::default());
        let mgr = manager(dns.clone(), ca.clone(), Arc::new(RouteTable::new()));

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.ensure_certificate("api.example.com").await })
        };
        while mgr.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = mgr.ensure_certificate("api.example.com").await;
        assert!(matches!(second, Err(GatewayError::AlreadyInFlight(_))));
        assert_eq!(ca.orders.load(Ordering::SeqCst), 1);

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, IssueOutcome::Issued(_)));
        assert!(mgr.in_flight().is_empty());
        assert_eq!(dns.created.load(Ordering::SeqCst), dns.deleted.load(Ordering::SeqCst));

        let third = mgr.ensure_certificate("api.example.com").await.unwrap();
        assert!(matches!(third, IssueOutcome::AlreadyValid));
    }

    #[tokio::test]
    async fn test_desired_domains_from_config_and_routes() {
        let routes = Arc::new(RouteTable::new());
        let mut api = test_route("api.example.com", EntryPoint::Websecure, "backend");
        api.tls_cert_resolver = Some("letsencrypt".to_string());
        let mut wildcard = test_route("*.apps.example.com", EntryPoint::Websecure, "apps");
        wildcard.tls_cert_resolver = Some("letsencrypt".to_string());
        let mut other = test_route("other.example.com", EntryPoint::Websecure, "other");
        other.tls_cert_resolver = Some("internal-ca".to_string());
        let plain = test_route("plain.example.com", EntryPoint::Websecure, "plain");
        for route in [api, wildcard, other, plain] {
            routes.upsert_route(route);
        }

        let mgr = manager(Arc::new(FakeDns::default()), Arc::new(FakeCa::new(FakeOutcome::Issue)), routes);
        assert_eq!(
            mgr.desired_domains(),
            vec!["*.apps.example.com", "api.example.com", "static.example.com"]
        );
    }

    #[tokio::test]
    async fn test_scan_issues_missing_and_alerts_expired() {
        let ca = Arc::new(FakeCa::new(FakeOutcome::Issue));
        let mgr = manager(Arc::new(FakeDns::default()), ca.clone(), Arc::new(RouteTable::new()));

        let past = Utc::now() - chrono::Duration::days(1);
        let (cert_pem, key_pem) = self_signed_pem(&["old.example.com".to_string()], Some(past)).unwrap();
        mgr.ctx
            .store
            .replace("old.example.com", &cert_pem, &key_pem, "letsencrypt")
            .unwrap();

        let mut orders = JoinSet::new();
        assert_eq!(mgr.scan(&mut orders), 1);
        while let Some(result) = orders.join_next().await {
            result.unwrap();
        }

        let alert = mgr
            .ctx
            .alerts
            .get(AlertKind::CertificateExpired, "old.example.com")
            .unwrap();
        assert!(alert.message.contains("has expired"));
        assert!(mgr.ctx.store.get("static.example.com").is_some());
        assert_eq!(ca.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_order_leaves_alert_and_clears_in_flight() {
        let mgr = manager(
            Arc::new(FakeDns::default()),
            Arc::new(FakeCa::new(FakeOutcome::Invalid)),
            Arc::new(RouteTable::new()),
        );

        let err = mgr.ensure_certificate("static.example.com").await.unwrap_err();
        assert!(matches!(err, GatewayError::ChallengeValidationFailed { .. }));
        assert!(mgr.in_flight().is_empty());
        assert!(mgr
            .ctx
            .alerts
            .is_active(AlertKind::CertificateIssuanceFailed, "static.example.com"));
    }

    #[tokio::test]
    async fn test_route_added_after_start_is_issued_without_waiting_for_interval() {
        let routes = Arc::new(RouteTable::new());
        let mgr = manager(
            Arc::new(FakeDns::default()),
            Arc::new(FakeCa::new(FakeOutcome::Issue)),
            routes.clone(),
        );
        assert!(mgr.check_interval >= Duration::from_secs(3600));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(Arc::clone(&mgr).run(shutdown_rx));
        wait_until("static domain", || mgr.ctx.store.get("static.example.com").is_some()).await;

        let mut late = test_route("late.example.com", EntryPoint::Websecure, "late");
        late.tls_cert_resolver = Some("letsencrypt".to_string());
        routes.upsert_route(late);
        wait_until("late route certificate", || mgr.ctx.store.get("late.example.com").is_some()).await;

        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_orders_and_removes_records() {
        let dns = Arc::new(FakeDns::default());
        let mut settings = fast_settings();
        settings.propagation_delay = Duration::from_secs(60);
        let mgr = manager_with_settings(
            dns.clone(),
            Arc::new(FakeCa::new(FakeOutcome::Issue)),
            Arc::new(RouteTable::new()),
            settings,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(Arc::clone(&mgr).run(shutdown_rx));
        wait_until("challenge record", || dns.created.load(Ordering::SeqCst) == 1).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), supervisor)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
        assert!(mgr.in_flight().is_empty());
        assert!(mgr.ctx.store.get("static.example.com").is_none());
    }
}
