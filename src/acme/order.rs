//! Per-domain DNS-01 issuance state machine
//!
//! ```text
//! Idle → ChallengeRequested → DnsRecordPublished → DnsPropagationWait
//!      → ChallengeValidated → CertificateIssued → Active | Failed
//! ```
//!
//! Once a TXT record has been created it is deleted again on every exit
//! path of the attempt, including the order future being dropped. Failed
//! attempts restart from `Idle` after a jittered cooldown until
//! `max_attempts` is reached, then the order ends in `Failed` with a
//! persistent alert. Shutdown cancels waiting orders through the cleanup
//! path.

use super::client::{CertificateAuthority, DnsChallenge, OrderProgress, PendingOrder};
use super::dns::{challenge_record_name, DnsProvider};
use crate::alerts::{AlertKind, AlertRegistry, Severity};
use crate::backoff::Backoff;
use crate::certs::{CertificateStore, StoredCertificate};
use crate::config::AcmeConfig;
use crate::error::{GatewayError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Issuance states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Idle,
    ChallengeRequested,
    DnsRecordPublished,
    DnsPropagationWait,
    ChallengeValidated,
    CertificateIssued,
    Active,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Idle => "idle",
            OrderState::ChallengeRequested => "challenge_requested",
            OrderState::DnsRecordPublished => "dns_record_published",
            OrderState::DnsPropagationWait => "dns_propagation_wait",
            OrderState::ChallengeValidated => "challenge_validated",
            OrderState::CertificateIssued => "certificate_issued",
            OrderState::Active => "active",
            OrderState::Failed => "failed",
        }
    }
}

/// Timing and retry knobs for an order
#[derive(Debug, Clone)]
pub struct OrderSettings {
    pub propagation_delay: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub max_attempts: u32,
    /// Base pause between attempts; grows per attempt with jitter
    pub retry_cooldown: Duration,
    /// Retries of a transiently failing provider or CA call
    pub max_retries: u32,
    pub retry_backoff: Backoff,
    /// Resolver name recorded with issued certificates
    pub resolver: String,
}

impl OrderSettings {
    fn cooldown(&self, attempt: u32) -> Duration {
        Backoff::new(self.retry_cooldown, self.retry_cooldown.saturating_mul(8)).delay(attempt)
    }
}

impl From<&AcmeConfig> for OrderSettings {
    fn from(config: &AcmeConfig) -> Self {
        Self {
            propagation_delay: Duration::from_secs(config.propagation_delay_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_polls: config.max_polls,
            max_attempts: config.max_attempts.max(1),
            retry_cooldown: Duration::from_secs(config.retry_cooldown_secs),
            max_retries: config.dns.max_retries,
            retry_backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(120)),
            resolver: config.resolver.clone(),
        }
    }
}

/// Shared handles every order is built with
#[derive(Clone)]
pub struct OrderContext {
    pub dns: Arc<dyn DnsProvider>,
    pub ca: Arc<dyn CertificateAuthority>,
    pub store: Arc<CertificateStore>,
    pub alerts: Arc<AlertRegistry>,
    pub settings: OrderSettings,
}

/// Deletes a published challenge record when dropped while still armed
struct ChallengeRecordGuard {
    dns: Arc<dyn DnsProvider>,
    record_id: Option<String>,
    domain: String,
}

impl ChallengeRecordGuard {
    fn new(dns: Arc<dyn DnsProvider>, record_id: &str, domain: &str) -> Self {
        Self {
            dns,
            record_id: Some(record_id.to_string()),
            domain: domain.to_string(),
        }
    }

    fn disarm(&mut self) {
        self.record_id = None;
    }
}

impl Drop for ChallengeRecordGuard {
    fn drop(&mut self) {
        let Some(record_id) = self.record_id.take() else {
            return;
        };
        let domain = std::mem::take(&mut self.domain);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(domain = %domain, record = %record_id, "No runtime left to remove challenge record");
            return;
        };

        let dns = Arc::clone(&self.dns);
        runtime.spawn(async move {
            match dns.delete_txt_record(&record_id).await {
                Ok(()) => debug!(domain = %domain, record = %record_id, "Orphaned challenge record removed"),
                Err(e) => warn!(
                    domain = %domain,
                    record = %record_id,
                    error = %e,
                    "Failed to remove orphaned challenge record"
                ),
            }
        });
    }
}

/// Issuance for one domain
pub struct CertificateOrder {
    domain: String,
    ctx: OrderContext,
    state: OrderState,
    transitions: Vec<OrderState>,
    cancel: Option<watch::Receiver<bool>>,
}

impl CertificateOrder {
    pub fn new(domain: &str, ctx: OrderContext) -> Self {
        Self {
            domain: domain.to_lowercase(),
            ctx,
            state: OrderState::Idle,
            transitions: vec![OrderState::Idle],
            cancel: None,
        }
    }

    /// Stop at the next wait once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn transitions(&self) -> &[OrderState] {
        &self.transitions
    }

    fn transition(&mut self, next: OrderState) {
        debug!(
            domain = %self.domain,
            from = self.state.as_str(),
            to = next.as_str(),
            "Order state transition"
        );
        self.state = next;
        self.transitions.push(next);
    }

    /// Drive the order to `Active` or `Failed`
    pub async fn run(&mut self) -> Result<Arc<StoredCertificate>> {
        let max_attempts = self.ctx.settings.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.transition(OrderState::Idle);
            }
            info!(domain = %self.domain, attempt, max_attempts, "Starting certificate issuance");

            match self.attempt().await {
                Ok(cert) => {
                    self.transition(OrderState::Active);
                    self.ctx
                        .alerts
                        .resolve(AlertKind::CertificateIssuanceFailed, &self.domain);
                    self.ctx
                        .alerts
                        .resolve(AlertKind::ProviderAuth, self.ctx.dns.name());
                    info!(
                        domain = %self.domain,
                        expires_at = %cert.meta.expires_at,
                        "Certificate issued"
                    );
                    return Ok(cert);
                }
                Err(e @ GatewayError::Cancelled(_)) => {
                    self.transition(OrderState::Failed);
                    info!(domain = %self.domain, "Issuance cancelled");
                    return Err(e);
                }
                Err(e) => {
                    warn!(domain = %self.domain, attempt, error = %e, "Issuance attempt failed");
                    if let GatewayError::ProviderAuth(reason) = &e {
                        self.ctx.alerts.raise(
                            AlertKind::ProviderAuth,
                            self.ctx.dns.name(),
                            Severity::Critical,
                            reason.clone(),
                        );
                    }
                    last_error = Some(e);
                    if attempt < max_attempts {
                        if let Err(cancelled) = self.pause(self.ctx.settings.cooldown(attempt)).await {
                            self.transition(OrderState::Failed);
                            return Err(cancelled);
                        }
                    }
                }
            }
        }

        self.transition(OrderState::Failed);
        let error = last_error
            .unwrap_or_else(|| GatewayError::Acme(format!("no attempt made for {}", self.domain)));
        error!(domain = %self.domain, attempts = max_attempts, error = %error, "Certificate issuance failed");
        self.ctx.alerts.raise(
            AlertKind::CertificateIssuanceFailed,
            &self.domain,
            Severity::Critical,
            format!("gave up after {} attempts: {}", max_attempts, error),
        );
        Err(error)
    }

    /// One pass from `Idle` to `CertificateIssued`
    async fn attempt(&mut self) -> Result<Arc<StoredCertificate>> {
        let ca = Arc::clone(&self.ctx.ca);
        let domain = self.domain.clone();
        let mut order = self
            .with_retries("create order", || ca.new_order(&domain))
            .await?;
        let challenge = order.dns_challenge().await?;
        self.transition(OrderState::ChallengeRequested);

        let Some(challenge) = challenge else {
            debug!(domain = %self.domain, "Authorization already valid, skipping DNS challenge");
            self.transition(OrderState::ChallengeValidated);
            return self.issue(order.as_mut()).await;
        };

        let record_name = challenge_record_name(&challenge.identifier);
        let dns = Arc::clone(&self.ctx.dns);
        let record_id = self
            .with_retries("create TXT record", || {
                dns.create_txt_record(&record_name, &challenge.record_value)
            })
            .await?;
        let mut guard = ChallengeRecordGuard::new(Arc::clone(&dns), &record_id, &self.domain);
        self.transition(OrderState::DnsRecordPublished);

        let result = self.validate_and_issue(order.as_mut(), &challenge).await;

        match self
            .with_retries("delete TXT record", || dns.delete_txt_record(&record_id))
            .await
        {
            Ok(()) => {
                guard.disarm();
                debug!(domain = %self.domain, record = %record_name, "Challenge record removed");
            }
            Err(e) => warn!(
                domain = %self.domain,
                record = %record_name,
                error = %e,
                "Failed to remove challenge record, retrying in the background"
            ),
        }

        result
    }

    async fn validate_and_issue(
        &mut self,
        order: &mut dyn PendingOrder,
        challenge: &DnsChallenge,
    ) -> Result<Arc<StoredCertificate>> {
        self.transition(OrderState::DnsPropagationWait);
        self.pause(self.ctx.settings.propagation_delay).await?;

        order.set_challenge_ready(challenge).await?;
        self.wait_for(order, |p| matches!(p, OrderProgress::Ready | OrderProgress::Valid))
            .await?;
        self.transition(OrderState::ChallengeValidated);

        self.issue(order).await
    }

    async fn issue(&mut self, order: &mut dyn PendingOrder) -> Result<Arc<StoredCertificate>> {
        let (csr_der, key_pem) = generate_csr(&self.domain)?;
        order.finalize(&csr_der).await?;
        self.wait_for(order, |p| matches!(p, OrderProgress::Valid)).await?;

        let chain = order.certificate().await?.ok_or_else(|| {
            GatewayError::Acme(format!("order for {} valid but no certificate returned", self.domain))
        })?;
        self.transition(OrderState::CertificateIssued);

        self.ctx
            .store
            .replace(&self.domain, &chain, &key_pem, &self.ctx.settings.resolver)
    }

    /// Poll until `done` holds, the order turns invalid, or polls run out.
    /// A transient poll failure uses up one poll.
    async fn wait_for(
        &self,
        order: &mut dyn PendingOrder,
        done: impl Fn(&OrderProgress) -> bool,
    ) -> Result<()> {
        for poll in 1..=self.ctx.settings.max_polls {
            match order.poll().await {
                Ok(progress) if done(&progress) => return Ok(()),
                Ok(OrderProgress::Invalid(reason)) => {
                    return Err(GatewayError::ChallengeValidationFailed {
                        domain: self.domain.clone(),
                        reason,
                    });
                }
                Ok(other) => debug!(domain = %self.domain, poll, status = ?other, "Waiting for CA"),
                Err(e) if e.is_transient() => {
                    warn!(domain = %self.domain, poll, error = %e, "Order poll failed")
                }
                Err(e) => return Err(e),
            }
            self.pause(self.ctx.settings.poll_interval).await?;
        }

        Err(GatewayError::ChallengeValidationFailed {
            domain: self.domain.clone(),
            reason: format!("no result after {} polls", self.ctx.settings.max_polls),
        })
    }

    /// Retry a call while it fails transiently, bounded by `max_retries`.
    /// A rate limit hint from the provider takes precedence over the backoff.
    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && retries < self.ctx.settings.max_retries => {
                    retries += 1;
                    let delay = match &e {
                        GatewayError::ProviderRateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => self.ctx.settings.retry_backoff.delay(retries),
                    };
                    warn!(
                        domain = %self.domain,
                        op,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    self.pause(delay).await?;
                }
                other => return other,
            }
        }
    }

    /// Sleep for `duration`, or fail with `Cancelled` once cancellation is signalled
    async fn pause(&self, duration: Duration) -> Result<()> {
        let Some(cancel) = &self.cancel else {
            tokio::time::sleep(duration).await;
            return Ok(());
        };
        if *cancel.borrow() {
            return Err(GatewayError::Cancelled(self.domain.clone()));
        }

        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            cancelled = async { cancel.wait_for(|c| *c).await.is_ok() } => {
                if cancelled {
                    return Err(GatewayError::Cancelled(self.domain.clone()));
                }
                // Sender gone: nobody can cancel any more
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

/// Fresh ECDSA P-256 key and CSR for `domain`: `(csr_der, key_pem)`
fn generate_csr(domain: &str) -> Result<(Vec<u8>, String)> {
    let acme_err = |e: rcgen::Error| GatewayError::Acme(format!("CSR generation failed: {}", e));

    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(acme_err)?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, domain.to_string());

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(acme_err)?;
    let csr = params.serialize_request(&key_pair).map_err(acme_err)?;
    Ok((csr.der().to_vec(), key_pair.serialize_pem()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::certs::self_signed_pem;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts TXT record calls; can fail creations with scripted errors
    #[derive(Default)]
    pub(crate) struct FakeDns {
        pub created: AtomicUsize,
        pub deleted: AtomicUsize,
        pub create_errors: Mutex<VecDeque<GatewayError>>,
    }

    #[async_trait]
    impl DnsProvider for FakeDns {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create_txt_record(&self, _record_name: &str, _value: &str) -> Result<String> {
            if let Some(err) = self.create_errors.lock().pop_front() {
                return Err(err);
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("rec-{}", n))
        }

        async fn delete_txt_record(&self, _record_id: &str) -> Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// CA whose orders validate, fail validation, or hang pending
    pub(crate) struct FakeCa {
        pub outcome: FakeOutcome,
        pub orders: AtomicUsize,
        pub delay: Duration,
    }

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum FakeOutcome {
        Issue,
        Invalid,
        NeverReady,
    }

    impl FakeCa {
        pub(crate) fn new(outcome: FakeOutcome) -> Self {
            Self {
                outcome,
                orders: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    struct FakeOrder {
        domain: String,
        outcome: FakeOutcome,
        finalized: bool,
        delay: Duration,
    }

    #[async_trait]
    impl CertificateAuthority for FakeCa {
        async fn new_order(&self, domain: &str) -> Result<Box<dyn PendingOrder>> {
            self.orders.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeOrder {
                domain: domain.to_string(),
                outcome: self.outcome,
                finalized: false,
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl PendingOrder for FakeOrder {
        async fn dns_challenge(&mut self) -> Result<Option<DnsChallenge>> {
            Ok(Some(DnsChallenge {
                identifier: self.domain.clone(),
                url: "https://ca.test/chall/1".to_string(),
                record_value: "digest".to_string(),
            }))
        }

        async fn set_challenge_ready(&mut self, _challenge: &DnsChallenge) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn poll(&mut self) -> Result<OrderProgress> {
            Ok(match (self.outcome, self.finalized) {
                (FakeOutcome::Invalid, _) => {
                    OrderProgress::Invalid("TXT record mismatch".to_string())
                }
                (FakeOutcome::NeverReady, _) => OrderProgress::Pending,
                (FakeOutcome::Issue, false) => OrderProgress::Ready,
                (FakeOutcome::Issue, true) => OrderProgress::Valid,
            })
        }

        async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
            assert!(!csr_der.is_empty());
            self.finalized = true;
            Ok(())
        }

        async fn certificate(&mut self) -> Result<Option<String>> {
            let (cert_pem, _) = self_signed_pem(&[self.domain.clone()], None)?;
            Ok(Some(cert_pem))
        }
    }

    pub(crate) fn fast_settings() -> OrderSettings {
        OrderSettings {
            propagation_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            max_polls: 3,
            max_attempts: 2,
            retry_cooldown: Duration::from_millis(1),
            max_retries: 2,
            retry_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            resolver: "letsencrypt".to_string(),
        }
    }

    pub(crate) fn context(dns: Arc<FakeDns>, ca: Arc<FakeCa>) -> OrderContext {
        OrderContext {
            dns,
            ca,
            store: Arc::new(CertificateStore::in_memory()),
            alerts: Arc::new(AlertRegistry::new()),
            settings: fast_settings(),
        }
    }

    #[tokio::test]
    async fn test_successful_issuance_walks_every_state() {
        let dns = Arc::new(FakeDns::default());
        let ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::Issue)));
        let store = ctx.store.clone();

        let mut order = CertificateOrder::new("api.example.com", ctx);
        let cert = order.run().await.unwrap();

        assert_eq!(cert.meta.domain, "api.example.com");
        assert_eq!(cert.meta.resolver, "letsencrypt");
        assert!(store.get("api.example.com").is_some());
        assert_eq!(
            order.transitions(),
            &[
                OrderState::Idle,
                OrderState::ChallengeRequested,
                OrderState::DnsRecordPublished,
                OrderState::DnsPropagationWait,
                OrderState::ChallengeValidated,
                OrderState::CertificateIssued,
                OrderState::Active,
            ]
        );
        assert_eq!(dns.created.load(Ordering::SeqCst), 1);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_challenge_cleans_up_and_fails_with_alert() {
        let dns = Arc::new(FakeDns::default());
        let ca = Arc::new(FakeCa::new(FakeOutcome::Invalid));
        let ctx = context(dns.clone(), ca.clone());
        let alerts = ctx.alerts.clone();
        let store = ctx.store.clone();

        let mut order = CertificateOrder::new("api.example.com", ctx);
        let err = order.run().await.unwrap_err();

        assert!(matches!(err, GatewayError::ChallengeValidationFailed { .. }));
        assert_eq!(order.state(), OrderState::Failed);
        assert_eq!(ca.orders.load(Ordering::SeqCst), 2);
        assert_eq!(dns.created.load(Ordering::SeqCst), 2);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 2);
        assert!(alerts.is_active(AlertKind::CertificateIssuanceFailed, "api.example.com"));
        assert!(store.get("api.example.com").is_none());
    }

    #[tokio::test]
    async fn test_poll_exhaustion_cleans_up() {
        let dns = Arc::new(FakeDns::default());
        let ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::NeverReady)));

        let mut order = CertificateOrder::new("api.example.com", ctx);
        assert!(order.run().await.is_err());
        assert_eq!(
            dns.created.load(Ordering::SeqCst),
            dns.deleted.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let dns = Arc::new(FakeDns::default());
        dns.create_errors
            .lock()
            .push_back(GatewayError::ProviderRateLimited { retry_after: None });
        let ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::Issue)));

        let mut order = CertificateOrder::new("api.example.com", ctx);
        order.run().await.unwrap();
        assert_eq!(dns.created.load(Ordering::SeqCst), 1);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_provider_error_is_retried_within_attempt() {
        let dns = Arc::new(FakeDns::default());
        {
            let mut errors = dns.create_errors.lock();
            errors.push_back(GatewayError::Provider("502 Bad Gateway".to_string()));
            errors.push_back(GatewayError::Provider("connection reset".to_string()));
        }
        let ca = Arc::new(FakeCa::new(FakeOutcome::Issue));
        let ctx = context(dns.clone(), ca.clone());

        let mut order = CertificateOrder::new("api.example.com", ctx);
        order.run().await.unwrap();
        assert_eq!(ca.orders.load(Ordering::SeqCst), 1);
        assert_eq!(dns.created.load(Ordering::SeqCst), 1);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_beyond_retry_budget_fail_the_attempt() {
        let dns = Arc::new(FakeDns::default());
        {
            let mut errors = dns.create_errors.lock();
            for _ in 0..3 {
                errors.push_back(GatewayError::Provider("503 Service Unavailable".to_string()));
            }
        }
        let ca = Arc::new(FakeCa::new(FakeOutcome::Issue));
        let ctx = context(dns.clone(), ca.clone());

        // Three failures exhaust the two retries of the first attempt; the second attempt succeeds
        let mut order = CertificateOrder::new("api.example.com", ctx);
        order.run().await.unwrap();
        assert_eq!(ca.orders.load(Ordering::SeqCst), 2);
        assert_eq!(dns.created.load(Ordering::SeqCst), 1);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_propagation_wait_removes_record() {
        let dns = Arc::new(FakeDns::default());
        let mut ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::Issue)));
        ctx.settings.propagation_delay = Duration::from_secs(60);
        let alerts = ctx.alerts.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut order = CertificateOrder::new("api.example.com", ctx).with_cancel(cancel_rx);
            let result = order.run().await;
            (result, order.state())
        });
        while dns.created.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel_tx.send(true).unwrap();

        let (result, state) = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Cancelled(_))));
        assert_eq!(state, OrderState::Failed);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
        assert!(!alerts.is_active(AlertKind::CertificateIssuanceFailed, "api.example.com"));
    }

    #[tokio::test]
    async fn test_dropped_order_still_removes_record() {
        let dns = Arc::new(FakeDns::default());
        let mut ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::Issue)));
        ctx.settings.propagation_delay = Duration::from_secs(60);

        let handle = tokio::spawn(async move {
            let mut order = CertificateOrder::new("api.example.com", ctx);
            let _ = order.run().await;
        });
        while dns.created.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let removed = tokio::time::timeout(Duration::from_secs(2), async {
            while dns.deleted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(removed.is_ok(), "challenge record left behind");
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_auth_raises_alert_and_creates_nothing() {
        let dns = Arc::new(FakeDns::default());
        {
            let mut errors = dns.create_errors.lock();
            errors.push_back(GatewayError::ProviderAuth("401".to_string()));
            errors.push_back(GatewayError::ProviderAuth("401".to_string()));
        }
        let ctx = context(dns.clone(), Arc::new(FakeCa::new(FakeOutcome::Issue)));
        let alerts = ctx.alerts.clone();

        let mut order = CertificateOrder::new("api.example.com", ctx);
        let err = order.run().await.unwrap_err();

        assert!(matches!(err, GatewayError::ProviderAuth(_)));
        assert!(alerts.is_active(AlertKind::ProviderAuth, "fake"));
        assert_eq!(dns.created.load(Ordering::SeqCst), 0);
        assert_eq!(dns.deleted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_csr_generation() {
        let (der, key_pem) = generate_csr("*.example.com").unwrap();
        assert!(!der.is_empty());
        assert!(key_pem.contains("PRIVATE KEY"));
    }
}
