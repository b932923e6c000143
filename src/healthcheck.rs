//! Active health checks for upstream targets
//!
//! Each round probes every registered target (TCP connect, or an HTTP GET
//! when a path is configured). A probe that does not finish within the
//! timeout counts as a failure. Targets move to unhealthy after
//! `failure_threshold` consecutive failures and back after
//! `success_threshold` consecutive successes.

use crate::config::HealthConfig;
use crate::upstream::{HealthState, ServiceTarget, UpstreamRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health check rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub success_threshold: u32,
    /// Path for HTTP health checks; TCP connect when `None`
    pub path: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
            success_threshold: 1,
            path: None,
        }
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            failure_threshold: config.unhealthy_threshold,
            success_threshold: config.healthy_threshold,
            path: config.path.clone(),
        }
    }
}

/// Consecutive probe results for one target
#[derive(Debug, Default)]
struct ProbeCounters {
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl ProbeCounters {
    /// Record a probe result; returns the new state on a transition
    fn record(
        &mut self,
        current: HealthState,
        passed: bool,
        config: &HealthCheckConfig,
    ) -> Option<HealthState> {
        if passed {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if current != HealthState::Healthy
                && self.consecutive_successes >= config.success_threshold
            {
                return Some(HealthState::Healthy);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if current != HealthState::Unhealthy
                && self.consecutive_failures >= config.failure_threshold
            {
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }
}

/// Health checker that probes every registered upstream target
pub struct HealthChecker {
    registry: Arc<UpstreamRegistry>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
    /// Keyed by (service, id, authority) so a moved target starts over
    counters: HashMap<(String, String, String), ProbeCounters>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            config,
            shutdown_rx,
            counters: HashMap::new(),
        }
    }

    /// Run the health checker until shutdown
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_ms = self.config.timeout.as_millis() as u64,
            mode = if self.config.path.is_some() { "http" } else { "tcp" },
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.check_all().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every registered target once
    pub async fn check_all(&mut self) {
        let targets = self.registry.targets();

        let probes = targets.iter().map(|target| {
            let config = &self.config;
            async move { (target, probe(target, config).await) }
        });
        let results = futures::future::join_all(probes).await;

        for (target, passed) in results {
            let authority = target.authority();
            let key = (target.name.clone(), target.id.clone(), authority.clone());
            let counters = self.counters.entry(key).or_default();
            let Some(next) = counters.record(target.health, passed, &self.config) else {
                continue;
            };
            if self
                .registry
                .set_health_at(&target.name, &target.id, &authority, next)
                .is_none()
            {
                debug!(
                    service = %target.name,
                    target_id = %target.id,
                    address = %authority,
                    "Target changed during health check, result dropped"
                );
                continue;
            }
            match next {
                HealthState::Unhealthy => warn!(
                    service = %target.name,
                    target_id = %target.id,
                    address = %authority,
                    failures = counters.consecutive_failures,
                    "Upstream target is now unhealthy"
                ),
                _ => info!(
                    service = %target.name,
                    target_id = %target.id,
                    address = %authority,
                    "Upstream target is now healthy"
                ),
            }
        }

        // Forget counters of targets that were unregistered or moved
        let live: HashSet<(String, String, String)> = self
            .registry
            .targets()
            .into_iter()
            .map(|t| {
                let authority = t.authority();
                (t.name, t.id, authority)
            })
            .collect();
        self.counters.retain(|key, _| live.contains(key));
    }
}

/// Probe a single target, returning whether it passed
async fn probe(target: &ServiceTarget, config: &HealthCheckConfig) -> bool {
    let addr = target.authority();
    let check = async {
        let mut stream = TcpStream::connect(&addr).await?;
        match &config.path {
            None => Ok::<bool, std::io::Error>(true),
            Some(path) => {
                let request = format!(
                    "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: edgegate-health\r\nConnection: close\r\n\r\n",
                    path, addr
                );
                stream.write_all(request.as_bytes()).await?;
                let mut buf = [0u8; 64];
                let n = stream.read(&mut buf).await?;
                Ok(status_is_healthy(&buf[..n]))
            }
        }
    };

    match tokio::time::timeout(config.timeout, check).await {
        Ok(Ok(true)) => {
            debug!(address = %addr, "Health check passed");
            true
        }
        Ok(Ok(false)) => {
            debug!(address = %addr, "Health check failed (bad status)");
            false
        }
        Ok(Err(e)) => {
            debug!(address = %addr, error = %e, "Health check failed (connection error)");
            false
        }
        Err(_) => {
            debug!(address = %addr, "Health check failed (timeout)");
            false
        }
    }
}

/// 2xx and 3xx responses count as healthy
fn status_is_healthy(head: &[u8]) -> bool {
    let line = String::from_utf8_lossy(head);
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..400).contains(&code))
}

/// Builder for configuring and running the health checker
pub struct HealthCheckerBuilder {
    registry: Option<Arc<UpstreamRegistry>>,
    config: HealthCheckConfig,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl HealthCheckerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            config: HealthCheckConfig::default(),
            shutdown_rx: None,
        }
    }

    pub fn registry(mut self, registry: Arc<UpstreamRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: HealthCheckConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shutdown_receiver(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    pub fn build(self) -> Option<HealthChecker> {
        Some(HealthChecker::new(
            self.registry?,
            self.config,
            self.shutdown_rx?,
        ))
    }
}

impl Default for HealthCheckerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
