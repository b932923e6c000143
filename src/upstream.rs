//! Upstream service targets and healthy-target selection
//!
//! Targets are registered by the discovery watcher and marked healthy or
//! unhealthy by the health checker. Unhealthy targets stay registered and
//! are skipped by [`UpstreamRegistry::select`] until they recover.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Health of a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not checked yet; still eligible for traffic
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn is_selectable(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

/// One reachable instance of an upstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceTarget {
    /// Stable identifier (container id, or `static:<service>`)
    pub id: String,
    /// Service name routes refer to
    pub name: String,
    /// Host name or IP on the internal network
    pub address: String,
    pub upstream_port: u16,
    pub health: HealthState,
}

impl ServiceTarget {
    pub fn new(id: &str, name: &str, address: &str, upstream_port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            upstream_port,
            health: HealthState::Unknown,
        }
    }

    /// `address:port` for building upstream URIs
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.upstream_port)
    }
}

/// Why no target could be selected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("service '{0}' has no registered targets")]
    NoTargets(String),
    #[error("all targets of service '{0}' are unhealthy")]
    AllUnhealthy(String),
}

/// Round-robin balancer for one service
#[derive(Debug)]
struct ServiceBalancer {
    targets: RwLock<Vec<ServiceTarget>>,
    next: AtomicUsize,
}

impl ServiceBalancer {
    fn new() -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }
}

/// All upstream services known to the gateway
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    services: DashMap<String, Arc<ServiceBalancer>>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target, or update address/port of an existing one (health is kept)
    pub fn register(&self, target: ServiceTarget) {
        let balancer = Arc::clone(
            self.services
                .entry(target.name.clone())
                .or_insert_with(|| Arc::new(ServiceBalancer::new()))
                .value(),
        );
        let mut targets = balancer.targets.write();
        match targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => {
                if existing.address != target.address || existing.upstream_port != target.upstream_port {
                    debug!(
                        service = %target.name,
                        target_id = %target.id,
                        address = %target.address,
                        port = target.upstream_port,
                        "Updated upstream target"
                    );
                    existing.address = target.address;
                    existing.upstream_port = target.upstream_port;
                    existing.health = HealthState::Unknown;
                }
            }
            None => {
                info!(
                    service = %target.name,
                    target_id = %target.id,
                    address = %target.address,
                    port = target.upstream_port,
                    total_targets = targets.len() + 1,
                    "Registered upstream target"
                );
                targets.push(target);
            }
        }
    }

    /// Remove a target; the service entry is dropped with its last target
    pub fn unregister(&self, service: &str, id: &str) -> bool {
        let Some(balancer) = self.services.get(service).map(|b| Arc::clone(b.value())) else {
            return false;
        };
        let removed = {
            let mut targets = balancer.targets.write();
            let before = targets.len();
            targets.retain(|t| t.id != id);
            before != targets.len()
        };
        if removed {
            info!(service, target_id = id, "Unregistered upstream target");
            self.services
                .remove_if(service, |_, b| b.targets.read().is_empty());
        }
        removed
    }

    /// Pick the next selectable target of a service
    pub fn select(&self, service: &str) -> Result<ServiceTarget, SelectError> {
        let balancer = self
            .services
            .get(service)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| SelectError::NoTargets(service.to_string()))?;

        let targets = balancer.targets.read();
        if targets.is_empty() {
            return Err(SelectError::NoTargets(service.to_string()));
        }
        let selectable: Vec<&ServiceTarget> =
            targets.iter().filter(|t| t.health.is_selectable()).collect();
        if selectable.is_empty() {
            return Err(SelectError::AllUnhealthy(service.to_string()));
        }

        let idx = balancer.next.fetch_add(1, Ordering::Relaxed) % selectable.len();
        Ok(selectable[idx].clone())
    }

    /// Record a health transition; returns the previous state if the target exists
    pub fn set_health(&self, service: &str, id: &str, health: HealthState) -> Option<HealthState> {
        let balancer = self.services.get(service).map(|b| Arc::clone(b.value()))?;
        let mut targets = balancer.targets.write();
        let target = targets.iter_mut().find(|t| t.id == id)?;
        let previous = target.health;
        target.health = health;
        Some(previous)
    }

    /// Record a health check outcome taken against `authority`
    ///
    /// Returns `None`, leaving the registry untouched, when the target is gone
    /// or has been re-registered at another address since the check started.
    pub fn set_health_at(
        &self,
        service: &str,
        id: &str,
        authority: &str,
        health: HealthState,
    ) -> Option<HealthState> {
        let balancer = self.services.get(service).map(|b| Arc::clone(b.value()))?;
        let mut targets = balancer.targets.write();
        let target = targets
            .iter_mut()
            .find(|t| t.id == id && t.authority() == authority)?;
        let previous = target.health;
        target.health = health;
        Some(previous)
    }

    /// Snapshot of every target, sorted by service then id
    pub fn targets(&self) -> Vec<ServiceTarget> {
        let mut all: Vec<ServiceTarget> = self
            .services
            .iter()
            .flat_map(|entry| entry.value().targets.read().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    pub fn healthy_count(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map(|b| b.targets.read().iter().filter(|t| t.health.is_selectable()).count())
            .unwrap_or(0)
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
