//! Service discovery
//!
//! A [`DiscoverySource`] yields [`ServiceEvent`]s. The [`DiscoveryWatcher`]
//! turns each descriptor's labels into routes and upstream targets, diffs
//! them against what that descriptor produced before, and applies the
//! result to the route table in one swap.
//!
//! When the source errors or its stream ends, the watcher reconnects with
//! exponential backoff and keeps serving the last known routes. Once it has
//! been out of contact for longer than the staleness ceiling, the table is
//! flagged degraded (routes are kept) until contact is restored.

pub mod docker;
pub mod labels;
pub mod static_source;

use crate::alerts::{AlertKind, AlertRegistry, Severity};
use crate::backoff::Backoff;
use crate::error::Result;
use crate::routing::{Route, RouteDiff, RouteKey, RouteTable};
use crate::upstream::{ServiceTarget, UpstreamRegistry};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use labels::{parse_service, LabelConfig};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use docker::DockerSource;
pub use static_source::StaticSource;

/// A running service as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Stable id (container id, or `static:<name>`)
    pub id: String,
    /// Service / container name, the fallback upstream service name
    pub name: String,
    /// Address the gateway reaches the service on
    pub address: String,
    /// Port used when no service port label is present
    pub default_port: Option<u16>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Full current state; descriptors not listed are gone
    Snapshot(Vec<ServiceDescriptor>),
    Upsert(ServiceDescriptor),
    /// Descriptor id that disappeared
    Remove(String),
}

pub type EventStream = BoxStream<'static, Result<ServiceEvent>>;

/// Something that reports services and their routing labels
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    /// Connect and stream events, starting with a `Snapshot`
    async fn watch(&self) -> Result<EventStream>;
}

/// What one descriptor currently contributes
#[derive(Debug, Default)]
struct Contribution {
    routes: HashMap<RouteKey, Route>,
    targets: Vec<ServiceTarget>,
    seq: u64,
}

pub struct DiscoveryWatcher {
    source: Arc<dyn DiscoverySource>,
    labels: LabelConfig,
    routes: Arc<RouteTable>,
    registry: Arc<UpstreamRegistry>,
    alerts: Arc<AlertRegistry>,
    backoff: Backoff,
    staleness_ceiling: Duration,
    contributions: HashMap<String, Contribution>,
    seq: u64,
    last_contact: Instant,
    degraded: bool,
}

impl DiscoveryWatcher {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        labels: LabelConfig,
        routes: Arc<RouteTable>,
        registry: Arc<UpstreamRegistry>,
        alerts: Arc<AlertRegistry>,
    ) -> Self {
        Self {
            source,
            labels,
            routes,
            registry,
            alerts,
            backoff: Backoff::default(),
            staleness_ceiling: Duration::from_secs(300),
            contributions: HashMap::new(),
            seq: 0,
            last_contact: Instant::now(),
            degraded: false,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_staleness_ceiling(mut self, ceiling: Duration) -> Self {
        self.staleness_ceiling = ceiling;
        self
    }

    /// Follow the source until shutdown, reconnecting on failure
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(source = self.source.name(), prefix = %self.labels.prefix, "Discovery watcher started");
        let mut attempt: u32 = 0;

        loop {
            match self.source.watch().await {
                Ok(mut stream) => {
                    attempt = 0;
                    self.mark_contact();
                    debug!(source = self.source.name(), "Discovery source connected");

                    loop {
                        tokio::select! {
                            next = stream.next() => match next {
                                Some(Ok(event)) => {
                                    self.mark_contact();
                                    self.handle_event(event);
                                }
                                Some(Err(e)) => {
                                    warn!(source = self.source.name(), error = %e, "Discovery stream failed");
                                    break;
                                }
                                None => {
                                    warn!(source = self.source.name(), "Discovery stream ended");
                                    break;
                                }
                            },
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    info!("Discovery watcher shutting down");
                                    return;
                                }
                            }
                        }
                    }
                    // Contact lost: staleness counts from here
                    self.last_contact = Instant::now();
                }
                Err(e) => {
                    warn!(source = self.source.name(), error = %e, attempt, "Discovery source unavailable");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay(attempt);
            self.check_staleness();
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting to discovery source");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Discovery watcher shutting down");
                        return;
                    }
                }
            }
            self.check_staleness();
        }
    }

    fn mark_contact(&mut self) {
        self.last_contact = Instant::now();
        if self.degraded {
            self.degraded = false;
            self.routes.set_degraded(false);
            self.alerts
                .resolve(AlertKind::DiscoveryDegraded, self.source.name());
            info!(source = self.source.name(), "Discovery recovered, routes no longer degraded");
        }
    }

    fn check_staleness(&mut self) {
        let silent = self.last_contact.elapsed();
        if !self.degraded && silent > self.staleness_ceiling {
            self.degraded = true;
            self.routes.set_degraded(true);
            self.alerts.raise(
                AlertKind::DiscoveryDegraded,
                self.source.name(),
                Severity::Warning,
                format!(
                    "no contact for {}s, serving last known routes",
                    silent.as_secs()
                ),
            );
        }
    }

    /// Apply one event to the registry and route table
    pub fn handle_event(&mut self, event: ServiceEvent) {
        let changes: Vec<(String, Option<ServiceDescriptor>)> = match event {
            ServiceEvent::Snapshot(descriptors) => {
                let present: HashSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
                let mut changes: Vec<(String, Option<ServiceDescriptor>)> = self
                    .contributions
                    .keys()
                    .filter(|id| !present.contains(id.as_str()))
                    .map(|id| (id.clone(), None))
                    .collect();
                changes.extend(descriptors.into_iter().map(|d| (d.id.clone(), Some(d))));
                changes
            }
            ServiceEvent::Upsert(desc) => vec![(desc.id.clone(), Some(desc))],
            ServiceEvent::Remove(id) => vec![(id, None)],
        };
        self.apply_changes(changes);
    }

    fn apply_changes(&mut self, changes: Vec<(String, Option<ServiceDescriptor>)>) {
        let mut affected: HashSet<RouteKey> = HashSet::new();

        for (id, desc) in changes {
            let previous = self.contributions.remove(&id);
            let parsed = desc.map(|d| parse_service(&d, &self.labels));

            if let Some(prev) = &previous {
                affected.extend(prev.routes.keys().cloned());
                for target in &prev.targets {
                    let kept = parsed
                        .as_ref()
                        .is_some_and(|p| p.targets.iter().any(|t| t.name == target.name));
                    if !kept {
                        self.registry.unregister(&target.name, &target.id);
                    }
                }
            }

            let Some(parsed) = parsed else {
                if previous.is_some() {
                    debug!(id = %id, "Service removed");
                }
                continue;
            };
            if parsed.routes.is_empty() && parsed.targets.is_empty() {
                continue;
            }

            for target in &parsed.targets {
                self.registry.register(target.clone());
            }
            self.seq += 1;
            let routes: HashMap<RouteKey, Route> =
                parsed.routes.into_iter().map(|r| (r.key(), r)).collect();
            affected.extend(routes.keys().cloned());
            self.contributions.insert(
                id,
                Contribution {
                    routes,
                    targets: parsed.targets,
                    seq: self.seq,
                },
            );
        }

        let diff = self.diff_for(affected);
        if !diff.is_empty() {
            info!(
                upserts = diff.upserts.len(),
                removals = diff.removals.len(),
                "Applying route changes"
            );
            self.routes.apply(diff);
        }
    }

    /// For each affected key, the most recent contributor wins; no contributor removes it
    fn diff_for(&self, affected: HashSet<RouteKey>) -> RouteDiff {
        let snapshot = self.routes.snapshot();
        let mut diff = RouteDiff::default();

        for key in affected {
            let winner = self
                .contributions
                .values()
                .filter_map(|c| c.routes.get(&key).map(|r| (c.seq, r)))
                .max_by_key(|(seq, _)| *seq)
                .map(|(_, r)| r);

            match (winner, snapshot.get(&key)) {
                (Some(route), Some(current)) if same_route(route, current) => {}
                (Some(route), _) => diff.upserts.push(route.clone()),
                (None, Some(_)) => diff.removals.push(key),
                (None, None) => {}
            }
        }
        diff
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

fn same_route(a: &Route, b: &Route) -> bool {
    Route {
        updated_seq: b.updated_seq,
        ..a.clone()
    } == *b
}
