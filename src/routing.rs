//! Route table
//!
//! Readers load an immutable [`RouteSnapshot`] through `ArcSwap` and never
//! block; writers build a complete new snapshot and swap it in, so a
//! batched diff is observed either entirely or not at all.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Listener a route is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    /// Plain HTTP (port 80)
    Web,
    /// TLS-terminated HTTPS (port 443)
    Websecure,
}

impl EntryPoint {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "web" | "http" => Some(EntryPoint::Web),
            "websecure" | "https" => Some(EntryPoint::Websecure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Web => "web",
            EntryPoint::Websecure => "websecure",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single host → service mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Router name the route was declared under
    pub name: String,
    /// Normalized host pattern, exact or `*.` wildcard
    pub host_pattern: String,
    pub entry_point: EntryPoint,
    /// Upstream service whose healthy targets receive the traffic
    pub service: String,
    /// Upstream URL the route was derived with, reported by the admin API
    pub target_url: String,
    pub path_prefix: Option<String>,
    /// Name of the certificate resolver that should cover this host
    pub tls_cert_resolver: Option<String>,
    /// Identifier of the discovery source entry that produced the route
    pub source: String,
    /// Assigned by the table; higher means more recently updated
    #[serde(default)]
    pub updated_seq: u64,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.host_pattern, self.entry_point)
    }

    pub fn is_wildcard(&self) -> bool {
        self.host_pattern.starts_with("*.")
    }

    /// Check the host part of this route against a normalized hostname
    pub fn matches_host(&self, hostname: &str) -> bool {
        match self.host_pattern.strip_prefix('*') {
            Some(suffix) => hostname.len() > suffix.len() && hostname.ends_with(suffix),
            None => self.host_pattern == hostname,
        }
    }

    pub fn matches_path(&self, path: &str) -> bool {
        match &self.path_prefix {
            Some(prefix) => path.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Uniqueness key of a route: host pattern + entry point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteKey {
    pub host_pattern: String,
    pub entry_point: EntryPoint,
}

impl RouteKey {
    pub fn new(host_pattern: &str, entry_point: EntryPoint) -> Self {
        Self {
            host_pattern: host_pattern.to_ascii_lowercase(),
            entry_point,
        }
    }
}

/// A batch of changes applied in one swap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    /// Routes to add or replace
    pub upserts: Vec<Route>,
    /// Routes to delete
    pub removals: Vec<RouteKey>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Returned by [`RouteTable::resolve`] when nothing matches
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no route for host '{host}' on entry point {entry_point}")]
pub struct RouteNotFound {
    pub host: String,
    pub entry_point: EntryPoint,
}

/// Immutable view of the routing table
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    routes: HashMap<RouteKey, Arc<Route>>,
    /// Wildcard routes ordered by suffix length (desc) then recency (desc)
    wildcards: Vec<Arc<Route>>,
    generation: u64,
    degraded: bool,
}

impl RouteSnapshot {
    fn build(routes: HashMap<RouteKey, Arc<Route>>, generation: u64, degraded: bool) -> Self {
        let mut wildcards: Vec<Arc<Route>> =
            routes.values().filter(|r| r.is_wildcard()).cloned().collect();
        wildcards.sort_by(|a, b| {
            b.host_pattern
                .len()
                .cmp(&a.host_pattern.len())
                .then(b.updated_seq.cmp(&a.updated_seq))
                .then(a.host_pattern.cmp(&b.host_pattern))
        });
        Self {
            routes,
            wildcards,
            generation,
            degraded,
        }
    }

    /// Exact match first, then the longest matching wildcard
    pub fn resolve(&self, host: &str, entry_point: EntryPoint) -> Result<Arc<Route>, RouteNotFound> {
        self.find(host, entry_point, |_| true)
    }

    /// Like [`resolve`](Self::resolve) but also honors route path prefixes
    pub fn resolve_request(
        &self,
        host: &str,
        path: &str,
        entry_point: EntryPoint,
    ) -> Result<Arc<Route>, RouteNotFound> {
        self.find(host, entry_point, |route| route.matches_path(path))
    }

    fn find(
        &self,
        host: &str,
        entry_point: EntryPoint,
        accept: impl Fn(&Route) -> bool,
    ) -> Result<Arc<Route>, RouteNotFound> {
        let host = host.to_ascii_lowercase();

        if let Some(route) = self.routes.get(&RouteKey::new(&host, entry_point)) {
            if accept(route) {
                return Ok(Arc::clone(route));
            }
        }

        self.wildcards
            .iter()
            .find(|r| r.entry_point == entry_point && r.matches_host(&host) && accept(r))
            .cloned()
            .ok_or(RouteNotFound { host, entry_point })
    }

    pub fn get(&self, key: &RouteKey) -> Option<&Arc<Route>> {
        self.routes.get(key)
    }

    /// All routes, sorted by host then entry point
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| {
            a.host_pattern
                .cmp(&b.host_pattern)
                .then(a.entry_point.as_str().cmp(b.entry_point.as_str()))
        });
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Incremented on every swap
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Set when the discovery source has been unreachable past its staleness ceiling
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Concurrent route table with atomic whole-table replacement
pub struct RouteTable {
    current: ArcSwap<RouteSnapshot>,
    /// Serializes writers; readers never take it
    writer: Mutex<u64>,
    /// Generation of the last route swap
    changes: watch::Sender<u64>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::default()),
            writer: Mutex::new(0),
            changes: watch::channel(0).0,
        }
    }

    /// Notified with the new generation after every swap that changed routes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Current snapshot; cheap and lock-free
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    pub fn resolve(&self, host: &str, entry_point: EntryPoint) -> Result<Arc<Route>, RouteNotFound> {
        self.current.load().resolve(host, entry_point)
    }

    pub fn resolve_request(
        &self,
        host: &str,
        path: &str,
        entry_point: EntryPoint,
    ) -> Result<Arc<Route>, RouteNotFound> {
        self.current.load().resolve_request(host, path, entry_point)
    }

    pub fn upsert_route(&self, route: Route) {
        self.apply(RouteDiff {
            upserts: vec![route],
            removals: Vec::new(),
        });
    }

    /// Remove a route; returns whether it existed
    pub fn remove_route(&self, host_pattern: &str, entry_point: EntryPoint) -> bool {
        let key = RouteKey::new(host_pattern, entry_point);
        if self.current.load().get(&key).is_none() {
            return false;
        }
        self.apply(RouteDiff {
            upserts: Vec::new(),
            removals: vec![key],
        });
        true
    }

    /// Apply removals then upserts as a single atomic swap
    pub fn apply(&self, diff: RouteDiff) {
        if diff.is_empty() {
            return;
        }

        let mut seq = self.writer.lock();
        let current = self.current.load_full();
        let mut routes = current.routes.clone();

        for key in &diff.removals {
            routes.remove(key);
        }
        for mut route in diff.upserts {
            *seq += 1;
            route.host_pattern = route.host_pattern.to_ascii_lowercase();
            route.updated_seq = *seq;
            routes.insert(route.key(), Arc::new(route));
        }

        let next = RouteSnapshot::build(routes, current.generation + 1, current.degraded);
        debug!(
            generation = next.generation,
            routes = next.len(),
            "Route table swapped"
        );
        let generation = next.generation;
        self.current.store(Arc::new(next));
        self.changes.send_replace(generation);
    }

    /// Flag the table as degraded (routes are kept and still resolve)
    pub fn set_degraded(&self, degraded: bool) {
        let _guard = self.writer.lock();
        let current = self.current.load_full();
        if current.degraded == degraded {
            return;
        }
        let next = RouteSnapshot::build(current.routes.clone(), current.generation + 1, degraded);
        self.current.store(Arc::new(next));
    }

    pub fn is_degraded(&self) -> bool {
        self.current.load().is_degraded()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_route(host: &str, entry_point: EntryPoint, service: &str) -> Route {
    Route {
        name: service.to_string(),
        host_pattern: host.to_string(),
        entry_point,
        service: service.to_string(),
        target_url: format!("http://{}:8000", service),
        path_prefix: None,
        tls_cert_resolver: None,
        source: "test".to_string(),
        updated_seq: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_exact_host_match() {
        let table = RouteTable::new();
        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "backend"));

        let route = table.resolve("api.example.com", EntryPoint::Websecure).unwrap();
        assert_eq!(route.service, "backend");

        let err = table.resolve("other.example.com", EntryPoint::Websecure).unwrap_err();
        assert_eq!(err.host, "other.example.com");
    }

    #[test]
    fn test_entry_points_are_separate() {
        let table = RouteTable::new();
        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "backend"));
        assert!(table.resolve("api.example.com", EntryPoint::Web).is_err());
    }

    #[test]
    fn test_exact_beats_wildcard_and_longest_wildcard_wins() {
        let table = RouteTable::new();
        table.upsert_route(test_route("*.example.com", EntryPoint::Websecure, "catchall"));
        table.upsert_route(test_route("*.eu.example.com", EntryPoint::Websecure, "eu"));
        table.upsert_route(test_route("api.eu.example.com", EntryPoint::Websecure, "api"));

        let resolve = |h| table.resolve(h, EntryPoint::Websecure).unwrap().service.clone();
        assert_eq!(resolve("api.eu.example.com"), "api");
        assert_eq!(resolve("web.eu.example.com"), "eu");
        assert_eq!(resolve("web.example.com"), "catchall");
        assert!(table.resolve("example.com", EntryPoint::Websecure).is_err());
        assert!(table.resolve("badexample.com", EntryPoint::Websecure).is_err());
    }

    #[test]
    fn test_upsert_replaces_and_bumps_recency() {
        let table = RouteTable::new();
        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "v1"));
        let first = table.resolve("api.example.com", EntryPoint::Websecure).unwrap();
        table.upsert_route(test_route("API.example.com", EntryPoint::Websecure, "v2"));
        let second = table.resolve("api.example.com", EntryPoint::Websecure).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(second.service, "v2");
        assert!(second.updated_seq > first.updated_seq);
    }

    #[test]
    fn test_remove_route() {
        let table = RouteTable::new();
        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "backend"));
        assert!(table.remove_route("api.example.com", EntryPoint::Websecure));
        assert!(!table.remove_route("api.example.com", EntryPoint::Websecure));
        assert!(table.is_empty());
    }

    #[test]
    fn test_path_prefix_resolution() {
        let table = RouteTable::new();
        let mut api = test_route("example.com", EntryPoint::Websecure, "api");
        api.path_prefix = Some("/api".to_string());
        table.upsert_route(api);
        table.upsert_route(test_route("*.com", EntryPoint::Websecure, "fallback"));

        let hit = table
            .resolve_request("example.com", "/api/users", EntryPoint::Websecure)
            .unwrap();
        assert_eq!(hit.service, "api");

        let miss = table
            .resolve_request("example.com", "/static", EntryPoint::Websecure)
            .unwrap();
        assert_eq!(miss.service, "fallback");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let table = RouteTable::new();
        for i in 0..20 {
            table.upsert_route(test_route(
                &format!("*.zone{}.example.com", i % 4),
                EntryPoint::Websecure,
                &format!("svc{}", i),
            ));
        }
        table.upsert_route(test_route("*.example.com", EntryPoint::Websecure, "root"));

        let snapshot = table.snapshot();
        let first = snapshot
            .resolve("a.zone2.example.com", EntryPoint::Websecure)
            .unwrap();
        for _ in 0..100 {
            let again = snapshot
                .resolve("a.zone2.example.com", EntryPoint::Websecure)
                .unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[test]
    fn test_degraded_flag_keeps_routes() {
        let table = RouteTable::new();
        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "backend"));
        table.set_degraded(true);

        assert!(table.is_degraded());
        assert!(table.resolve("api.example.com", EntryPoint::Websecure).is_ok());

        table.upsert_route(test_route("new.example.com", EntryPoint::Websecure, "backend"));
        assert!(table.is_degraded());

        table.set_degraded(false);
        assert!(!table.is_degraded());
    }

    #[tokio::test]
    async fn test_swaps_notify_subscribers() {
        let table = RouteTable::new();
        let mut changes = table.subscribe();
        assert!(!changes.has_changed().unwrap());

        table.upsert_route(test_route("api.example.com", EntryPoint::Websecure, "backend"));
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), table.snapshot().generation());

        assert!(!table.remove_route("missing.example.com", EntryPoint::Websecure));
        table.set_degraded(true);
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_batched_diff_is_atomic_for_concurrent_readers() {
        let table = Arc::new(RouteTable::new());
        table.upsert_route(test_route("old.example.com", EntryPoint::Websecure, "old"));

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let snapshot = table.snapshot();
                        let old = snapshot.resolve("old.example.com", EntryPoint::Websecure).is_ok();
                        let new = snapshot.resolve("new.example.com", EntryPoint::Websecure).is_ok();
                        assert!(old || new, "observed neither the old nor the new route");
                        assert!(!(old && new), "observed a half-applied diff");
                    }
                })
            })
            .collect();

        for i in 0..500 {
            let (add, remove) = if i % 2 == 0 {
                ("new.example.com", "old.example.com")
            } else {
                ("old.example.com", "new.example.com")
            };
            table.apply(RouteDiff {
                upserts: vec![test_route(add, EntryPoint::Websecure, "svc")],
                removals: vec![RouteKey::new(remove, EntryPoint::Websecure)],
            });
        }

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
