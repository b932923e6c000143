//! Routing labels → routes and upstream targets
//!
//! ```text
//! <prefix>.enable=true
//! <prefix>.http.routers.<router>.rule=Host(`api.example.com`)
//! <prefix>.http.routers.<router>.entrypoints=websecure,web
//! <prefix>.http.routers.<router>.tls.certresolver=letsencrypt
//! <prefix>.http.routers.<router>.service=<service>
//! <prefix>.http.services.<service>.loadbalancer.server.port=8000
//! ```
//!
//! Malformed routers are logged and skipped; the rest of the container's
//! routers still apply.

use super::ServiceDescriptor;
use crate::config::DiscoveryConfig;
use crate::routing::{EntryPoint, Route};
use crate::rule::parse_rule;
use crate::upstream::ServiceTarget;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConfig {
    pub prefix: String,
    /// Route services that carry no `<prefix>.enable` label
    pub exposed_by_default: bool,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            prefix: "gateway".to_string(),
            exposed_by_default: false,
        }
    }
}

impl From<&DiscoveryConfig> for LabelConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            prefix: config.label_prefix.clone(),
            exposed_by_default: config.exposed_by_default,
        }
    }
}

impl LabelConfig {
    pub fn enable_label(&self) -> String {
        format!("{}.enable", self.prefix)
    }

    pub fn is_enabled(&self, desc: &ServiceDescriptor) -> bool {
        match desc.labels.get(&self.enable_label()).map(|v| v.trim()) {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => self.exposed_by_default,
        }
    }
}

/// Everything one service descriptor contributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRoutes {
    pub routes: Vec<Route>,
    pub targets: Vec<ServiceTarget>,
}

#[derive(Debug, Default)]
struct RouterLabels {
    rule: Option<String>,
    entrypoints: Option<String>,
    cert_resolver: Option<String>,
    service: Option<String>,
}

/// Derive routes and targets from a descriptor's labels
pub fn parse_service(desc: &ServiceDescriptor, config: &LabelConfig) -> ServiceRoutes {
    let mut parsed = ServiceRoutes::default();
    if !config.is_enabled(desc) {
        return parsed;
    }

    let routers_prefix = format!("{}.http.routers.", config.prefix);
    let services_prefix = format!("{}.http.services.", config.prefix);

    let mut routers: BTreeMap<String, RouterLabels> = BTreeMap::new();
    let mut ports: BTreeMap<String, u16> = BTreeMap::new();

    for (key, value) in &desc.labels {
        if let Some(rest) = key.strip_prefix(&routers_prefix) {
            let Some((router, field)) = rest.split_once('.') else {
                continue;
            };
            let entry = routers.entry(router.to_string()).or_default();
            match field {
                "rule" => entry.rule = Some(value.clone()),
                "entrypoints" => entry.entrypoints = Some(value.clone()),
                "tls.certresolver" => entry.cert_resolver = Some(value.trim().to_string()),
                "service" => entry.service = Some(value.trim().to_string()),
                "tls" => {}
                other => warn!(service = %desc.name, router, label = other, "Ignoring unknown router label"),
            }
        } else if let Some(rest) = key.strip_prefix(&services_prefix) {
            let Some(service) = rest.strip_suffix(".loadbalancer.server.port") else {
                continue;
            };
            match value.trim().parse::<u16>() {
                Ok(port) if port > 0 => {
                    ports.insert(service.to_string(), port);
                }
                _ => warn!(service = %desc.name, port = %value, "Ignoring invalid service port label"),
            }
        }
    }

    for (router, labels) in routers {
        let Some(rule) = labels.rule else {
            warn!(service = %desc.name, router = %router, "Router has no rule, skipping");
            continue;
        };
        let rule = match parse_rule(&rule) {
            Ok(rule) => rule,
            Err(e) => {
                warn!(service = %desc.name, router = %router, error = %e, "Skipping router");
                continue;
            }
        };

        let entry_points = match parse_entry_points(labels.entrypoints.as_deref()) {
            Ok(eps) => eps,
            Err(unknown) => {
                warn!(service = %desc.name, router = %router, entrypoint = %unknown, "Skipping router with unknown entry point");
                continue;
            }
        };

        let service = labels.service.unwrap_or_else(|| {
            if ports.len() == 1 {
                ports.keys().next().cloned().unwrap_or_default()
            } else {
                desc.name.clone()
            }
        });
        let Some(port) = ports.get(&service).copied().or(desc.default_port) else {
            warn!(service = %desc.name, router = %router, upstream = %service, "No port known for service, skipping router");
            continue;
        };

        let target_url = format!("http://{}:{}", desc.address, port);
        for host in &rule.hosts {
            for entry_point in &entry_points {
                parsed.routes.push(Route {
                    name: router.clone(),
                    host_pattern: host.clone(),
                    entry_point: *entry_point,
                    service: service.clone(),
                    target_url: target_url.clone(),
                    path_prefix: rule.path_prefix.clone(),
                    tls_cert_resolver: labels.cert_resolver.clone(),
                    source: desc.id.clone(),
                    updated_seq: 0,
                });
            }
        }

        if !parsed.targets.iter().any(|t| t.name == service) {
            parsed
                .targets
                .push(ServiceTarget::new(&desc.id, &service, &desc.address, port));
        }
    }

    parsed
}

/// Comma-separated entry point names; `websecure` when unset
fn parse_entry_points(value: Option<&str>) -> Result<Vec<EntryPoint>, String> {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(vec![EntryPoint::Websecure]);
    };
    let mut entry_points = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let ep = EntryPoint::parse(name).ok_or_else(|| name.to_string())?;
        if !entry_points.contains(&ep) {
            entry_points.push(ep);
        }
    }
    Ok(entry_points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn descriptor(labels: &[(&str, &str)]) -> ServiceDescriptor {
        ServiceDescriptor {
            id: "c1".to_string(),
            name: "backend".to_string(),
            address: "172.18.0.5".to_string(),
            default_port: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_api_and_console_topology() {
        let desc = descriptor(&[
            ("gateway.enable", "true"),
            ("gateway.http.routers.api.rule", "Host(`api.example.com`)"),
            ("gateway.http.routers.api.tls.certresolver", "letsencrypt"),
            ("gateway.http.routers.api.service", "api"),
            ("gateway.http.services.api.loadbalancer.server.port", "8000"),
            ("gateway.http.routers.console.rule", "Host(`console.example.com`)"),
            ("gateway.http.routers.console.service", "console"),
            ("gateway.http.services.console.loadbalancer.server.port", "9001"),
        ]);

        let parsed = parse_service(&desc, &LabelConfig::default());
        assert_eq!(parsed.routes.len(), 2);

        let api = parsed.routes.iter().find(|r| r.name == "api").unwrap();
        assert_eq!(api.host_pattern, "api.example.com");
        assert_eq!(api.entry_point, EntryPoint::Websecure);
        assert_eq!(api.target_url, "http://172.18.0.5:8000");
        assert_eq!(api.tls_cert_resolver.as_deref(), Some("letsencrypt"));
        assert_eq!(api.source, "c1");

        let console = parsed.routes.iter().find(|r| r.name == "console").unwrap();
        assert_eq!(console.service, "console");
        assert_eq!(console.tls_cert_resolver, None);

        assert_eq!(parsed.targets.len(), 2);
        assert!(parsed
            .targets
            .iter()
            .any(|t| t.name == "console" && t.upstream_port == 9001));
    }

    #[test]
    fn test_not_enabled_produces_nothing() {
        let desc = descriptor(&[("gateway.http.routers.api.rule", "Host(`api.example.com`)")]);
        assert_eq!(parse_service(&desc, &LabelConfig::default()), ServiceRoutes::default());

        let exposed = LabelConfig {
            exposed_by_default: true,
            ..LabelConfig::default()
        };
        let mut desc = desc;
        desc.default_port = Some(8000);
        assert_eq!(parse_service(&desc, &exposed).routes.len(), 1);
    }

    #[test]
    fn test_single_service_is_default_and_entrypoints_expand() {
        let desc = descriptor(&[
            ("gateway.enable", "true"),
            ("gateway.http.routers.api.rule", "Host(`a.example.com`, `b.example.com`)"),
            ("gateway.http.routers.api.entrypoints", "web, websecure"),
            ("gateway.http.services.backend-svc.loadbalancer.server.port", "8000"),
        ]);

        let parsed = parse_service(&desc, &LabelConfig::default());
        assert_eq!(parsed.routes.len(), 4);
        assert!(parsed.routes.iter().all(|r| r.service == "backend-svc"));
        assert_eq!(parsed.targets.len(), 1);
    }

    #[test]
    fn test_bad_router_skipped_others_kept() {
        let desc = descriptor(&[
            ("gateway.enable", "true"),
            ("gateway.http.routers.bad.rule", "Host(api.example.com)"),
            ("gateway.http.routers.odd.rule", "Host(`odd.example.com`)"),
            ("gateway.http.routers.odd.entrypoints", "ftp"),
            ("gateway.http.routers.good.rule", "Host(`good.example.com`)"),
            ("gateway.http.services.backend.loadbalancer.server.port", "8000"),
        ]);

        let parsed = parse_service(&desc, &LabelConfig::default());
        assert_eq!(parsed.routes.len(), 1);
        assert_eq!(parsed.routes[0].host_pattern, "good.example.com");
    }

    #[test]
    fn test_custom_prefix_and_missing_port() {
        let desc = descriptor(&[
            ("edge.enable", "true"),
            ("edge.http.routers.api.rule", "Host(`api.example.com`) && PathPrefix(`/v1`)"),
        ]);
        let config = LabelConfig {
            prefix: "edge".to_string(),
            exposed_by_default: false,
        };

        assert!(parse_service(&desc, &config).routes.is_empty());

        let mut desc = desc;
        desc.default_port = Some(8080);
        let parsed = parse_service(&desc, &config);
        assert_eq!(parsed.routes[0].path_prefix.as_deref(), Some("/v1"));
        assert_eq!(parsed.routes[0].service, "backend");
        assert_eq!(parsed.targets[0].upstream_port, 8080);
    }
}
