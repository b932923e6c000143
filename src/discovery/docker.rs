//! Docker discovery: running containers and their labels
//!
//! Lists running containers, then follows the daemon's container event
//! stream. Only read endpoints are used (list, inspect, events).

use super::{DiscoverySource, EventStream, ServiceDescriptor, ServiceEvent};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, warn};

const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Container actions that make a container routable
const UP_ACTIONS: &[&str] = &["start", "unpause"];
/// Container actions that take it out of rotation
const DOWN_ACTIONS: &[&str] = &["die", "stop", "pause", "destroy"];

pub struct DockerSource {
    client: Docker,
    label_prefix: String,
    network: Option<String>,
    exposed_by_default: bool,
}

impl DockerSource {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(
        docker_host: Option<&str>,
        label_prefix: &str,
        network: Option<&str>,
        exposed_by_default: bool,
    ) -> Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                GatewayError::Discovery(format!("DOCKER_HOST='{}': {}", host, e))
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        debug!("Docker client configured");
        Ok(Self {
            client,
            label_prefix: label_prefix.to_string(),
            network: network.map(str::to_string),
            exposed_by_default,
        })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                GatewayError::Discovery(format!("cannot connect to Unix socket '{}': {}", socket_path, e))
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                GatewayError::Discovery(format!("cannot connect to TCP endpoint '{}': {}", host, e))
            })
        } else {
            Err(GatewayError::Config(format!(
                "invalid docker_host '{}': expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    async fn connect_with_defaults() -> Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        debug!(path, "Socket exists but daemon not responding");
                    }
                    Err(e) => debug!(path, error = %e, "Socket connection failed"),
                }
            }
        }

        // The watcher retries, so a daemon that is down now may come up later
        Docker::connect_with_socket_defaults().map_err(|e| {
            GatewayError::Discovery(format!(
                "cannot connect to Docker daemon (set DOCKER_HOST or discovery.docker_host): {}",
                e
            ))
        })
    }

    fn label_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.exposed_by_default {
            filters.insert(
                "label".to_string(),
                vec![format!("{}.enable=true", self.label_prefix)],
            );
        }
        filters
    }

    async fn describe(&self, id: &str) -> Option<ServiceDescriptor> {
        describe_container(&self.client, id, self.network.as_deref()).await
    }
}

async fn describe_container(
    client: &Docker,
    id: &str,
    network: Option<&str>,
) -> Option<ServiceDescriptor> {
    match client.inspect_container(id, None).await {
        Ok(info) => descriptor_from_inspect(&info, network),
        Err(e) => {
            warn!(container_id = id, error = %e, "Failed to inspect container");
            None
        }
    }
}

/// Build a descriptor from `docker inspect` output
pub fn descriptor_from_inspect(
    info: &ContainerInspectResponse,
    network: Option<&str>,
) -> Option<ServiceDescriptor> {
    let id = info.id.clone()?;
    let config = info.config.as_ref();
    let labels = config.and_then(|c| c.labels.clone()).unwrap_or_default();

    let container_name = info
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect());
    let name = labels
        .get(COMPOSE_SERVICE_LABEL)
        .cloned()
        .unwrap_or_else(|| container_name.clone());

    let networks = info
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.as_ref());
    let ip = networks.and_then(|networks| {
        let endpoint = match network {
            Some(wanted) => networks.get(wanted),
            None => networks
                .iter()
                .min_by(|a, b| a.0.cmp(b.0))
                .map(|(_, endpoint)| endpoint),
        };
        endpoint
            .and_then(|e| e.ip_address.clone())
            .filter(|ip| !ip.is_empty())
    });

    let default_port = config
        .and_then(|c| c.exposed_ports.as_ref())
        .and_then(|ports| {
            ports
                .keys()
                .filter_map(|p| p.split('/').next()?.parse::<u16>().ok())
                .min()
        });

    Some(ServiceDescriptor {
        id,
        name,
        address: ip.unwrap_or(container_name),
        default_port,
        labels,
    })
}

/// Container lifecycle events matching the label filters, replayed from `since`
fn event_options(
    mut filters: HashMap<String, Vec<String>>,
    since: DateTime<Utc>,
) -> EventsOptions<String> {
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert(
        "event".to_string(),
        UP_ACTIONS
            .iter()
            .chain(DOWN_ACTIONS)
            .map(|a| a.to_string())
            .collect(),
    );
    EventsOptions {
        since: Some(since),
        filters,
        ..Default::default()
    }
}

#[async_trait]
impl DiscoverySource for DockerSource {
    fn name(&self) -> &str {
        "docker"
    }

    async fn watch(&self) -> Result<EventStream> {
        self.client
            .ping()
            .await
            .map_err(|e| GatewayError::Discovery(format!("Docker daemon is not responding: {}", e)))?;

        // The event stream only connects once polled, after the listing below.
        // Replaying from just before the listing covers the gap between the two.
        let since = Utc::now() - chrono::Duration::seconds(1);
        let events = self
            .client
            .events(Some(event_options(self.label_filters(), since)));

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters: self.label_filters(),
                ..Default::default()
            }))
            .await
            .map_err(|e| GatewayError::Discovery(format!("list containers: {}", e)))?;

        let mut descriptors = Vec::with_capacity(containers.len());
        for container in containers {
            if let Some(id) = container.id {
                if let Some(desc) = self.describe(&id).await {
                    descriptors.push(desc);
                }
            }
        }
        debug!(containers = descriptors.len(), "Listed running containers");

        let client = self.client.clone();
        let network = self.network.clone();
        let updates = events.filter_map(move |event| {
            let client = client.clone();
            let network = network.clone();
            async move {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => return Some(Err(GatewayError::Discovery(format!("event stream: {}", e)))),
                };
                let action = event.action.unwrap_or_default();
                let id = event.actor.and_then(|a| a.id)?;

                if UP_ACTIONS.contains(&action.as_str()) {
                    describe_container(&client, &id, network.as_deref())
                        .await
                        .map(|desc| Ok(ServiceEvent::Upsert(desc)))
                } else if DOWN_ACTIONS.contains(&action.as_str()) {
                    Some(Ok(ServiceEvent::Remove(id)))
                } else {
                    None
                }
            }
        });

        Ok(stream::once(async move { Ok(ServiceEvent::Snapshot(descriptors)) })
            .chain(updates)
            .boxed())
    }
}
