//! Services declared in the configuration file
//!
//! Each `[[discovery.services]]` entry is turned into a descriptor carrying
//! the same labels a container would, so it goes through the same label
//! parsing as discovered services.

use super::{DiscoverySource, EventStream, ServiceDescriptor, ServiceEvent};
use crate::config::StaticService;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;

pub struct StaticSource {
    descriptors: Vec<ServiceDescriptor>,
}

impl StaticSource {
    pub fn new(services: &[StaticService], label_prefix: &str) -> Self {
        Self {
            descriptors: services
                .iter()
                .map(|s| descriptor(s, label_prefix))
                .collect(),
        }
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }
}

fn descriptor(service: &StaticService, prefix: &str) -> ServiceDescriptor {
    let router = format!("{}.http.routers.{}", prefix, service.name);
    let mut labels = HashMap::from([
        (format!("{}.enable", prefix), "true".to_string()),
        (format!("{}.rule", router), service.rule.clone()),
        (format!("{}.entrypoints", router), service.entry_points.join(",")),
        (format!("{}.service", router), service.name.clone()),
        (
            format!("{}.http.services.{}.loadbalancer.server.port", prefix, service.name),
            service.port.to_string(),
        ),
    ]);
    if let Some(resolver) = &service.cert_resolver {
        labels.insert(format!("{}.tls.certresolver", router), resolver.clone());
    }

    ServiceDescriptor {
        id: format!("static:{}", service.name),
        name: service.name.clone(),
        address: service.address.clone(),
        default_port: Some(service.port),
        labels,
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    /// One snapshot, then idle forever
    async fn watch(&self) -> Result<EventStream> {
        let snapshot = ServiceEvent::Snapshot(self.descriptors.clone());
        Ok(stream::once(async move { Ok(snapshot) })
            .chain(stream::pending())
            .boxed())
    }
}
