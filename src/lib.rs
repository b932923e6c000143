//! Edgegate - a host-routing HTTPS gateway
//!
//! This library provides a TLS-terminating reverse proxy that:
//! - Routes traffic by `Host` to upstream services discovered from container labels
//! - Obtains and renews certificates via ACME DNS-01 and picks them by SNI
//! - Health checks upstream targets and skips the unhealthy ones
//! - Redirects plain HTTP to HTTPS
//! - Keeps serving the last known routes when discovery is unreachable
//! - Reports routes, certificates, upstreams and alerts on a loopback admin API

pub mod acme;
pub mod admin;
pub mod alerts;
pub mod backoff;
pub mod certs;
pub mod config;
pub mod discovery;
pub mod error;
pub mod healthcheck;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod rule;
pub mod upstream;
