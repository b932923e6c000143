use crate::error::GatewayError;
use crate::routing::EntryPoint;
use crate::rule::parse_rule;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP (web) port, default 80, 0 disables
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS (websecure) port, default 443, 0 disables
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Loopback port for the admin API, 0 disables
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API; generated at startup if unset
    pub admin_token: Option<String>,

    /// Redirect every plain HTTP request to HTTPS (default: true)
    #[serde(default = "default_true")]
    pub redirect_to_https: bool,

    /// 301 or 308 (default: 308)
    #[serde(default = "default_redirect_status")]
    pub redirect_status: u16,

    /// Serve the default certificate when no certificate matches the SNI name.
    /// When false, such handshakes are rejected.
    #[serde(default = "default_true")]
    pub fallback_to_default_cert: bool,

    /// Default certificate chain (PEM). Self-signed when unset.
    pub default_cert: Option<String>,

    /// Default certificate private key (PEM)
    pub default_key: Option<String>,

    /// Maximum time to wait for an upstream response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long in-flight connections may drain on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn has_default_cert_files(&self) -> bool {
        self.default_cert.is_some() && self.default_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            redirect_to_https: true,
            redirect_status: default_redirect_status(),
            fallback_to_default_cert: true,
            default_cert: None,
            default_key: None,
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// ACME (DNS-01) certificate automation
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for the ACME account (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Directory holding the account credentials and per-domain certificates
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Resolver name routes refer to via `tls.certresolver`
    #[serde(default = "default_resolver_name")]
    pub resolver: String,

    /// Domains that always get a certificate, routed or not
    #[serde(default)]
    pub domains: Vec<String>,

    /// Renew when fewer than this many days of validity remain
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// How often the renewal supervisor scans for work
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Wait between publishing the TXT record and asking for validation
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,

    /// Interval between challenge / order status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Status polls before an attempt is abandoned
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Full attempts (Idle → Active) before the order is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between failed attempts
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_secs: u64,

    #[serde(default)]
    pub dns: DnsProviderConfig,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &str {
        self.directory_url.as_deref().unwrap_or(LETS_ENCRYPT_PRODUCTION)
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::days(self.renew_before_days as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            storage_dir: default_storage_dir(),
            resolver: default_resolver_name(),
            domains: Vec::new(),
            renew_before_days: default_renew_before_days(),
            check_interval_secs: default_check_interval(),
            propagation_delay_secs: default_propagation_delay(),
            poll_interval_secs: default_poll_interval(),
            max_polls: default_max_polls(),
            max_attempts: default_max_attempts(),
            retry_cooldown_secs: default_retry_cooldown(),
            dns: DnsProviderConfig::default(),
        }
    }
}

/// Supported DNS provider APIs
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    #[default]
    Cloudflare,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsProviderConfig {
    #[serde(default)]
    pub provider: DnsProviderKind,

    /// Base URL of the provider API
    #[serde(default = "default_dns_api_base")]
    pub api_base: String,

    /// Zone the challenge records are created in
    pub zone_id: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// TTL of the challenge TXT record in seconds
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Retries of a throttled or transiently failing provider call
    #[serde(default = "default_provider_retries", alias = "max_rate_limit_retries")]
    pub max_retries: u32,
}

impl Default for DnsProviderConfig {
    fn default() -> Self {
        Self {
            provider: DnsProviderKind::default(),
            api_base: default_dns_api_base(),
            zone_id: None,
            token_env: default_token_env(),
            record_ttl: default_record_ttl(),
            max_retries: default_provider_retries(),
        }
    }
}

/// Where services and their routing labels come from
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryProvider {
    /// Services listed under `[[discovery.services]]`
    #[default]
    Static,
    /// Running containers and their labels, via the Docker API
    Docker,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub provider: DiscoveryProvider,

    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,

    /// Label namespace, e.g. `gateway` for `gateway.http.routers.*`
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Network whose container IP is used to reach upstreams
    pub network: Option<String>,

    /// Route containers that lack `<prefix>.enable=true`
    #[serde(default)]
    pub exposed_by_default: bool,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay cap in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    /// After this long without contact, routes are marked degraded (not removed)
    #[serde(default = "default_staleness_ceiling")]
    pub staleness_ceiling_secs: u64,

    /// Static service list
    #[serde(default)]
    pub services: Vec<StaticService>,
}

impl DiscoveryConfig {
    pub fn staleness_ceiling(&self) -> Duration {
        Duration::from_secs(self.staleness_ceiling_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            provider: DiscoveryProvider::default(),
            docker_host: None,
            label_prefix: default_label_prefix(),
            network: None,
            exposed_by_default: false,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            staleness_ceiling_secs: default_staleness_ceiling(),
            services: Vec::new(),
        }
    }
}

/// A service declared directly in the configuration file
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StaticService {
    pub name: String,
    /// Host name or IP the upstream listens on
    pub address: String,
    pub port: u16,
    pub rule: String,
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,
    pub cert_resolver: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// A check taking longer than this counts as a failure
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// HTTP path to GET; plain TCP connect when unset
    pub path: Option<String>,

    /// Consecutive failures before a target is marked unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before an unhealthy target rejoins
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_ms: default_health_timeout(),
            path: None,
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_admin_port() -> u16 {
    9900
}

fn default_redirect_status() -> u16 {
    308
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_storage_dir() -> String {
    "./acme".to_string()
}

fn default_resolver_name() -> String {
    "letsencrypt".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    12 * 60 * 60
}

fn default_propagation_delay() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_polls() -> u32 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_cooldown() -> u64 {
    300
}

fn default_dns_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_token_env() -> String {
    "DNS_API_TOKEN".to_string()
}

fn default_record_ttl() -> u32 {
    120
}

fn default_provider_retries() -> u32 {
    5
}

fn default_label_prefix() -> String {
    "gateway".to_string()
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_staleness_ceiling() -> u64 {
    300
}

fn default_entry_points() -> Vec<String> {
    vec!["websecure".to_string()]
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, GatewayError> {
        let config: Config =
            toml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut errors = Vec::new();

        if self.server.redirect_status != 301 && self.server.redirect_status != 308 {
            errors.push(format!(
                "server.redirect_status must be 301 or 308, got {}",
                self.server.redirect_status
            ));
        }
        if self.server.default_cert.is_some() != self.server.default_key.is_some() {
            errors.push("server.default_cert and server.default_key must be set together".to_string());
        }
        if self.server.http_port != 0 && self.server.http_port == self.server.https_port {
            errors.push("server.http_port and server.https_port must differ".to_string());
        }

        if self.acme.enabled {
            if self.acme.email.as_deref().map_or(true, str::is_empty) {
                errors.push("acme.email is required when ACME is enabled".to_string());
            }
            if self.acme.dns.zone_id.is_none() {
                errors.push("acme.dns.zone_id is required when ACME is enabled".to_string());
            }
            if self.acme.dns.token_env.is_empty() {
                errors.push("acme.dns.token_env must name an environment variable".to_string());
            }
            if self.acme.storage_dir.contains("..") {
                errors.push("acme.storage_dir must not contain '..'".to_string());
            }
            if self.acme.max_attempts == 0 {
                errors.push("acme.max_attempts must be at least 1".to_string());
            }
            for domain in &self.acme.domains {
                if let Err(e) = crate::rule::normalize_host_pattern(domain) {
                    errors.push(format!("acme.domains: {}", e));
                }
            }
        }

        if self.discovery.label_prefix.is_empty() {
            errors.push("discovery.label_prefix must not be empty".to_string());
        }

        for service in &self.discovery.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }
        }

        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            errors.push("health thresholds must be at least 1".to_string());
        }

        if !errors.is_empty() {
            return Err(GatewayError::Config(format!(
                "configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

impl StaticService {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("static service with empty name".to_string());
        }
        if self.port == 0 {
            return Err(format!("service '{}': 'port' must be greater than 0", self.name));
        }
        if self.address.is_empty() {
            return Err(format!("service '{}': 'address' is required", self.name));
        }
        if let Err(e) = parse_rule(&self.rule) {
            return Err(format!("service '{}': {}", self.name, e));
        }
        for ep in &self.entry_points {
            if EntryPoint::parse(ep).is_none() {
                return Err(format!("service '{}': unknown entry point '{}'", self.name, ep));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.server.redirect_to_https);
        assert_eq!(config.server.redirect_status, 308);
        assert!(config.server.fallback_to_default_cert);
        assert!(!config.acme.enabled);
        assert_eq!(config.acme.renew_before_days, 30);
        assert_eq!(config.acme.directory_url(), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.discovery.provider, DiscoveryProvider::Static);
        assert_eq!(config.discovery.label_prefix, "gateway");
        assert_eq!(config.health.unhealthy_threshold, 3);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
http_port = 8080
https_port = 8443
redirect_status = 301
fallback_to_default_cert = false

[acme]
enabled = true
email = "ops@example.com"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
storage_dir = "/var/lib/edgegate"
domains = ["example.com"]
propagation_delay_secs = 30

[acme.dns]
zone_id = "abc123"
token_env = "CF_DNS_API_TOKEN"

[discovery]
provider = "docker"
label_prefix = "traefik"
network = "web"
staleness_ceiling_secs = 120

[health]
path = "/health"
timeout_ms = 500
"#;
        let config = Config::parse(toml).unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.redirect_status, 301);
        assert!(!config.server.fallback_to_default_cert);
        assert!(config.acme.enabled);
        assert_eq!(config.acme.dns.zone_id.as_deref(), Some("abc123"));
        assert_eq!(config.acme.dns.token_env, "CF_DNS_API_TOKEN");
        assert_eq!(config.acme.dns.provider, DnsProviderKind::Cloudflare);
        assert_eq!(config.discovery.provider, DiscoveryProvider::Docker);
        assert_eq!(config.discovery.staleness_ceiling(), Duration::from_secs(120));
        assert_eq!(config.health.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_static_services() {
        let toml = r#"
[[discovery.services]]
name = "backend"
address = "backend"
port = 8000
rule = "Host(`api.example.com`)"
cert_resolver = "letsencrypt"

[[discovery.services]]
name = "minio-console"
address = "minio"
port = 9001
rule = "Host(`console.example.com`)"
entry_points = ["websecure", "web"]
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.discovery.services.len(), 2);
        assert_eq!(config.discovery.services[0].entry_points, vec!["websecure"]);
        assert_eq!(config.discovery.services[1].port, 9001);
    }

    #[test]
    fn test_bad_rule_is_config_error() {
        let toml = r#"
[[discovery.services]]
name = "backend"
address = "backend"
port = 8000
rule = "Host(api.example.com)"
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("backend"));
    }

    #[test]
    fn test_acme_requires_email_and_zone() {
        let toml = r#"
[acme]
enabled = true
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("acme.email is required"));
        assert!(err.contains("acme.dns.zone_id is required"));
    }

    #[test]
    fn test_invalid_redirect_status_and_entry_point() {
        let toml = r#"
[server]
redirect_status = 302

[[discovery.services]]
name = "backend"
address = "backend"
port = 8000
rule = "Host(`api.example.com`)"
entry_points = ["ftp"]
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("redirect_status"));
        assert!(err.contains("unknown entry point 'ftp'"));
    }

    #[test]
    fn test_unparseable_toml() {
        assert!(matches!(
            Config::parse("[server\nport = 1"),
            Err(GatewayError::Config(_))
        ));
    }
}
