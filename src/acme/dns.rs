//! DNS provider API used to publish DNS-01 challenge records

use crate::config::DnsProviderConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Creates and deletes `_acme-challenge` TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Short provider name for logs and alerts
    fn name(&self) -> &str;

    /// Publish a TXT record, returning the provider's record id
    async fn create_txt_record(&self, record_name: &str, value: &str) -> Result<String>;

    /// Delete a record previously returned by `create_txt_record`
    async fn delete_txt_record(&self, record_id: &str) -> Result<()>;
}

/// Name of the challenge record for a domain (`*.example.com` shares the
/// record of `example.com`)
pub fn challenge_record_name(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    format!("_acme-challenge.{}", base)
}

/// Cloudflare-compatible DNS API client (v4 `dns_records` endpoints)
pub struct CloudflareDns {
    client: reqwest::Client,
    api_base: String,
    zone_id: String,
    token: String,
    ttl: u32,
}

impl std::fmt::Debug for CloudflareDns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareDns")
            .field("api_base", &self.api_base)
            .field("zone_id", &self.zone_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

impl CloudflareDns {
    pub fn new(api_base: &str, zone_id: &str, token: &str, ttl: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("edgegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            zone_id: zone_id.to_string(),
            token: token.to_string(),
            ttl,
        })
    }

    /// Build from configuration, reading the token from the configured variable
    pub fn from_config(config: &DnsProviderConfig) -> Result<Self> {
        let zone_id = config
            .zone_id
            .as_deref()
            .ok_or_else(|| GatewayError::Config("acme.dns.zone_id is not set".to_string()))?;
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "environment variable {} must hold the DNS API token",
                    config.token_env
                ))
            })?;

        Self::new(&config.api_base, zone_id, token.trim(), config.record_ttl)
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.api_base, self.zone_id)
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(GatewayError::ProviderAuth(format!(
                    "{} rejected the API token ({})",
                    self.name(),
                    status
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(GatewayError::ProviderRateLimited { retry_after });
            }
            _ => {}
        }

        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            GatewayError::Provider(format!("unreadable {} response ({}): {}", self.name(), status, e))
        })?;

        if !status.is_success() || !body.success {
            let detail = body
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::Provider(format!(
                "{} request failed ({}): {}",
                self.name(),
                status,
                detail
            )));
        }

        Ok(body.result)
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    fn name(&self) -> &str {
        "cloudflare"
    }

    async fn create_txt_record(&self, record_name: &str, value: &str) -> Result<String> {
        let body = serde_json::json!({
            "type": "TXT",
            "name": record_name,
            "content": value,
            "ttl": self.ttl,
        });

        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("create TXT record: {}", e)))?;

        let record: DnsRecord = self
            .check(response)
            .await?
            .ok_or_else(|| GatewayError::Provider("create TXT record: empty result".to_string()))?;

        info!(record = record_name, record_id = %record.id, "Published TXT record");
        Ok(record.id)
    }

    async fn delete_txt_record(&self, record_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("delete TXT record: {}", e)))?;

        self.check::<serde_json::Value>(response).await?;
        debug!(record_id, "Deleted TXT record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering with `response`; yields the raw request
    async fn canned_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (base, handle)
    }

    #[test]
    fn test_challenge_record_name() {
        assert_eq!(challenge_record_name("api.example.com"), "_acme-challenge.api.example.com");
        assert_eq!(challenge_record_name("*.example.com"), "_acme-challenge.example.com");
    }

    #[tokio::test]
    async fn test_create_record_returns_id() {
        let body = r#"{"success":true,"errors":[],"result":{"id":"rec-42"}}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (base, server) = canned_server(response).await;

        let dns = CloudflareDns::new(&base, "zone1", "secret-token", 120).unwrap();
        let id = dns
            .create_txt_record("_acme-challenge.api.example.com", "abc")
            .await
            .unwrap();
        assert_eq!(id, "rec-42");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /zones/zone1/dns_records"));
        assert!(request.to_lowercase().contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_provider_auth() {
        let (base, _server) = canned_server(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let dns = CloudflareDns::new(&base, "zone1", "bad", 120).unwrap();
        let err = dns.delete_txt_record("rec-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::ProviderAuth(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let (base, _server) = canned_server(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let dns = CloudflareDns::new(&base, "zone1", "token", 120).unwrap();
        let err = dns.create_txt_record("_acme-challenge.a.com", "v").await.unwrap_err();
        match err {
            GatewayError::ProviderRateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_config_requires_token() {
        let config = DnsProviderConfig {
            zone_id: Some("zone1".to_string()),
            token_env: "EDGEGATE_TEST_UNSET_DNS_TOKEN".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            CloudflareDns::from_config(&config),
            Err(GatewayError::Config(_))
        ));

        std::env::set_var("EDGEGATE_TEST_SET_DNS_TOKEN", "tok");
        let config = DnsProviderConfig {
            token_env: "EDGEGATE_TEST_SET_DNS_TOKEN".to_string(),
            ..config
        };
        let dns = CloudflareDns::from_config(&config).unwrap();
        assert!(!format!("{:?}", dns).contains("tok\""));
    }
}
