//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors raised by the gateway's components.
///
/// Configuration errors are fatal at startup. Provider and ACME errors are
/// retried by their callers and surface as alerts when retries run out.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed routing rule or static configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The DNS provider rejected our credentials
    #[error("DNS provider rejected credentials: {0}")]
    ProviderAuth(String),

    /// The DNS provider is throttling us
    #[error("DNS provider rate limited the request")]
    ProviderRateLimited {
        /// Server supplied retry hint, if any
        retry_after: Option<Duration>,
    },

    /// The certificate authority reported the challenge as invalid
    #[error("challenge validation failed for {domain}: {reason}")]
    ChallengeValidationFailed { domain: String, reason: String },

    /// Upstream target could not be reached for a request
    #[error("upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    /// A certificate past its expiry was observed in the active set
    #[error("certificate for {0} has expired")]
    CertificateExpired(String),

    /// Another issuance for this domain is already running
    #[error("an order for {0} is already in flight")]
    AlreadyInFlight(String),

    /// The order was stopped by shutdown before it finished
    #[error("order for {0} cancelled by shutdown")]
    Cancelled(String),

    /// Orchestrator / discovery source failure
    #[error("discovery source error: {0}")]
    Discovery(String),

    /// ACME protocol failure not covered above
    #[error("ACME error: {0}")]
    Acme(String),

    /// DNS provider failure not covered above
    #[error("DNS provider error: {0}")]
    Provider(String),

    /// Certificate storage failure
    #[error("certificate storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderRateLimited { .. }
                | GatewayError::Provider(_)
                | GatewayError::Discovery(_)
                | GatewayError::Acme(_)
                | GatewayError::Io(_)
        )
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Error codes for responses produced by the gateway itself
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route for the requested host
    UnknownHost,
    /// Every target of the routed service is unhealthy or none is registered
    NoHealthyUpstream,
    /// Request timed out waiting for upstream
    RequestTimeout,
    /// Failed to connect to upstream
    UpstreamUnreachable,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoHealthyUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::NoHealthyUpstream => "NO_HEALTHY_UPSTREAM",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::NoHealthyUpstream.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "Unknown host");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"Unknown host\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::ProviderRateLimited { retry_after: None }.is_transient());
        assert!(GatewayError::Discovery("socket closed".into()).is_transient());
        assert!(!GatewayError::ProviderAuth("bad token".into()).is_transient());
        assert!(!GatewayError::Config("bad rule".into()).is_transient());
        assert!(!GatewayError::Cancelled("example.com".into()).is_transient());
        assert!(!GatewayError::AlreadyInFlight("example.com".into()).is_transient());
        assert!(!GatewayError::ChallengeValidationFailed {
            domain: "example.com".into(),
            reason: "invalid".into(),
        }
        .is_transient());
    }
}
