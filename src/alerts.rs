//! Persistent operator alerts
//!
//! Failures that must not be lost in the log stream (certificate issuance
//! given up, an expired certificate still being served, rejected DNS
//! provider credentials, stale discovery) are raised here and stay until
//! the condition clears. Raising the same `(kind, subject)` again bumps
//! the occurrence count instead of adding a duplicate.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Issuance exhausted its attempts
    CertificateIssuanceFailed,
    /// A served certificate is past its expiry
    CertificateExpired,
    /// The DNS provider rejected the API token
    ProviderAuth,
    /// Discovery has been out of contact past the staleness ceiling
    DiscoveryDegraded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CertificateIssuanceFailed => "certificate_issuance_failed",
            AlertKind::CertificateExpired => "certificate_expired",
            AlertKind::ProviderAuth => "provider_auth",
            AlertKind::DiscoveryDegraded => "discovery_degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    /// Domain, provider or source the alert is about
    pub subject: String,
    pub message: String,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
}

/// Active alerts keyed by `(kind, subject)`
#[derive(Debug, Default)]
pub struct AlertRegistry {
    active: DashMap<(AlertKind, String), Alert>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise (or re-raise) an alert
    pub fn raise(&self, kind: AlertKind, subject: &str, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();

        let mut entry = self
            .active
            .entry((kind, subject.to_string()))
            .or_insert_with(|| Alert {
                kind,
                subject: subject.to_string(),
                message: message.clone(),
                severity,
                raised_at: now,
                last_seen: now,
                occurrences: 0,
            });
        entry.occurrences += 1;
        entry.last_seen = now;
        entry.message = message;
        entry.severity = entry.severity.max(severity);

        match severity {
            Severity::Critical => error!(
                alert = kind.as_str(),
                subject,
                occurrences = entry.occurrences,
                message = %entry.message,
                "Alert raised"
            ),
            Severity::Warning => warn!(
                alert = kind.as_str(),
                subject,
                occurrences = entry.occurrences,
                message = %entry.message,
                "Alert raised"
            ),
            Severity::Info => info!(
                alert = kind.as_str(),
                subject,
                message = %entry.message,
                "Alert raised"
            ),
        }
    }

    /// Clear an alert; returns whether it was active
    pub fn resolve(&self, kind: AlertKind, subject: &str) -> bool {
        let resolved = self.active.remove(&(kind, subject.to_string())).is_some();
        if resolved {
            info!(alert = kind.as_str(), subject, "Alert resolved");
        }
        resolved
    }

    pub fn get(&self, kind: AlertKind, subject: &str) -> Option<Alert> {
        self.active
            .get(&(kind, subject.to_string()))
            .map(|a| a.value().clone())
    }

    pub fn is_active(&self, kind: AlertKind, subject: &str) -> bool {
        self.active.contains_key(&(kind, subject.to_string()))
    }

    /// Active alerts, most severe first, then oldest first
    pub fn list(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.iter().map(|a| a.value().clone()).collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.raised_at.cmp(&b.raised_at))
                .then(a.subject.cmp(&b.subject))
        });
        alerts
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_raise_deduplicates() {
        let alerts = AlertRegistry::new();
        alerts.raise(AlertKind::CertificateIssuanceFailed, "api.example.com", Severity::Warning, "first");
        alerts.raise(AlertKind::CertificateIssuanceFailed, "api.example.com", Severity::Critical, "second");

        assert_eq!(alerts.len(), 1);
        let alert = alerts
            .get(AlertKind::CertificateIssuanceFailed, "api.example.com")
            .unwrap();
        assert_eq!(alert.occurrences, 2);
        assert_eq!(alert.message, "second");
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[test]
    fn test_resolve() {
        let alerts = AlertRegistry::new();
        alerts.raise(AlertKind::ProviderAuth, "cloudflare", Severity::Critical, "401");

        assert!(alerts.resolve(AlertKind::ProviderAuth, "cloudflare"));
        assert!(!alerts.resolve(AlertKind::ProviderAuth, "cloudflare"));
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_list_orders_by_severity() {
        let alerts = AlertRegistry::new();
        alerts.raise(AlertKind::DiscoveryDegraded, "docker", Severity::Warning, "stale");
        alerts.raise(AlertKind::CertificateExpired, "old.example.com", Severity::Critical, "expired");

        let list = alerts.list();
        assert_eq!(list[0].kind, AlertKind::CertificateExpired);
        assert_eq!(list[1].kind, AlertKind::DiscoveryDegraded);
    }
}
