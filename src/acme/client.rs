//! ACME v2 certificate authority access
//!
//! [`CertificateAuthority`] and [`PendingOrder`] are the seams the order
//! state machine drives. [`AcmeAuthority`] implements them with
//! `instant-acme`; [`LazyAcmeAuthority`] defers its account setup to the
//! first order. Tests substitute in-memory fakes.

use crate::certs::{install_crypto_provider, write_file};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, info};

const ACCOUNT_FILE: &str = "account.json";

/// A DNS-01 challenge to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    /// Identifier being validated (may be `*.example.com`)
    pub identifier: String,
    /// Challenge URL to mark ready
    pub url: String,
    /// Value of the `_acme-challenge` TXT record
    pub record_value: String,
}

/// Order status as seen by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderProgress {
    /// Authorization still pending at the CA
    Pending,
    /// Authorizations valid, ready to finalize
    Ready,
    /// Finalized, certificate being issued
    Processing,
    /// Certificate available
    Valid,
    /// Terminal failure with the CA's reason
    Invalid(String),
}

/// Issues orders for single domains
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn new_order(&self, domain: &str) -> Result<Box<dyn PendingOrder>>;
}

/// One order in progress at the CA
#[async_trait]
pub trait PendingOrder: Send {
    /// The DNS-01 challenge to solve, or `None` when the authorization is already valid
    async fn dns_challenge(&mut self) -> Result<Option<DnsChallenge>>;

    /// Tell the CA the TXT record is in place
    async fn set_challenge_ready(&mut self, challenge: &DnsChallenge) -> Result<()>;

    /// Refresh and report the order status
    async fn poll(&mut self) -> Result<OrderProgress>;

    /// Submit the CSR (DER)
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()>;

    /// Download the PEM chain once the order is valid
    async fn certificate(&mut self) -> Result<Option<String>>;
}

/// `instant-acme` backed certificate authority
pub struct AcmeAuthority {
    account: Account,
}

impl std::fmt::Debug for AcmeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeAuthority").finish_non_exhaustive()
    }
}

impl AcmeAuthority {
    /// Load the account from `storage_dir/account.json`, or register one
    pub async fn connect(directory_url: &str, email: &str, storage_dir: &Path) -> Result<Self> {
        install_crypto_provider();
        let account_path = storage_dir.join(ACCOUNT_FILE);

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path).map_err(|e| {
                GatewayError::Storage(format!("{}: {}", account_path.display(), e))
            })?;
            let credentials: AccountCredentials = serde_json::from_str(&data).map_err(|e| {
                GatewayError::Storage(format!("{}: {}", account_path.display(), e))
            })?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(acme_error)?;
            return Ok(Self { account });
        }

        info!(directory = directory_url, "Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .map_err(acme_error)?;

        save_credentials(&account_path, &credentials)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(Self { account })
    }
}

/// [`AcmeAuthority`] that connects on the first order instead of at startup.
///
/// A failed connection is returned as a transient [`GatewayError::Acme`] and
/// attempted again by the next order.
pub struct LazyAcmeAuthority {
    directory_url: String,
    email: String,
    storage_dir: PathBuf,
    inner: OnceCell<AcmeAuthority>,
}

impl LazyAcmeAuthority {
    pub fn new(directory_url: &str, email: &str, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            directory_url: directory_url.to_string(),
            email: email.to_string(),
            storage_dir: storage_dir.into(),
            inner: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.initialized()
    }

    async fn authority(&self) -> Result<&AcmeAuthority> {
        self.inner
            .get_or_try_init(|| async {
                let authority =
                    AcmeAuthority::connect(&self.directory_url, &self.email, &self.storage_dir).await?;
                info!(directory = %self.directory_url, "Connected to ACME directory");
                Ok::<_, GatewayError>(authority)
            })
            .await
    }
}

#[async_trait]
impl CertificateAuthority for LazyAcmeAuthority {
    async fn new_order(&self, domain: &str) -> Result<Box<dyn PendingOrder>> {
        self.authority().await?.new_order(domain).await
    }
}

fn save_credentials(path: &Path, credentials: &AccountCredentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GatewayError::Storage(format!("{}: {}", parent.display(), e)))?;
    }
    let data = serde_json::to_string_pretty(credentials)
        .map_err(|e| GatewayError::Storage(format!("serialize account: {}", e)))?;
    write_file(path, data.as_bytes(), true)
        .map_err(|e| GatewayError::Storage(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn new_order(&self, domain: &str) -> Result<Box<dyn PendingOrder>> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_error)?;

        debug!(domain, "ACME order created");
        Ok(Box::new(AcmeOrder {
            order,
            domain: domain.to_string(),
        }))
    }
}

struct AcmeOrder {
    order: Order,
    domain: String,
}

#[async_trait]
impl PendingOrder for AcmeOrder {
    async fn dns_challenge(&mut self) -> Result<Option<DnsChallenge>> {
        let authorizations = self.order.authorizations().await.map_err(acme_error)?;

        for authz in &authorizations {
            let identifier = match &authz.identifier {
                Identifier::Dns(name) => name.clone(),
            };
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                other => {
                    return Err(GatewayError::ChallengeValidationFailed {
                        domain: identifier,
                        reason: format!("authorization is {:?}", other),
                    })
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    GatewayError::Acme(format!("no dns-01 challenge offered for {}", identifier))
                })?;

            let record_value = self.order.key_authorization(challenge).dns_value();
            return Ok(Some(DnsChallenge {
                identifier,
                url: challenge.url.clone(),
                record_value,
            }));
        }

        Ok(None)
    }

    async fn set_challenge_ready(&mut self, challenge: &DnsChallenge) -> Result<()> {
        self.order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(acme_error)
    }

    async fn poll(&mut self) -> Result<OrderProgress> {
        self.order.refresh().await.map_err(acme_error)?;
        let state = self.order.state();
        Ok(match state.status {
            OrderStatus::Pending => OrderProgress::Pending,
            OrderStatus::Ready => OrderProgress::Ready,
            OrderStatus::Processing => OrderProgress::Processing,
            OrderStatus::Valid => OrderProgress::Valid,
            OrderStatus::Invalid => {
                let reason = state
                    .error
                    .as_ref()
                    .and_then(|p| p.detail.clone())
                    .unwrap_or_else(|| format!("order for {} is invalid", self.domain));
                OrderProgress::Invalid(reason)
            }
        })
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        self.order.finalize(csr_der).await.map_err(acme_error)
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        self.order.certificate().await.map_err(acme_error)
    }
}

fn acme_error(e: instant_acme::Error) -> GatewayError {
    GatewayError::Acme(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// HTTPS URL on a local port nothing listens on
    fn unreachable_directory() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("https://127.0.0.1:{}/directory", port)
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_directory_is_a_transient_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = AcmeAuthority::connect(&unreachable_directory(), "ops@example.com", dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Acme(_)));
        assert!(err.is_transient());
        assert!(!dir.path().join(ACCOUNT_FILE).exists());
    }

    #[tokio::test]
    async fn test_corrupt_account_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ACCOUNT_FILE), "not json").unwrap();

        let err = AcmeAuthority::connect(&unreachable_directory(), "ops@example.com", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
    }

    #[tokio::test]
    async fn test_lazy_authority_connects_on_first_order() {
        let dir = tempfile::tempdir().unwrap();
        let ca = LazyAcmeAuthority::new(&unreachable_directory(), "ops@example.com", dir.path());
        assert!(!ca.is_connected());

        let err = match ca.new_order("api.example.com").await {
            Err(e) => e,
            Ok(_) => panic!("order created without a reachable CA"),
        };
        assert!(err.is_transient());
        assert!(!ca.is_connected());
    }
}
