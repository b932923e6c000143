//! ACME (DNS-01) certificate lifecycle
//!
//! - [`dns`]: DNS provider seam and the Cloudflare-compatible client
//! - [`client`]: certificate authority seam and the `instant-acme` client
//! - [`order`]: per-domain issuance state machine
//! - [`manager`]: renewal supervisor and in-flight bookkeeping
//!
//! # Key storage
//!
//! The account key (`account.json`) and certificate private keys are
//! written owner-only (0600 on Unix) but unencrypted. Keep the storage
//! directory on a protected filesystem and back it up securely.

pub mod client;
pub mod dns;
pub mod manager;
pub mod order;

pub use client::{
    AcmeAuthority, CertificateAuthority, DnsChallenge, LazyAcmeAuthority, OrderProgress,
    PendingOrder,
};
pub use dns::{challenge_record_name, CloudflareDns, DnsProvider};
pub use manager::{AcmeManager, IssueOutcome};
pub use order::{CertificateOrder, OrderContext, OrderSettings, OrderState};
