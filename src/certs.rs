//! Certificate store and SNI certificate selection
//!
//! Certificates are persisted one directory per domain:
//!
//! ```text
//! <storage_dir>/<domain>/current          name of the live generation
//! <storage_dir>/<domain>/<gen>/cert.pem   full chain
//! <storage_dir>/<domain>/<gen>/key.pem    private key, mode 0600
//! <storage_dir>/<domain>/<gen>/meta.json  issued/expiry timestamps, resolver
//! ```
//!
//! A renewal writes a complete new generation and then renames `current`
//! over the old pointer, so the files on disk always form one matching set.
//! Directories without a `current` pointer hold the three files directly.
//!
//! The in-memory view is an immutable snapshot behind an `ArcSwap`. TLS
//! handshakes read it without locking; [`CertificateStore::replace`] writes
//! the files first and then swaps in a new snapshot, so a handshake sees
//! either the old certificate or the new one.

use crate::error::{GatewayError, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const CURRENT_FILE: &str = "current";

/// Metadata persisted next to each certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub domain: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolver: String,
}

/// The current certificate of one domain
pub struct StoredCertificate {
    pub meta: CertificateMeta,
    pub cert_pem: String,
    pub certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for StoredCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCertificate")
            .field("meta", &self.meta)
            .field("certified_key", &"<CertifiedKey>")
            .finish()
    }
}

impl StoredCertificate {
    /// Parse a PEM chain and key into a servable certificate
    pub fn from_pem(domain: &str, cert_pem: &str, key_pem: &str, resolver: &str) -> Result<Self> {
        let certs = parse_cert_chain(cert_pem)?;
        let key = parse_private_key(key_pem)?;
        let (not_before, not_after) = certificate_validity(&certs[0])?;
        let certified_key = certified_key(certs, &key)?;

        Ok(Self {
            meta: CertificateMeta {
                domain: domain.to_string(),
                issued_at: not_before,
                expires_at: not_after,
                resolver: resolver.to_string(),
            },
            cert_pem: cert_pem.to_string(),
            certified_key,
        })
    }

    pub fn domain(&self) -> &str {
        &self.meta.domain
    }

    pub fn is_expired(&self) -> bool {
        self.meta.expires_at <= Utc::now()
    }

    /// True when less than `renew_before` of validity remains
    pub fn needs_renewal(&self, renew_before: chrono::Duration) -> bool {
        self.meta.expires_at - Utc::now() < renew_before
    }

    pub fn days_remaining(&self) -> i64 {
        (self.meta.expires_at - Utc::now()).num_days()
    }
}

/// Admin view of a certificate (never includes key material)
#[derive(Debug, Clone, Serialize)]
pub struct CertificateSummary {
    pub domain: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub days_remaining: i64,
    pub resolver: String,
    pub expired: bool,
}

type Snapshot = HashMap<String, Arc<StoredCertificate>>;

/// Domain → certificate map, persisted under a storage directory
pub struct CertificateStore {
    storage_dir: Option<PathBuf>,
    current: ArcSwap<Snapshot>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("storage_dir", &self.storage_dir)
            .field("domains", &self.current.load().len())
            .finish()
    }
}

impl CertificateStore {
    /// Store that keeps certificates in memory only
    pub fn in_memory() -> Self {
        Self {
            storage_dir: None,
            current: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Open (creating if needed) a storage directory and load what it holds
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = validate_storage_dir(storage_dir.as_ref())?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            GatewayError::Storage(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let store = Self {
            storage_dir: Some(dir),
            current: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        };
        store.load_all()?;
        Ok(store)
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    /// (Re)load every persisted certificate. Unreadable entries are skipped.
    pub fn load_all(&self) -> Result<usize> {
        let Some(dir) = &self.storage_dir else {
            return Ok(0);
        };

        let entries = std::fs::read_dir(dir)
            .map_err(|e| GatewayError::Storage(format!("cannot read {}: {}", dir.display(), e)))?;

        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match load_domain_dir(&path) {
                Ok(cert) => {
                    info!(
                        domain = %cert.domain(),
                        expires_at = %cert.meta.expires_at,
                        "Loaded stored certificate"
                    );
                    loaded.insert(cert.domain().to_string(), Arc::new(cert));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable certificate directory");
                }
            }
        }

        let count = loaded.len();
        let _guard = self.writer.lock();
        self.current.store(Arc::new(loaded));
        Ok(count)
    }

    /// Atomically replace the certificate of `domain`: persist, then swap
    pub fn replace(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        resolver: &str,
    ) -> Result<Arc<StoredCertificate>> {
        let domain = domain.to_lowercase();
        let cert = Arc::new(StoredCertificate::from_pem(&domain, cert_pem, key_pem, resolver)?);

        let _guard = self.writer.lock();
        if let Some(dir) = &self.storage_dir {
            persist(&dir.join(domain_dir_name(&domain)), &cert.meta, cert_pem, key_pem)?;
        }

        let mut next: Snapshot = (**self.current.load()).clone();
        next.insert(domain.clone(), Arc::clone(&cert));
        self.current.store(Arc::new(next));

        info!(
            domain = %domain,
            expires_at = %cert.meta.expires_at,
            resolver,
            "Certificate installed"
        );
        Ok(cert)
    }

    pub fn get(&self, domain: &str) -> Option<Arc<StoredCertificate>> {
        self.current.load().get(&domain.to_lowercase()).cloned()
    }

    /// True when the domain has no certificate or is inside the renewal window
    pub fn needs_renewal(&self, domain: &str, renew_before: chrono::Duration) -> bool {
        self.get(domain)
            .map_or(true, |cert| cert.needs_renewal(renew_before))
    }

    /// Certificate for an SNI name: exact match, then `*.parent` wildcard
    pub fn resolve_sni(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = server_name.trim_end_matches('.').to_lowercase();
        let snapshot = self.current.load();

        if let Some(cert) = snapshot.get(&name) {
            return Some(Arc::clone(&cert.certified_key));
        }
        let (_, parent) = name.split_once('.')?;
        snapshot
            .get(&format!("*.{}", parent))
            .map(|cert| Arc::clone(&cert.certified_key))
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.current.load().keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn summaries(&self) -> Vec<CertificateSummary> {
        let snapshot = self.current.load();
        let mut list: Vec<CertificateSummary> = snapshot
            .values()
            .map(|cert| CertificateSummary {
                domain: cert.meta.domain.clone(),
                issued_at: cert.meta.issued_at,
                expires_at: cert.meta.expires_at,
                days_remaining: cert.days_remaining(),
                resolver: cert.meta.resolver.clone(),
                expired: cert.is_expired(),
            })
            .collect();
        list.sort_by(|a, b| a.domain.cmp(&b.domain));
        list
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// rustls certificate resolver backed by the store
pub struct SniResolver {
    store: Arc<CertificateStore>,
    default_cert: Option<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("store", &self.store)
            .field("has_default_cert", &self.default_cert.is_some())
            .finish()
    }
}

impl SniResolver {
    /// `default_cert` is served when nothing matches; `None` rejects the handshake
    pub fn new(store: Arc<CertificateStore>, default_cert: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            store,
            default_cert,
        }
    }

    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            if let Some(key) = self.store.resolve_sni(name) {
                return Some(key);
            }
        }
        if self.default_cert.is_none() {
            debug!(sni = ?server_name, "No certificate for SNI name, rejecting handshake");
        }
        self.default_cert.clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Install `ring` as the process-wide rustls provider.
///
/// Configs built here pass the provider explicitly, but the ACME HTTP client
/// uses the process default, which rustls cannot pick on its own when more
/// than one provider is compiled in. Installing twice is a no-op.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a rustls TLS server config that selects certificates by SNI
pub fn server_config(resolver: Arc<SniResolver>) -> Result<rustls::ServerConfig> {
    let mut config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Config(format!("TLS configuration: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Default certificate from PEM files
pub fn load_default_certificate(cert_path: &str, key_path: &str) -> Result<Arc<CertifiedKey>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    certified_key(certs, &key)
}

/// Self-signed default certificate for the given names
pub fn self_signed_default_certificate(names: &[String]) -> Result<Arc<CertifiedKey>> {
    let (cert_pem, key_pem) = self_signed_pem(names, None)?;
    let certs = parse_cert_chain(&cert_pem)?;
    let key = parse_private_key(&key_pem)?;
    certified_key(certs, &key)
}

/// Generate a self-signed certificate and key as PEM, optionally with a fixed expiry
pub fn self_signed_pem(
    names: &[String],
    not_after: Option<DateTime<Utc>>,
) -> Result<(String, String)> {
    let storage_err = |e: rcgen::Error| GatewayError::Storage(format!("certificate generation failed: {}", e));

    let mut params = CertificateParams::new(names.to_vec()).map_err(storage_err)?;
    params.distinguished_name = DistinguishedName::new();
    if let Some(first) = names.first() {
        params.distinguished_name.push(DnType::CommonName, first.clone());
    }
    if let Some(expiry) = not_after {
        params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
    }

    let key_pair = KeyPair::generate().map_err(storage_err)?;
    let cert = params.self_signed(&key_pair).map_err(storage_err)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Parse every certificate in a PEM chain
pub fn parse_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Storage(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Storage("no certificates in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse the first PKCS#1, PKCS#8 or SEC1 private key in a PEM document
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    read_private_key(&mut BufReader::new(pem.as_bytes()))
        .map_err(|e| GatewayError::Storage(format!("invalid private key PEM: {}", e)))
}

fn read_private_key(reader: &mut dyn std::io::BufRead) -> std::result::Result<PrivateKeyDer<'static>, String> {
    loop {
        match rustls_pemfile::read_one(reader).map_err(|e| e.to_string())? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => return Err("no private key found".to_string()),
            _ => continue,
        }
    }
}

/// `(not_before, not_after)` of a certificate
pub fn certificate_validity(cert: &CertificateDer<'_>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| GatewayError::Storage(format!("invalid X.509 certificate: {}", e)))?;
    let validity = parsed.validity();
    let to_utc = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| GatewayError::Storage(format!("certificate timestamp out of range: {}", ts)))
    };
    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| GatewayError::Storage(format!("unsupported private key: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to open certificate file {}: {}", path, e)))?;
    parse_cert_chain(&pem)
        .map_err(|e| GatewayError::Config(format!("{}: {}", path, e)))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Config(format!("failed to open key file {}: {}", path, e)))?;
    read_private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::Config(format!("{}: {}", path, e)))
}

/// Directory holding the live files of a domain directory
fn live_files_dir(dir: &Path) -> Result<PathBuf> {
    let generation = match std::fs::read_to_string(dir.join(CURRENT_FILE)) {
        Ok(generation) => generation,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dir.to_path_buf()),
        Err(e) => return Err(GatewayError::Storage(format!("{}: {}", CURRENT_FILE, e))),
    };
    let generation = generation.trim();
    let mut components = Path::new(generation).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(dir.join(generation)),
        _ => Err(GatewayError::Storage(format!(
            "invalid generation '{}' in {}",
            generation, CURRENT_FILE
        ))),
    }
}

fn load_domain_dir(dir: &Path) -> Result<StoredCertificate> {
    let files = live_files_dir(dir)?;
    let read = |name: &str| {
        std::fs::read_to_string(files.join(name))
            .map_err(|e| GatewayError::Storage(format!("{}: {}", name, e)))
    };
    let cert_pem = read(CERT_FILE)?;
    let key_pem = read(KEY_FILE)?;
    let meta: Option<CertificateMeta> = read(META_FILE)
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok());

    let domain = match &meta {
        Some(meta) => meta.domain.clone(),
        None => dir_name_to_domain(dir)
            .ok_or_else(|| GatewayError::Storage("unnamed certificate directory".to_string()))?,
    };
    let resolver = meta.as_ref().map(|m| m.resolver.as_str()).unwrap_or("");

    let mut cert = StoredCertificate::from_pem(&domain, &cert_pem, &key_pem, resolver)?;
    if let Some(meta) = meta {
        cert.meta.issued_at = meta.issued_at;
    }
    Ok(cert)
}

fn persist(dir: &Path, meta: &CertificateMeta, cert_pem: &str, key_pem: &str) -> Result<()> {
    let storage_err =
        |what: &str, e: std::io::Error| GatewayError::Storage(format!("{} in {}: {}", what, dir.display(), e));

    let generation = format!("gen-{}", uuid::Uuid::new_v4().simple());
    let files = dir.join(&generation);
    std::fs::create_dir_all(&files).map_err(|e| storage_err("create directory", e))?;

    let meta_json = serde_json::to_string_pretty(meta)
        .map_err(|e| GatewayError::Storage(format!("serialize metadata: {}", e)))?;

    let written = write_file(&files.join(KEY_FILE), key_pem.as_bytes(), true)
        .map_err(|e| storage_err("write key", e))
        .and_then(|_| {
            write_file(&files.join(CERT_FILE), cert_pem.as_bytes(), false)
                .map_err(|e| storage_err("write certificate", e))
        })
        .and_then(|_| {
            write_file(&files.join(META_FILE), meta_json.as_bytes(), false)
                .map_err(|e| storage_err("write metadata", e))
        });
    if let Err(e) = written {
        let _ = std::fs::remove_dir_all(&files);
        return Err(e);
    }

    // The generation goes live with this one rename
    let pointer_tmp = dir.join(format!("{}.tmp", CURRENT_FILE));
    write_file(&pointer_tmp, generation.as_bytes(), false)
        .map_err(|e| storage_err("write pointer", e))?;
    std::fs::rename(&pointer_tmp, dir.join(CURRENT_FILE)).map_err(|e| storage_err("rename", e))?;

    remove_stale_generations(dir, &generation);
    debug!(path = %files.display(), "Certificate persisted");
    Ok(())
}

/// Best-effort removal of superseded generations and flat-layout files
fn remove_stale_generations(dir: &Path, live: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let result = if path.is_dir() && name != live {
            std::fs::remove_dir_all(&path)
        } else if [KEY_FILE, CERT_FILE, META_FILE].iter().any(|f| name == *f) {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "Could not remove stale certificate files");
        }
    }
}

/// Write a file; secret files are created owner-only (0600 on Unix)
pub(crate) fn write_file(path: &Path, contents: &[u8], secret: bool) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if secret {
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = secret;
        std::fs::write(path, contents)
    }
}

fn domain_dir_name(domain: &str) -> String {
    domain.replacen("*.", "_wildcard.", 1)
}

fn dir_name_to_domain(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    Some(match name.strip_prefix("_wildcard.") {
        Some(rest) => format!("*.{}", rest),
        None => name.to_string(),
    })
}

fn validate_storage_dir(path: &Path) -> Result<PathBuf> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(GatewayError::Config(format!(
            "certificate storage path '{}' must not contain '..'",
            path.display()
        )));
    }
    if path.exists() && !path.is_dir() {
        return Err(GatewayError::Config(format!(
            "certificate storage path '{}' exists but is not a directory",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}
