//! Certificate selection for TLS handshakes
//!
//! Each TLS host registers either a static PEM pair or autocert. Static
//! certificates live in a refresh-on-expiry cache keyed by their file
//! paths; autocert certificates come from the ACME manager and get an OCSP
//! staple attached when one is cached.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::acme::AcmeManager;
use crate::error::{Error, Result};
use crate::ocsp::OcspStapler;

/// Where a host's certificate comes from.
#[derive(Debug, Clone)]
pub enum CertSource {
    /// Issued and renewed through the ACME manager.
    AutoCert,
    /// Loaded from PEM files on disk.
    Static { cert: PathBuf, key: PathBuf },
}

/// Host -> certificate source, assembled once at startup.
#[derive(Debug, Default)]
pub struct CertRegistry {
    entries: HashMap<String, CertSource>,
}

impl CertRegistry {
    pub fn insert(&mut self, host: &str, source: CertSource) -> Result<()> {
        if self.entries.contains_key(host) {
            return Err(Error::DuplicateCertHost(host.to_string()));
        }
        self.entries.insert(host.to_string(), source);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct CachedCert {
    certified: Arc<CertifiedKey>,
    not_before: i64,
    not_after: i64,
}

impl CachedCert {
    fn is_fresh(&self, now: i64) -> bool {
        is_fresh(now, self.not_before, self.not_after)
    }
}

/// A cached certificate is fresh while `now` is inside
/// `[not_before, not_after - 24h)`.
fn is_fresh(now: i64, not_before: i64, not_after: i64) -> bool {
    now >= not_before && now + 24 * 3600 < not_after
}

/// Cache of static certificates keyed by `(cert_path, key_path)`. Entries
/// are reloaded from disk once their leaf is within a day of expiry.
#[derive(Default)]
pub struct StaticCertCache {
    cache: Mutex<HashMap<(PathBuf, PathBuf), CachedCert>>,
}

impl StaticCertCache {
    pub fn get(&self, cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
        let now = unix_now();
        let cache_key = (cert_path.to_path_buf(), key_path.to_path_buf());

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = cache.get(&cache_key) {
            if entry.is_fresh(now) {
                return Ok(entry.certified.clone());
            }
        }

        let (certified, not_before, not_after) = load_certified_key(cert_path, key_path)?;
        let certified_out = certified.clone();
        cache.insert(
            cache_key,
            CachedCert {
                certified,
                not_before,
                not_after,
            },
        );
        Ok(certified_out)
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Load a PEM certificate chain and private key into a [`CertifiedKey`],
/// returning the leaf validity bounds alongside.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Arc<CertifiedKey>, i64, i64)> {
    let cert_file = File::open(cert_path)?;
    let key_file = File::open(key_path)?;
    certified_from_pem(BufReader::new(cert_file), BufReader::new(key_file))
}

/// Parse a PEM certificate chain and private key into a [`CertifiedKey`],
/// returning the leaf validity bounds alongside.
pub fn certified_from_pem(
    mut cert_reader: impl std::io::BufRead,
    mut key_reader: impl std::io::BufRead,
) -> Result<(Arc<CertifiedKey>, i64, i64)> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()?;
    if chain.is_empty() {
        return Err(Error::Tls("PEM input contains no certificates".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Tls("PEM input contains no private key".to_string()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|err| Error::Tls(format!("unsupported private key: {err}")))?;

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref())
        .map_err(|err| Error::Tls(format!("parse leaf certificate: {err}")))?;
    let not_before = leaf.validity().not_before.timestamp();
    let not_after = leaf.validity().not_after.timestamp();

    let certified = Arc::new(CertifiedKey::new(chain, signing_key));
    Ok((certified, not_before, not_after))
}

/// rustls certificate resolver routing each handshake by the registered
/// entry of its SNI host.
pub struct CertResolver {
    entries: HashMap<String, CertSource>,
    static_cache: StaticCertCache,
    acme: Arc<AcmeManager>,
    ocsp: Arc<OcspStapler>,
}

impl CertResolver {
    pub fn new(registry: CertRegistry, acme: Arc<AcmeManager>, ocsp: Arc<OcspStapler>) -> Self {
        Self {
            entries: registry.entries,
            static_cache: StaticCertCache::default(),
            acme,
            ocsp,
        }
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("hosts", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            tracing::debug!("handshake without SNI refused");
            return None;
        };

        match self.entries.get(name) {
            None => {
                tracing::error!("no certificates available for {name}");
                None
            }
            Some(CertSource::Static { cert, key }) => match self.static_cache.get(cert, key) {
                Ok(certified) => Some(certified),
                Err(err) => {
                    tracing::error!("load cert from file for {name} failed: {err}");
                    None
                }
            },
            Some(CertSource::AutoCert) => {
                let certified = self.acme.certificate(name)?;
                Some(self.ocsp.staple(name, certified))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_hosts() {
        let mut registry = CertRegistry::default();
        registry
            .insert("www.example.com", CertSource::AutoCert)
            .unwrap();
        let err = registry.insert(
            "www.example.com",
            CertSource::Static {
                cert: "a.pem".into(),
                key: "a.key".into(),
            },
        );
        assert!(matches!(err, Err(Error::DuplicateCertHost(_))));
    }

    #[test]
    fn freshness_window_excludes_last_day() {
        let not_before = 1_000;
        let not_after = 1_000 + 30 * 24 * 3600;

        assert!(!is_fresh(999, not_before, not_after));
        assert!(is_fresh(1_000, not_before, not_after));
        assert!(is_fresh(1_000 + 28 * 24 * 3600, not_before, not_after));
        assert!(!is_fresh(1_000 + 29 * 24 * 3600 + 1, not_before, not_after));
        assert!(!is_fresh(1_000 + 31 * 24 * 3600, not_before, not_after));
    }

    #[test]
    fn missing_files_propagate_errors() {
        let cache = StaticCertCache::default();
        let err = cache.get(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(err.is_err());
    }
}
