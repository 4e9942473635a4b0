//! OCSP stapling
//!
//! Staples are fetched from the responder named in the leaf's authority
//! information access extension and cached until the response's
//! `nextUpdate`. A handshake that misses the cache is served unstapled
//! while a background task refreshes the staple; a `Good` response is
//! cached, anything else is logged and dropped so the next miss retries.
//! OCSP failures never fail the handshake.

use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_rustls::rustls::sign::CertifiedKey;
use x509_cert::der::asn1::{AnyRef, ObjectIdentifier, OctetString};
use x509_cert::der::{Decode, Encode};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus,
    Request, TbsRequest, Version,
};

use crate::error::{Error, Result};

const OID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

fn ocsp_client() -> &'static reqwest::Client {
    static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);
    &CLIENT
}

struct StapleEntry {
    der: Vec<u8>,
    expires: SystemTime,
}

/// Per-host OCSP staple cache with single-flight background refresh.
pub struct OcspStapler {
    cache: Mutex<HashMap<String, StapleEntry>>,
    inflight: Mutex<HashSet<String>>,
    handle: tokio::runtime::Handle,
}

impl OcspStapler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            handle,
        }
    }

    /// Attach a cached staple to the certificate, or kick off a background
    /// fetch and serve it unstapled this time.
    pub fn staple(self: &Arc<Self>, host: &str, certified: Arc<CertifiedKey>) -> Arc<CertifiedKey> {
        if let Some(der) = self.cached(host) {
            let mut stapled = (*certified).clone();
            stapled.ocsp = Some(der);
            return Arc::new(stapled);
        }
        self.spawn_fetch(host, &certified);
        certified
    }

    /// Cached staple for a host; expired entries are evicted on lookup.
    fn cached(&self, host: &str) -> Option<Vec<u8>> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = cache.get(host) {
            if SystemTime::now() > entry.expires {
                cache.remove(host);
                return None;
            }
            return Some(entry.der.clone());
        }
        None
    }

    fn spawn_fetch(self: &Arc<Self>, host: &str, certified: &Arc<CertifiedKey>) {
        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !inflight.insert(host.to_string()) {
                return;
            }
        }

        let chain: Vec<Vec<u8>> = certified
            .cert
            .iter()
            .map(|cert| cert.as_ref().to_vec())
            .collect();
        let stapler = self.clone();
        let host = host.to_string();

        self.handle.spawn(async move {
            match fetch_staple(&chain).await {
                Ok(fetched) => {
                    if let (true, Some(expires)) = (fetched.good, fetched.next_update) {
                        let mut cache = stapler
                            .cache
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        cache.insert(
                            host.clone(),
                            StapleEntry {
                                der: fetched.der,
                                expires,
                            },
                        );
                    } else {
                        tracing::error!(
                            "ocsp status for {host} is not good or carries no nextUpdate; not cached"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!("get OCSP for {host} failed: {err}");
                }
            }

            stapler
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&host);
        });
    }
}

struct FetchedStaple {
    der: Vec<u8>,
    good: bool,
    next_update: Option<SystemTime>,
}

/// One RFC 6960 exchange: build the request for the leaf against its
/// issuer, POST it to the responder, and parse the result.
async fn fetch_staple(chain: &[Vec<u8>]) -> Result<FetchedStaple> {
    let leaf_der = chain
        .first()
        .ok_or_else(|| Error::Ocsp("empty certificate chain".to_string()))?;
    let issuer_der = chain
        .get(1)
        .ok_or_else(|| Error::Ocsp("certificate chain carries no issuer".to_string()))?;

    let (_, leaf) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|err| Error::Ocsp(format!("parse leaf: {err}")))?;
    let (_, issuer) = x509_parser::parse_x509_certificate(issuer_der)
        .map_err(|err| Error::Ocsp(format!("parse issuer: {err}")))?;

    let responder = ocsp_responder_url(&leaf)
        .ok_or_else(|| Error::Ocsp("leaf names no OCSP responder".to_string()))?;

    let request_der = build_request(&leaf, &issuer)?;

    let response = ocsp_client()
        .post(&responder)
        .header(http::header::CONTENT_TYPE, "application/ocsp-request")
        .body(request_der)
        .send()
        .await
        .map_err(|err| Error::Ocsp(format!("request ocsp: {err}")))?;
    let body = response
        .bytes()
        .await
        .map_err(|err| Error::Ocsp(format!("read ocsp response: {err}")))?;

    let parsed = OcspResponse::from_der(&body)
        .map_err(|err| Error::Ocsp(format!("parse ocsp response: {err}")))?;
    if parsed.response_status != OcspResponseStatus::Successful {
        return Err(Error::Ocsp(format!(
            "responder answered {:?}",
            parsed.response_status
        )));
    }
    let response_bytes = parsed
        .response_bytes
        .ok_or_else(|| Error::Ocsp("successful response carries no bytes".to_string()))?;
    let basic = BasicOcspResponse::from_der(response_bytes.response.as_bytes())
        .map_err(|err| Error::Ocsp(format!("parse basic response: {err}")))?;
    let single = basic
        .tbs_response_data
        .responses
        .first()
        .ok_or_else(|| Error::Ocsp("response carries no certificate status".to_string()))?;

    let good = matches!(single.cert_status, CertStatus::Good(_));
    let next_update = single
        .next_update
        .map(|time| UNIX_EPOCH + time.0.to_unix_duration());

    Ok(FetchedStaple {
        der: body.to_vec(),
        good,
        next_update,
    })
}

/// First OCSP responder URL from the authority information access
/// extension.
fn ocsp_responder_url(cert: &x509_parser::certificate::X509Certificate<'_>) -> Option<String> {
    use x509_parser::extensions::{GeneralName, ParsedExtension};

    for extension in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = extension.parsed_extension() {
            for access in &aia.accessdescs {
                if access.access_method.to_id_string() == OID_AD_OCSP {
                    if let GeneralName::URI(uri) = access.access_location {
                        return Some(uri.to_string());
                    }
                }
            }
        }
    }
    None
}

/// DER-encode an unsigned OCSP request for the leaf.
fn build_request(
    leaf: &x509_parser::certificate::X509Certificate<'_>,
    issuer: &x509_parser::certificate::X509Certificate<'_>,
) -> Result<Vec<u8>> {
    let issuer_name_hash = Sha1::digest(issuer.tbs_certificate.subject.as_raw());
    let issuer_key_hash = Sha1::digest(
        issuer
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .as_ref(),
    );

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: OID_SHA1,
            parameters: Some(AnyRef::NULL.into()),
        },
        issuer_name_hash: OctetString::new(issuer_name_hash.to_vec())
            .map_err(|err| Error::Ocsp(format!("encode issuer name hash: {err}")))?,
        issuer_key_hash: OctetString::new(issuer_key_hash.to_vec())
            .map_err(|err| Error::Ocsp(format!("encode issuer key hash: {err}")))?,
        serial_number: SerialNumber::new(leaf.raw_serial())
            .map_err(|err| Error::Ocsp(format!("encode serial: {err}")))?,
    };

    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions: None,
        },
        optional_signature: None,
    };

    request
        .to_der()
        .map_err(|err| Error::Ocsp(format!("encode ocsp request: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_misses_after_expiry() {
        let stapler = Arc::new(OcspStapler::new(tokio::runtime::Handle::current()));

        stapler
            .cache
            .lock()
            .unwrap()
            .insert(
                "fresh.example".to_string(),
                StapleEntry {
                    der: vec![1, 2, 3],
                    expires: SystemTime::now() + std::time::Duration::from_secs(3600),
                },
            );
        stapler
            .cache
            .lock()
            .unwrap()
            .insert(
                "stale.example".to_string(),
                StapleEntry {
                    der: vec![4, 5, 6],
                    expires: SystemTime::now() - std::time::Duration::from_secs(1),
                },
            );

        assert_eq!(stapler.cached("fresh.example"), Some(vec![1, 2, 3]));
        assert_eq!(stapler.cached("stale.example"), None);
        // Eviction happened on the miss.
        assert!(!stapler.cache.lock().unwrap().contains_key("stale.example"));
    }

    #[tokio::test]
    async fn fetch_requires_an_issuer_in_the_chain() {
        let err = fetch_staple(&[vec![0u8; 8]]).await;
        assert!(matches!(err, Err(Error::Ocsp(_))));
    }
}
