//! ACME (autocert) certificate manager
//!
//! Hosts marked `autocert` get their certificates from the configured ACME
//! directory over HTTP-01: the port-80 slot serves
//! `/.well-known/acme-challenge/{token}` out of this manager's challenge
//! map while an order is being validated. Account credentials and issued
//! certificates persist under `cert_cache`, and leaves within 30 days of
//! expiry are renewed in the background.
//!
//! Issuance is asynchronous: a handshake for a host with no usable
//! certificate fails while the first order runs, and succeeds once the
//! certificate lands in the cache.

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::certs::{certified_from_pem, load_certified_key, unix_now};
use crate::config::BaseConfig;
use crate::error::{Error, Result};

/// Renew once the leaf is this close to `notAfter`.
const RENEW_WINDOW_SECS: i64 = 30 * 24 * 3600;

/// Bound on order polling before the attempt is abandoned.
const MAX_POLL_ATTEMPTS: u32 = 10;

struct IssuedCert {
    certified: Arc<CertifiedKey>,
    not_after: i64,
}

/// Process-wide autocert state.
pub struct AcmeManager {
    directory: String,
    email: Option<String>,
    cache_dir: Option<PathBuf>,
    allowed: OnceLock<HashSet<String>>,
    certs: Mutex<HashMap<String, IssuedCert>>,
    challenges: Mutex<HashMap<String, String>>,
    issuing: Mutex<HashSet<String>>,
    handle: tokio::runtime::Handle,
}

impl AcmeManager {
    pub fn new(base: &BaseConfig, handle: tokio::runtime::Handle) -> Self {
        Self {
            directory: base.acme_directory.clone(),
            email: base.tls_email.clone(),
            cache_dir: base.cert_cache.clone(),
            allowed: OnceLock::new(),
            certs: Mutex::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
            issuing: Mutex::new(HashSet::new()),
            handle,
        }
    }

    /// Restrict issuance to the hosts configured with `autocert = true`.
    /// Challenges for other names are refused.
    pub fn set_host_whitelist(&self, hosts: impl IntoIterator<Item = String>) {
        let _ = self.allowed.set(hosts.into_iter().collect());
    }

    /// Key authorization for a pending HTTP-01 challenge token.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(token)
            .cloned()
    }

    /// Certificate for a host, from memory or the on-disk cache. A miss
    /// (or a leaf close to expiry) schedules background issuance.
    pub fn certificate(self: &Arc<Self>, host: &str) -> Option<Arc<CertifiedKey>> {
        let now = unix_now();

        {
            let certs = self
                .certs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(issued) = certs.get(host) {
                let certified = issued.certified.clone();
                let near_expiry = now + RENEW_WINDOW_SECS >= issued.not_after;
                drop(certs);
                if near_expiry {
                    self.spawn_issue(host);
                }
                return Some(certified);
            }
        }

        if let Some(dir) = &self.cache_dir {
            let cert_path = dir.join(format!("{host}.crt"));
            let key_path = dir.join(format!("{host}.key"));
            if cert_path.exists() && key_path.exists() {
                match load_certified_key(&cert_path, &key_path) {
                    Ok((certified, _, not_after)) => {
                        self.certs
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(
                                host.to_string(),
                                IssuedCert {
                                    certified: certified.clone(),
                                    not_after,
                                },
                            );
                        if now + RENEW_WINDOW_SECS >= not_after {
                            self.spawn_issue(host);
                        }
                        return Some(certified);
                    }
                    Err(err) => {
                        tracing::warn!("cached certificate for {host} unusable: {err}");
                    }
                }
            }
        }

        self.spawn_issue(host);
        None
    }

    fn is_allowed(&self, host: &str) -> bool {
        self.allowed
            .get()
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    fn spawn_issue(self: &Arc<Self>, host: &str) {
        if !self.is_allowed(host) {
            tracing::error!("refusing ACME issuance for unlisted host {host}");
            return;
        }

        {
            let mut issuing = self
                .issuing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !issuing.insert(host.to_string()) {
                return;
            }
        }

        let manager = self.clone();
        let host = host.to_string();
        self.handle.spawn(async move {
            if let Err(err) = manager.issue(&host).await {
                tracing::error!("auto cert for {host} failed: {err}");
            }
            manager
                .issuing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&host);
        });
    }

    /// ACME account, loaded from the cache directory when present.
    async fn account(&self) -> Result<Account> {
        let creds_path = self.cache_dir.as_ref().map(|dir| dir.join("account.json"));

        if let Some(path) = &creds_path {
            if let Ok(data) = tokio::fs::read(path).await {
                match serde_json::from_slice::<AccountCredentials>(&data) {
                    Ok(credentials) => match Account::from_credentials(credentials).await {
                        Ok(account) => return Ok(account),
                        Err(err) => {
                            tracing::warn!("stored ACME credentials rejected: {err}");
                        }
                    },
                    Err(err) => {
                        tracing::warn!("stored ACME credentials unreadable: {err}");
                    }
                }
            }
        }

        let contact: Vec<String> = self
            .email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory,
            None,
        )
        .await
        .map_err(acme_err)?;

        if let Some(path) = &creds_path {
            if let Some(dir) = path.parent() {
                let _ = tokio::fs::create_dir_all(dir).await;
            }
            match serde_json::to_vec(&credentials) {
                Ok(data) => {
                    if let Err(err) = tokio::fs::write(path, data).await {
                        tracing::warn!("persist ACME credentials failed: {err}");
                    }
                }
                Err(err) => tracing::warn!("serialize ACME credentials failed: {err}"),
            }
        }

        Ok(account)
    }

    /// Run one order to completion and store the issued certificate.
    async fn issue(&self, host: &str) -> Result<()> {
        tracing::info!("requesting certificate for {host}");

        let account = self.account().await?;
        let identifier = Identifier::Dns(host.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .map_err(acme_err)?;

        let authorizations = order.authorizations().await.map_err(acme_err)?;
        let mut tokens = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(Error::Acme(format!("authorization state {status:?}")));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .ok_or_else(|| Error::Acme("no http-01 challenge offered".to_string()))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            tokens.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await.map_err(acme_err)?;
        }

        let mut delay = Duration::from_millis(500);
        let mut attempts = 0u32;
        let status = loop {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await.map_err(acme_err)?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid => {
                    break state.status;
                }
                _ => {}
            }
            attempts += 1;
            if attempts >= MAX_POLL_ATTEMPTS {
                self.drop_challenges(&tokens);
                return Err(Error::Acme("order never became ready".to_string()));
            }
            delay = (delay * 2).min(Duration::from_secs(8));
        };

        self.drop_challenges(&tokens);
        if matches!(status, OrderStatus::Invalid) {
            return Err(Error::Acme("order failed validation".to_string()));
        }

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|err| Error::Acme(format!("csr params: {err}")))?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair =
            KeyPair::generate().map_err(|err| Error::Acme(format!("generate key: {err}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|err| Error::Acme(format!("serialize csr: {err}")))?;

        order.finalize(csr.der()).await.map_err(acme_err)?;

        let mut attempts = 0u32;
        let cert_chain_pem = loop {
            match order.certificate().await.map_err(acme_err)? {
                Some(pem) => break pem,
                None => {
                    attempts += 1;
                    if attempts >= MAX_POLL_ATTEMPTS {
                        return Err(Error::Acme("certificate never became available".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        let key_pem = key_pair.serialize_pem();

        if let Some(dir) = &self.cache_dir {
            let _ = tokio::fs::create_dir_all(dir).await;
            if let Err(err) =
                tokio::fs::write(dir.join(format!("{host}.crt")), cert_chain_pem.as_bytes()).await
            {
                tracing::warn!("persist certificate for {host} failed: {err}");
            }
            if let Err(err) =
                tokio::fs::write(dir.join(format!("{host}.key")), key_pem.as_bytes()).await
            {
                tracing::warn!("persist private key for {host} failed: {err}");
            }
        }

        let (certified, _, not_after) =
            certified_from_pem(cert_chain_pem.as_bytes(), key_pem.as_bytes())?;
        self.certs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                host.to_string(),
                IssuedCert {
                    certified,
                    not_after,
                },
            );

        tracing::info!("certificate for {host} issued");
        Ok(())
    }

    fn drop_challenges(&self, tokens: &[String]) {
        let mut challenges = self
            .challenges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for token in tokens {
            challenges.remove(token);
        }
    }
}

fn acme_err(err: instant_acme::Error) -> Error {
    Error::Acme(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;

    fn manager() -> Arc<AcmeManager> {
        Arc::new(AcmeManager::new(
            &BaseConfig::default(),
            tokio::runtime::Handle::current(),
        ))
    }

    #[tokio::test]
    async fn challenge_map_round_trips() {
        let manager = manager();
        manager
            .challenges
            .lock()
            .unwrap()
            .insert("token-1".to_string(), "token-1.keyauth".to_string());

        assert_eq!(
            manager.challenge_response("token-1").as_deref(),
            Some("token-1.keyauth")
        );
        assert_eq!(manager.challenge_response("token-2"), None);

        manager.drop_challenges(&["token-1".to_string()]);
        assert_eq!(manager.challenge_response("token-1"), None);
    }

    #[tokio::test]
    async fn unlisted_hosts_are_refused() {
        let manager = manager();
        manager.set_host_whitelist(vec!["allowed.example".to_string()]);

        assert!(manager.is_allowed("allowed.example"));
        assert!(!manager.is_allowed("other.example"));

        // A refused host schedules nothing and stays certificate-less.
        assert!(manager.certificate("other.example").is_none());
        assert!(manager.issuing.lock().unwrap().is_empty());
    }
}
