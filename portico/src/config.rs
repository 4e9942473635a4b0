//! Configuration loading
//!
//! Configuration comes from a YAML file selected with `--conf` (defaulting
//! to `conf.yaml` next to the executable), with environment overrides under
//! the `PORTICO_` prefix. Shape:
//!
//! ```yaml
//! base:
//!   log_level: info
//!   log_file: /var/log/portico/portico.log
//!   tls_email: ops@example.com
//!   cert_cache: /var/lib/portico/certs
//! upstreams:
//!   backend round_robin:
//!     - 10.0.0.1:8080 weight=2
//!     - 10.0.0.2:8080
//! sites:
//!   www.example.com:
//!     - type: https
//!       autocert: true
//!       rules:
//!         - /:
//!             - set-header X-Forwarded-Proto https
//!             - proxy http://{up:backend}{fullpath}
//! ```

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process-wide settings.
    #[serde(default)]
    pub base: BaseConfig,

    /// Named upstream groups: `name[ strategy]` -> `[addr[ weight=N]…]`.
    #[serde(default)]
    pub upstreams: HashMap<String, Vec<String>>,

    /// Host -> site declarations.
    #[serde(default)]
    pub sites: HashMap<String, Vec<SiteConfig>>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Log level threshold (debug, info, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file path. Files roll daily with a date suffix. When unset,
    /// logs go to stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Contact email for the ACME account.
    #[serde(default)]
    pub tls_email: Option<String>,

    /// On-disk cache directory for ACME account credentials and issued
    /// certificates.
    #[serde(default)]
    pub cert_cache: Option<PathBuf>,

    /// ACME directory URL.
    #[serde(default = "default_acme_directory")]
    pub acme_directory: String,

    /// End-to-end deadline for a single exchange, in seconds. Established
    /// WebSocket bridges are exempt.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            tls_email: None,
            cert_cache: None,
            acme_directory: default_acme_directory(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// One site declaration under a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    /// `http` or `https`. May be omitted when the port implies it.
    #[serde(default, rename = "type")]
    pub site_type: Option<String>,

    /// Listen port. May be omitted when the type implies it.
    #[serde(default)]
    pub port: Option<u16>,

    /// Obtain the certificate from the ACME directory instead of files.
    #[serde(default)]
    pub autocert: bool,

    /// PEM private key path for a static certificate.
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,

    /// PEM certificate chain path for a static certificate.
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,

    /// Path prefix -> action list, applied outermost first.
    #[serde(default)]
    pub rules: Vec<HashMap<String, Vec<String>>>,
}

/// Listener protocol of a site, after inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl SiteConfig {
    /// Resolve the effective scheme and port of this site.
    ///
    /// Port 80 implies `http`, port 443 implies `https`, and vice versa;
    /// any other combination must state both fields explicitly.
    pub fn scheme_and_port(&self, host: &str) -> Result<(Scheme, u16)> {
        let scheme = match self.site_type.as_deref() {
            Some("http") => Some(Scheme::Http),
            Some("https") => Some(Scheme::Https),
            Some(other) => {
                return Err(Error::BadSite {
                    host: host.to_string(),
                    reason: format!("invalid site type {other}"),
                })
            }
            None => None,
        };

        match (scheme, self.port) {
            (Some(scheme), Some(port)) => Ok((scheme, port)),
            (Some(Scheme::Http), None) => Ok((Scheme::Http, 80)),
            (Some(Scheme::Https), None) => Ok((Scheme::Https, 443)),
            (None, Some(80)) => Ok((Scheme::Http, 80)),
            (None, Some(443)) => Ok((Scheme::Https, 443)),
            (None, Some(port)) => Err(Error::BadSite {
                host: host.to_string(),
                reason: format!("cannot infer type for port {port}"),
            }),
            (None, None) => Err(Error::BadSite {
                host: host.to_string(),
                reason: "site needs a type or a port".to_string(),
            }),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, with `PORTICO_`-prefixed
    /// environment variables taking precedence.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PORTICO_").split("__"))
            .extract()?;
        Ok(config)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(site_type: Option<&str>, port: Option<u16>) -> SiteConfig {
        SiteConfig {
            site_type: site_type.map(String::from),
            port,
            ..SiteConfig::default()
        }
    }

    #[test]
    fn scheme_inference() {
        assert_eq!(
            site(Some("http"), None).scheme_and_port("a").unwrap(),
            (Scheme::Http, 80)
        );
        assert_eq!(
            site(Some("https"), None).scheme_and_port("a").unwrap(),
            (Scheme::Https, 443)
        );
        assert_eq!(
            site(None, Some(80)).scheme_and_port("a").unwrap(),
            (Scheme::Http, 80)
        );
        assert_eq!(
            site(None, Some(443)).scheme_and_port("a").unwrap(),
            (Scheme::Https, 443)
        );
        assert_eq!(
            site(Some("https"), Some(8443)).scheme_and_port("a").unwrap(),
            (Scheme::Https, 8443)
        );
    }

    #[test]
    fn ambiguous_sites_are_rejected() {
        assert!(site(None, Some(8080)).scheme_and_port("a").is_err());
        assert!(site(None, None).scheme_and_port("a").is_err());
        assert!(site(Some("gopher"), Some(70)).scheme_and_port("a").is_err());
    }

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
base:
  log_level: debug
  tls_email: ops@example.com
upstreams:
  backend:
    - 10.0.0.1:8080 weight=2
    - 10.0.0.2:8080
sites:
  www.example.com:
    - port: 443
      autocert: true
      rules:
        - /:
            - proxy http://{up:backend}{fullpath}
"#;
        let config: Config = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();

        assert_eq!(config.base.log_level, "debug");
        assert_eq!(config.base.request_timeout_secs, 300);
        assert_eq!(config.upstreams["backend"].len(), 2);
        let sites = &config.sites["www.example.com"];
        assert_eq!(sites.len(), 1);
        assert!(sites[0].autocert);
        assert_eq!(
            sites[0].scheme_and_port("www.example.com").unwrap(),
            (Scheme::Https, 443)
        );
    }
}
