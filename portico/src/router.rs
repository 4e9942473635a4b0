//! Host and path-prefix routing
//!
//! Each host owns a radix tree of configured path prefixes. A prefix `P`
//! is registered both as the exact path `P` and as `P/{*rest}`, so `/api`
//! matches `/api` itself and everything below it. Prefixes may carry named
//! captures (`/user/{id}`), which are exposed to the `mux:name` variable
//! through [`RouteParams`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::ActionHandler;
use crate::error::{Error, Result};

/// Named captures of the matched route, attached to request extensions.
#[derive(Debug, Clone, Default)]
pub struct RouteParams(pub HashMap<String, String>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// The `Host` header observed before any action rewrote the request,
/// attached to request extensions at dispatch.
#[derive(Debug, Clone)]
pub struct OriginalHost(pub String);

/// Path-prefix tree for one host.
#[derive(Default)]
pub struct PathRouter {
    tree: matchit::Router<usize>,
    handlers: Vec<Arc<dyn ActionHandler>>,
}

impl PathRouter {
    /// Register a prefix and its compiled handler chain.
    pub fn add_rule(&mut self, prefix: &str, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let idx = self.handlers.len();
        self.handlers.push(handler);

        self.tree.insert(prefix, idx).map_err(|err| Error::BadSite {
            host: String::new(),
            reason: format!("cannot register rule path {prefix}: {err}"),
        })?;

        // Descendant paths of the prefix. Duplicates can arise when two
        // rules normalize to the same subtree; the first registration wins.
        let base = prefix.trim_end_matches('/');
        let wildcard = format!("{base}/{{*rest}}");
        if let Err(err) = self.tree.insert(&wildcard, idx) {
            tracing::warn!(prefix, "rule subtree already covered: {err}");
        }

        Ok(())
    }

    /// Match a request path, returning the handler and any named captures.
    pub fn lookup(&self, path: &str) -> Option<(Arc<dyn ActionHandler>, RouteParams)> {
        let matched = self.tree.at(path).ok()?;
        let handler = self.handlers.get(*matched.value)?.clone();
        let params = RouteParams(
            matched
                .params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        );
        Some((handler, params))
    }
}

/// Host-keyed routing table of one server slot.
#[derive(Default)]
pub struct HostRouter {
    hosts: HashMap<String, PathRouter>,
}

impl HostRouter {
    /// Router for a host, created on first use during configuration.
    pub fn host_mut(&mut self, host: &str) -> &mut PathRouter {
        self.hosts.entry(host.to_string()).or_default()
    }

    /// Match a request. The host is compared without its port.
    pub fn lookup(&self, host: &str, path: &str) -> Option<(Arc<dyn ActionHandler>, RouteParams)> {
        self.hosts.get(strip_port(host))?.lookup(path)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Drop a trailing `:port` from a Host header value.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
