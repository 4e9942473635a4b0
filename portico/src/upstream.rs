//! Named upstream groups
//!
//! An upstream group is a set of backend addresses selected per request by
//! one of three strategies:
//!
//! - `round_robin` (default): weighted rotation over a shared counter
//! - `random`: uniform choice over entries (weights are ignored)
//! - `client_hash`: CRC32 of the client address host portion
//!
//! Groups are registered once at startup and immutable afterwards; only
//! the round-robin counter mutates at runtime, atomically.

use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{LazyLock, OnceLock};

use crate::error::{Error, Result};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^ \t]+)([ \t]+[^ \t]+)?$").expect("upstream name regex"));
static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^ \t]+)([ \t]+weight=[0-9]+)?$").expect("upstream entry regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    RoundRobin,
    Random,
    ClientHash,
}

impl Strategy {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(Strategy::RoundRobin),
            "random" => Some(Strategy::Random),
            "client_hash" => Some(Strategy::ClientHash),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    addr: String,
    weight: u32,
}

/// One named group of backend addresses.
#[derive(Debug)]
pub struct UpstreamGroup {
    strategy: Strategy,
    entries: Vec<Entry>,
    total_weight: u32,
    curr_idx: AtomicU32,
    normalizing: AtomicBool,
}

impl UpstreamGroup {
    /// Pick an address for a request. `client` is the remote address of
    /// the downstream connection, used only by `client_hash`.
    pub fn select(&self, client: Option<SocketAddr>) -> String {
        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(),
            Strategy::Random => self.select_random(),
            Strategy::ClientHash => self.select_client_hash(client),
        }
    }

    fn select_round_robin(&self) -> String {
        let mut idx = self.curr_idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if idx >= self.total_weight {
            self.normalize();
            idx %= self.total_weight;
        }
        for entry in &self.entries {
            if idx < entry.weight {
                return entry.addr.clone();
            }
            idx -= entry.weight;
        }
        String::new()
    }

    /// Cap the monotonic counter before it wraps. Single-flight: while one
    /// caller is normalizing, concurrent triggers are dropped. The counter
    /// is already reduced modulo `total_weight` at every selection, so this
    /// is an overflow guard, not a correctness requirement.
    fn normalize(&self) {
        if self
            .normalizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut curr = self.curr_idx.load(Ordering::Relaxed);
            while let Err(observed) = self.curr_idx.compare_exchange(
                curr,
                curr % self.total_weight,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                curr = observed;
            }
            self.normalizing.store(false, Ordering::Release);
        }
    }

    fn select_random(&self) -> String {
        let idx = rand::rng().random_range(0..self.entries.len());
        self.entries[idx].addr.clone()
    }

    fn select_client_hash(&self, client: Option<SocketAddr>) -> String {
        let Some(client) = client else {
            return String::new();
        };
        let addr = client.to_string();
        // The port is stripped at the first ':', so IPv6 literals hash
        // only the leading '['.
        let host = match addr.find(':') {
            Some(idx) => &addr[..idx],
            None => addr.as_str(),
        };
        let idx = crc32fast::hash(host.as_bytes()) % self.total_weight;
        // The hash is reduced modulo total_weight but then used directly as
        // an entry index, so weighted groups can address slots past the
        // entry list. Out-of-range answers the empty string.
        self.entries
            .get(idx as usize)
            .map(|entry| entry.addr.clone())
            .unwrap_or_default()
    }
}

/// Registry of named upstream groups.
#[derive(Debug, Default)]
pub struct Upstreams {
    groups: HashMap<String, UpstreamGroup>,
}

impl Upstreams {
    /// Build the registry from configuration.
    ///
    /// Group keys are `<name>[ <strategy>]`; entries are
    /// `<addr>[ weight=<N>]` with weight >= 1 (default 1).
    pub fn from_config(conf: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut groups = HashMap::new();

        for (name, entry_list) in conf {
            let key = name.trim_matches([' ', '\r', '\n', '\t']);
            let caps = NAME_RE
                .captures(key)
                .ok_or_else(|| Error::BadUpstream(format!("malformed upstream name: {key}")))?;

            if entry_list.is_empty() {
                return Err(Error::BadUpstream(format!("no address in upstream {key}")));
            }

            let domain = caps
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            let strategy_name = caps
                .get(2)
                .map(|m| m.as_str().trim_matches([' ', '\r', '\n', '\t']))
                .unwrap_or("round_robin");
            let strategy = Strategy::parse(strategy_name).ok_or_else(|| {
                Error::BadUpstream(format!(
                    "invalid strategy '{strategy_name}' for upstream {domain}"
                ))
            })?;

            let mut entries = Vec::with_capacity(entry_list.len());
            let mut total_weight = 0u32;

            for entry_str in entry_list {
                let entry = entry_str.trim_matches([' ', '\r', '\n', '\t']);
                let caps = ENTRY_RE.captures(entry).ok_or_else(|| {
                    Error::BadUpstream(format!("malformed address for {domain}: {entry_str}"))
                })?;

                let addr = caps
                    .get(1)
                    .map(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string();
                let weight = match caps.get(2) {
                    Some(m) => {
                        let text = m.as_str();
                        let digits = text.rsplit('=').next().unwrap_or("1");
                        digits.trim().parse::<u32>().map_err(|err| {
                            Error::BadUpstream(format!("bad weight for {addr}: {err}"))
                        })?
                    }
                    None => 1,
                };

                if weight < 1 {
                    return Err(Error::BadUpstream(format!(
                        "upstream addr {addr} weight cannot be less than 1"
                    )));
                }

                total_weight += weight;
                entries.push(Entry { addr, weight });
            }

            groups.insert(
                domain,
                UpstreamGroup {
                    strategy,
                    entries,
                    total_weight,
                    curr_idx: AtomicU32::new(0),
                    normalizing: AtomicBool::new(false),
                },
            );
        }

        Ok(Self { groups })
    }

    /// Pick an address from the named group; empty string when the group
    /// is unknown.
    pub fn addr(&self, name: &str, client: Option<SocketAddr>) -> String {
        self.groups
            .get(name)
            .map(|group| group.select(client))
            .unwrap_or_default()
    }
}

static REGISTRY: OnceLock<Upstreams> = OnceLock::new();

/// Install the process-wide upstream registry. Serving reads it lock-free
/// afterwards; installing twice is a startup bug.
pub fn install(upstreams: Upstreams) -> Result<()> {
    REGISTRY
        .set(upstreams)
        .map_err(|_| Error::BadUpstream("upstream registry already installed".to_string()))
}

/// Pick an address from the process-wide registry. Empty string when the
/// registry is not installed or the group is unknown.
pub fn addr(name: &str, client: Option<SocketAddr>) -> String {
    REGISTRY
        .get()
        .map(|registry| registry.addr(name, client))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(raw: &[(&str, &[&str])]) -> Upstreams {
        let conf = raw
            .iter()
            .map(|(name, entries)| {
                (
                    name.to_string(),
                    entries.iter().map(|e| e.to_string()).collect(),
                )
            })
            .collect();
        Upstreams::from_config(&conf).expect("build upstreams")
    }

    fn expect_sequence(registry: &Upstreams, group: &str, expected: &[&str]) {
        for want in expected {
            assert_eq!(registry.addr(group, None), *want, "group {group}");
        }
    }

    #[test]
    fn weighted_round_robin_honors_weights() {
        let registry = registry(&[(" aa  ", &["A", "B weight=2", "C"])]);
        expect_sequence(&registry, "aa", &["B", "B", "C", "A", "B", "B", "C", "A"]);
    }

    #[test]
    fn unweighted_round_robin_rotates() {
        let registry = registry(&[(" bb round_robin ", &["A", "B", "C"])]);
        expect_sequence(&registry, "bb", &["B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn random_picks_a_member() {
        let registry = registry(&[("cc random", &["A", "B", "C"])]);
        for _ in 0..32 {
            let addr = registry.addr("cc", None);
            assert!(["A", "B", "C"].contains(&addr.as_str()));
        }
    }

    #[test]
    fn client_hash_is_stable() {
        let registry = registry(&[("dd client_hash", &["A", "B", "C"])]);
        for octet in 0..100u8 {
            let client: SocketAddr = format!("10.1.2.{octet}:4567").parse().unwrap();
            let first = registry.addr("dd", Some(client));
            let second = registry.addr("dd", Some(client));
            assert!(!first.is_empty());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn client_hash_without_client_is_empty() {
        let registry = registry(&[("dd client_hash", &["A", "B", "C"])]);
        assert_eq!(registry.addr("dd", None), "");
    }

    #[test]
    fn unknown_group_is_empty() {
        let registry = registry(&[("aa", &["A"])]);
        assert_eq!(registry.addr("nope", None), "");
    }

    #[test]
    fn bad_registrations_fail() {
        assert!(Upstreams::from_config(
            &[("aa bogus_strategy".to_string(), vec!["A".to_string()])]
                .into_iter()
                .collect()
        )
        .is_err());

        assert!(Upstreams::from_config(
            &[("aa".to_string(), vec![])].into_iter().collect()
        )
        .is_err());

        assert!(Upstreams::from_config(
            &[("aa".to_string(), vec!["A weight=0".to_string()])]
                .into_iter()
                .collect()
        )
        .is_err());
    }
}
