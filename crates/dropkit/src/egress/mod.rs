//! Egress identities: the network path (proxy or direct) a worker uses.

mod proxy;

pub use proxy::{ProxyEndpoint, ProxyParseError, ProxyScheme};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

/// How a worker reaches the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EgressIdentity {
    /// No proxy.
    Direct,
    /// Through a proxy endpoint.
    Proxy(ProxyEndpoint),
}

impl EgressIdentity {
    pub fn is_proxy(&self) -> bool {
        matches!(self, EgressIdentity::Proxy(_))
    }
}

impl fmt::Display for EgressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressIdentity::Direct => write!(f, "direct"),
            EgressIdentity::Proxy(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// The set of proxies available to the worker pool.
#[derive(Debug, Clone, Default)]
pub struct IdentityPool {
    proxies: Vec<ProxyEndpoint>,
}

impl IdentityPool {
    /// Pool with no proxies; workers connect directly.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn from_proxies(proxies: Vec<ProxyEndpoint>) -> Self {
        Self { proxies }
    }

    /// Parse one proxy per line. Blank lines and `#` comments are skipped,
    /// invalid lines are logged and skipped.
    pub fn from_lines(contents: &str) -> Self {
        let proxies = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match ProxyEndpoint::parse(line) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!("Skipping proxy entry: {}", e);
                    None
                }
            })
            .collect();
        Self { proxies }
    }

    /// Load proxies from a file. A missing file means no proxies.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            info!(
                "Proxy file {} not found - running without proxies",
                path.display()
            );
            return Ok(Self::direct());
        }

        let contents = std::fs::read_to_string(path)?;
        let pool = Self::from_lines(&contents);
        if pool.is_empty() {
            warn!("No valid proxies found in {}", path.display());
        } else {
            info!("Loaded {} proxies from {}", pool.len(), path.display());
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn proxies(&self) -> &[ProxyEndpoint] {
        &self.proxies
    }

    /// Randomize the order identities are handed out in.
    pub fn shuffle(&mut self) {
        self.proxies.shuffle(&mut rand::thread_rng());
    }

    /// Distinct identities for up to `max` workers.
    ///
    /// Always returns at least one identity: a single direct connection
    /// when no proxies are configured.
    pub fn identities(&self, max: usize) -> Vec<EgressIdentity> {
        if self.proxies.is_empty() {
            return vec![EgressIdentity::Direct];
        }
        self.proxies
            .iter()
            .take(max.max(1))
            .cloned()
            .map(EgressIdentity::Proxy)
            .collect()
    }
}

/// Count how many workers use each identity label.
pub fn distribution<'a, I>(identities: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a EgressIdentity>,
{
    let mut counts = BTreeMap::new();
    for identity in identities {
        *counts.entry(identity.to_string()).or_insert(0) += 1;
    }
    counts
}
