//! Seams to the external path-resolution service.
//!
//! Path-aware routing itself is not implemented here: a [`PathResolver`]
//! answers name lookups and path queries, a [`PathProber`] measures a path.
//! [`StaticResolver`] serves a topology loaded from a TOML file, which is
//! enough for fixed deployments and tests.

use crate::addr::{IsdAs, PathAddr};
use crate::error::{ProbeError, ResolveError};
use crate::path::{Path, PathInterface};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Source of names and path topology
#[async_trait]
pub trait PathResolver: Send + Sync + fmt::Debug {
    /// Identity of the local domain
    fn local_ia(&self) -> IsdAs;

    /// Look up a host name, returning its domain and IP if known.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the lookup service fails.
    async fn resolve_name(&self, host: &str) -> Result<Option<(IsdAs, IpAddr)>, ResolveError>;

    /// Paths from the local domain to `destination`, in resolver preference order.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the topology service fails.
    async fn query_paths(&self, destination: IsdAs) -> Result<Vec<Path>, ResolveError>;
}

/// Liveness/latency measurement of a single path
#[async_trait]
pub trait PathProber: Send + Sync + fmt::Debug {
    /// Probe `path` towards `remote`, returning the measured latency.
    ///
    /// Callers bound this with their own timeout.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError` if the path did not answer.
    async fn probe(&self, remote: &PathAddr, path: &Path) -> Result<Duration, ProbeError>;
}

/// Prober answering from advertised path metadata
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataProber;

#[async_trait]
impl PathProber for MetadataProber {
    async fn probe(&self, _remote: &PathAddr, path: &Path) -> Result<Duration, ProbeError> {
        if path.is_expired() {
            return Err(ProbeError::Expired);
        }
        Ok(path.metadata.latency.unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    local_ia: String,
    #[serde(default)]
    hosts: BTreeMap<String, String>,
    #[serde(default)]
    paths: Vec<PathEntry>,
}

#[derive(Debug, Deserialize)]
struct PathEntry {
    destination: String,
    #[serde(default)]
    id: Option<String>,
    next_hop: SocketAddr,
    #[serde(default)]
    interfaces: Vec<String>,
    #[serde(default)]
    latency_ms: Option<u64>,
    #[serde(default)]
    mtu: Option<u16>,
}

/// Resolver serving a fixed topology
#[derive(Debug, Clone)]
pub struct StaticResolver {
    local_ia: IsdAs,
    hosts: HashMap<String, (IsdAs, IpAddr)>,
    paths: HashMap<IsdAs, Vec<Path>>,
}

impl StaticResolver {
    /// Empty topology for `local_ia`
    #[must_use]
    pub fn new(local_ia: IsdAs) -> Self {
        Self {
            local_ia,
            hosts: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Register a host name
    #[must_use]
    pub fn with_host(mut self, name: impl Into<String>, ia: IsdAs, ip: IpAddr) -> Self {
        self.hosts.insert(name.into(), (ia, ip));
        self
    }

    /// Register a path to `destination`
    #[must_use]
    pub fn with_path(mut self, destination: IsdAs, path: Path) -> Self {
        self.paths.entry(destination).or_default().push(path);
        self
    }

    /// Parse a TOML topology.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::InvalidTopology` on syntax or value errors.
    pub fn from_toml_str(contents: &str) -> Result<Self, ResolveError> {
        let file: TopologyFile =
            toml::from_str(contents).map_err(|e| ResolveError::InvalidTopology(e.to_string()))?;

        let local_ia: IsdAs = file
            .local_ia
            .parse()
            .map_err(|e: crate::AddrError| ResolveError::InvalidTopology(e.to_string()))?;
        let mut resolver = Self::new(local_ia);

        for (name, value) in file.hosts {
            let addr: PathAddr = value
                .parse()
                .map_err(|e: crate::AddrError| ResolveError::InvalidTopology(e.to_string()))?;
            resolver.hosts.insert(name, (addr.ia, addr.host));
        }

        for entry in file.paths {
            let destination: IsdAs = entry
                .destination
                .parse()
                .map_err(|e: crate::AddrError| ResolveError::InvalidTopology(e.to_string()))?;
            let interfaces = entry
                .interfaces
                .iter()
                .map(|s| s.parse::<PathInterface>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ResolveError::InvalidTopology(e.to_string()))?;

            let mut path = Path::new(entry.next_hop, interfaces);
            if let Some(id) = entry.id {
                path = path.with_id(id);
            }
            if let Some(ms) = entry.latency_ms {
                path = path.with_latency(Duration::from_millis(ms));
            }
            path.metadata.mtu = entry.mtu;
            resolver.paths.entry(destination).or_default().push(path);
        }

        Ok(resolver)
    }

    /// Load a TOML topology file.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the file cannot be read or parsed.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ResolveError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ResolveError::Unavailable(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

#[async_trait]
impl PathResolver for StaticResolver {
    fn local_ia(&self) -> IsdAs {
        self.local_ia
    }

    async fn resolve_name(&self, host: &str) -> Result<Option<(IsdAs, IpAddr)>, ResolveError> {
        Ok(self.hosts.get(host).copied())
    }

    async fn query_paths(&self, destination: IsdAs) -> Result<Vec<Path>, ResolveError> {
        if destination == self.local_ia {
            return Ok(vec![Path::direct()]);
        }
        Ok(self
            .paths
            .get(&destination)
            .map(|paths| paths.iter().filter(|p| !p.is_expired()).cloned().collect())
            .unwrap_or_default())
    }
}
