//! Network paths between two path-aware endpoints.

use crate::addr::IsdAs;
use crate::error::AddrError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Length of a fingerprint-derived path identifier, in hex characters
const FINGERPRINT_HEX_LEN: usize = 16;

/// Stable, totally ordered path identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(String);

impl PathId {
    /// Explicit identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fingerprint of an interface sequence (BLAKE3, hex-truncated).
    ///
    /// The empty sequence (direct delivery) fingerprints to `"direct"`.
    #[must_use]
    pub fn fingerprint(interfaces: &[PathInterface]) -> Self {
        if interfaces.is_empty() {
            return Self("direct".to_string());
        }
        let mut hasher = blake3::Hasher::new();
        for iface in interfaces {
            hasher.update(&iface.ia.isd.to_be_bytes());
            hasher.update(&iface.ia.asn.to_be_bytes());
            hasher.update(&iface.ifid.to_be_bytes());
        }
        let digest = hex::encode(hasher.finalize().as_bytes());
        Self(digest[..FINGERPRINT_HEX_LEN].to_string())
    }

    /// Identifier as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One border-router interface traversed by a path (`ISD-AS#ifid`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathInterface {
    /// Domain owning the interface
    pub ia: IsdAs,
    /// Interface identifier within the domain
    pub ifid: u64,
}

impl fmt::Display for PathInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ia, self.ifid)
    }
}

impl FromStr for PathInterface {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ia, ifid) = s
            .split_once('#')
            .ok_or_else(|| AddrError::malformed(s, "interface missing '#'"))?;
        let ifid = ifid
            .parse()
            .map_err(|_| AddrError::malformed(s, "invalid interface id"))?;
        Ok(Self {
            ia: ia.parse()?,
            ifid,
        })
    }
}

/// Static metadata advertised for a path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathMetadata {
    /// Advertised end-to-end latency
    pub latency: Option<Duration>,
    /// Path MTU
    pub mtu: Option<u16>,
    /// When the path stops being usable
    pub expiry: Option<SystemTime>,
}

/// A path to a remote domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    /// Identifier used for ordering and deduplication
    pub id: PathId,
    /// Underlay address packets on this path are handed to.
    /// `None` delivers directly to the destination host.
    pub next_hop: Option<SocketAddr>,
    /// Interfaces traversed, source to destination
    pub interfaces: Vec<PathInterface>,
    /// Advertised metadata
    pub metadata: PathMetadata,
}

impl Path {
    /// Path through `interfaces` handed to `next_hop`, identified by fingerprint
    #[must_use]
    pub fn new(next_hop: SocketAddr, interfaces: Vec<PathInterface>) -> Self {
        Self {
            id: PathId::fingerprint(&interfaces),
            next_hop: Some(next_hop),
            interfaces,
            metadata: PathMetadata::default(),
        }
    }

    /// Empty path for destinations inside the local domain
    #[must_use]
    pub fn direct() -> Self {
        Self {
            id: PathId::fingerprint(&[]),
            next_hop: None,
            interfaces: Vec::new(),
            metadata: PathMetadata::default(),
        }
    }

    /// Override the identifier
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = PathId::new(id);
        self
    }

    /// Set advertised latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.metadata.latency = Some(latency);
        self
    }

    /// Set expiry
    #[must_use]
    pub fn with_expiry(mut self, expiry: SystemTime) -> Self {
        self.metadata.expiry = Some(expiry);
        self
    }

    /// Number of domain crossings
    #[must_use]
    pub fn hop_count(&self) -> usize {
        self.interfaces.len() / 2
    }

    /// Whether the path metadata has expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.metadata
            .expiry
            .is_some_and(|expiry| expiry <= SystemTime::now())
    }

    /// Address to send to for a destination reached over this path
    #[must_use]
    pub fn underlay_for(&self, destination: SocketAddr) -> SocketAddr {
        self.next_hop.unwrap_or(destination)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.id)?;
        for (i, iface) in self.interfaces.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{iface}")?;
        }
        f.write_str("]")
    }
}

/// Liveness of a candidate as of the last probe round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Never probed
    Unknown,
    /// Answered the last probe
    Alive,
    /// Failed the last probe
    Dead,
}

/// Path under evaluation by a selector
#[derive(Clone, Debug)]
pub struct PathCandidate {
    /// The path
    pub path: Path,
    /// Latency measured in the last successful probe
    pub latency: Option<Duration>,
    /// Outcome of the last probe
    pub liveness: Liveness,
}

impl PathCandidate {
    /// Unprobed candidate
    #[must_use]
    pub fn new(path: Path) -> Self {
        Self {
            path,
            latency: None,
            liveness: Liveness::Unknown,
        }
    }

    /// Candidate identifier
    #[must_use]
    pub fn id(&self) -> &PathId {
        &self.path.id
    }

    /// Record a successful probe
    pub fn mark_alive(&mut self, latency: Duration) {
        self.latency = Some(latency);
        self.liveness = Liveness::Alive;
    }

    /// Record a failed probe
    pub fn mark_dead(&mut self) {
        self.latency = None;
        self.liveness = Liveness::Dead;
    }
}
