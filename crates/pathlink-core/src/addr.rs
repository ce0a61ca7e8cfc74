//! Path-aware address parsing.
//!
//! Two mutually exclusive textual grammars are accepted:
//!
//! - path-aware: `ISD-AS,host[:port]`, e.g. `1-ff00:0:300,[f00d::1337]:8080`
//! - conventional: `host:port`, e.g. `example.org:8333` or `[::1]:8333`
//!
//! Classification happens once, up front, into [`Address`]. An input whose
//! prefix looks like an `ISD-AS` identity is always parsed with the
//! path-aware rules and never falls back to conventional splitting.

use crate::error::AddrError;
use crate::resolver::PathResolver;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

/// Port used when a path-aware address carries none
pub const DEFAULT_PORT: u16 = 8666;

/// Largest AS number printed in decimal form
pub const MAX_BGP_AS: u64 = u32::MAX as u64;

/// Largest AS number representable (48 bits)
pub const MAX_AS: u64 = (1 << 48) - 1;

/// Path-aware domain identity (`ISD-AS`).
///
/// The default value is the wildcard `0-0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsdAs {
    /// Isolation domain
    pub isd: u16,
    /// Autonomous system number (48 bits)
    pub asn: u64,
}

impl IsdAs {
    /// Create a new identity
    #[must_use]
    pub const fn new(isd: u16, asn: u64) -> Self {
        Self { isd, asn }
    }

    /// Whether this is the wildcard identity `0-0`
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.isd == 0 && self.asn == 0
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asn <= MAX_BGP_AS {
            write!(f, "{}-{}", self.isd, self.asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd,
                (self.asn >> 32) & 0xffff,
                (self.asn >> 16) & 0xffff,
                self.asn & 0xffff
            )
        }
    }
}

impl FromStr for IsdAs {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (isd, asn) = s
            .split_once('-')
            .ok_or_else(|| AddrError::malformed(s, "identity missing '-'"))?;

        if isd.is_empty() || !isd.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddrError::malformed(s, "invalid ISD"));
        }
        let isd: u16 = isd
            .parse()
            .map_err(|_| AddrError::malformed(s, "ISD out of range"))?;

        let asn = if asn.contains(':') {
            let groups: Vec<&str> = asn.split(':').collect();
            if groups.len() != 3 {
                return Err(AddrError::malformed(s, "AS must have three hex groups"));
            }
            let mut value = 0u64;
            for group in groups {
                if group.is_empty()
                    || group.len() > 4
                    || !group.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    return Err(AddrError::malformed(s, "invalid AS hex group"));
                }
                let part = u64::from_str_radix(group, 16)
                    .map_err(|_| AddrError::malformed(s, "invalid AS hex group"))?;
                value = (value << 16) | part;
            }
            value
        } else {
            if asn.is_empty() || !asn.bytes().all(|b| b.is_ascii_digit()) {
                return Err(AddrError::malformed(s, "invalid AS number"));
            }
            let value: u64 = asn
                .parse()
                .map_err(|_| AddrError::malformed(s, "AS out of range"))?;
            if value > MAX_BGP_AS {
                return Err(AddrError::malformed(s, "decimal AS out of range"));
            }
            value
        };

        Ok(Self { isd, asn })
    }
}

/// Resolved path-aware address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathAddr {
    /// Domain identity of the host
    pub ia: IsdAs,
    /// Host IP within the domain
    pub host: IpAddr,
    /// IPv6 zone, if any
    pub zone: Option<String>,
    /// UDP port
    pub port: u16,
}

impl PathAddr {
    /// Create an address without zone
    #[must_use]
    pub fn new(ia: IsdAs, host: IpAddr, port: u16) -> Self {
        Self {
            ia,
            host,
            zone: None,
            port,
        }
    }

    /// Underlay socket address of the host.
    ///
    /// A numeric IPv6 zone becomes the scope id; named zones are dropped.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        match self.host {
            IpAddr::V4(ip) => SocketAddr::new(IpAddr::V4(ip), self.port),
            IpAddr::V6(ip) => {
                let scope = self
                    .zone
                    .as_deref()
                    .and_then(|z| z.parse::<u32>().ok())
                    .unwrap_or(0);
                SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, scope))
            }
        }
    }

    /// Host part in the form `ISD-AS,ip` (IPv6 bracketed)
    #[must_use]
    pub fn host_string(&self) -> String {
        format!("{},{}", self.ia, HostDisplay(self))
    }
}

struct HostDisplay<'a>(&'a PathAddr);

impl fmt::Display for HostDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.0.host, &self.0.zone) {
            (IpAddr::V4(ip), _) => write!(f, "{ip}"),
            (IpAddr::V6(ip), Some(zone)) => write!(f, "[{ip}%{zone}]"),
            (IpAddr::V6(ip), None) => write!(f, "[{ip}]"),
        }
    }
}

impl fmt::Display for PathAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}:{}", self.ia, HostDisplay(self), self.port)
    }
}

impl FromStr for PathAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AddressParser::default().parse(s)
    }
}

/// Classified address
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// `ISD-AS,host[:port]`
    PathAware(PathAddr),
    /// `host:port`
    Conventional {
        /// Host name or IP literal (brackets stripped)
        host: String,
        /// Port
        port: u16,
    },
}

impl Address {
    /// Path-aware form, if any
    #[must_use]
    pub fn as_path_aware(&self) -> Option<&PathAddr> {
        match self {
            Self::PathAware(addr) => Some(addr),
            Self::Conventional { .. } => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathAware(addr) => addr.fmt(f),
            Self::Conventional { host, port } => f.write_str(&join_host_port(host, *port)),
        }
    }
}

/// Address parser with a configurable default port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressParser {
    default_port: u16,
}

impl Default for AddressParser {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
        }
    }
}

impl AddressParser {
    /// Parser filling in [`DEFAULT_PORT`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser filling in `port` for path-aware addresses without one
    #[must_use]
    pub fn with_default_port(port: u16) -> Self {
        Self { default_port: port }
    }

    /// Port used when a path-aware address omits it
    #[must_use]
    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Classify `input` into one of the two grammars.
    ///
    /// # Errors
    ///
    /// Returns [`AddrError::Malformed`] if neither grammar matches.
    pub fn classify(&self, input: &str) -> Result<Address, AddrError> {
        if looks_path_aware(input) {
            let (ia, host, zone, port) = parse_path_aware(input)?;
            return Ok(Address::PathAware(PathAddr {
                ia,
                host,
                zone,
                port: port.unwrap_or(self.default_port),
            }));
        }
        let (host, port) = split_conventional(input)?;
        Ok(Address::Conventional { host, port })
    }

    /// Parse a literal path-aware address.
    ///
    /// # Errors
    ///
    /// [`AddrError::Malformed`] for unparsable input, [`AddrError::Unresolvable`]
    /// for a conventional address, which needs a resolver.
    pub fn parse(&self, input: &str) -> Result<PathAddr, AddrError> {
        match self.classify(input)? {
            Address::PathAware(addr) => Ok(addr),
            Address::Conventional { .. } => Err(AddrError::unresolvable(
                input,
                "no path-aware identity; host name resolution required",
            )),
        }
    }

    /// Fully resolve `input`, looking up host names through `resolver`.
    ///
    /// # Errors
    ///
    /// [`AddrError::Malformed`] for unparsable input, [`AddrError::Unresolvable`]
    /// if the resolver cannot produce a path-aware address for the host.
    pub async fn resolve(
        &self,
        resolver: &dyn PathResolver,
        input: &str,
    ) -> Result<PathAddr, AddrError> {
        match self.classify(input)? {
            Address::PathAware(addr) => Ok(addr),
            Address::Conventional { host, port } => {
                match resolver.resolve_name(&host).await {
                    Ok(Some((ia, ip))) => {
                        tracing::debug!(%host, %ia, %ip, "resolved host name");
                        Ok(PathAddr::new(ia, ip, port))
                    }
                    Ok(None) => Err(AddrError::unresolvable(input, "unknown host")),
                    Err(e) => Err(AddrError::unresolvable(input, e.to_string())),
                }
            }
        }
    }
}

/// Split `input` into host and optional port.
///
/// Path-aware inputs yield `host = "ISD-AS,ip"` (IPv6 in brackets); the
/// port may be absent. Conventional inputs always carry a port.
///
/// # Errors
///
/// Returns [`AddrError::Malformed`] if neither grammar matches.
pub fn split_host_port(input: &str) -> Result<(String, Option<u16>), AddrError> {
    if looks_path_aware(input) {
        let (ia, host, zone, port) = parse_path_aware(input)?;
        let addr = PathAddr {
            ia,
            host,
            zone,
            port: 0,
        };
        return Ok((addr.host_string(), port));
    }
    let (host, port) = split_conventional(input)?;
    Ok((host, Some(port)))
}

/// Inverse of [`split_host_port`] for a present port.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if looks_path_aware(host) || !host.contains(':') {
        format!("{host}:{port}")
    } else {
        format!("[{host}]:{port}")
    }
}

/// Non-raising probe: the parsed address if `input` is a valid literal
/// path-aware address.
#[must_use]
pub fn is_valid_address(input: &str) -> Option<PathAddr> {
    match AddressParser::default().classify(input) {
        Ok(Address::PathAware(addr)) => Some(addr),
        _ => None,
    }
}

/// Parse a literal path-aware address with the default port.
///
/// # Errors
///
/// See [`AddressParser::parse`].
pub fn parse_address(input: &str) -> Result<PathAddr, AddrError> {
    AddressParser::default().parse(input)
}

/// Resolve `input` with the default port.
///
/// # Errors
///
/// See [`AddressParser::resolve`].
pub async fn resolve_address(
    resolver: &dyn PathResolver,
    input: &str,
) -> Result<PathAddr, AddrError> {
    AddressParser::default().resolve(resolver, input).await
}

/// `^\d+-[0-9A-Fa-f:]+,` prefix check
fn looks_path_aware(input: &str) -> bool {
    let Some((identity, _)) = input.split_once(',') else {
        return false;
    };
    let Some((isd, asn)) = identity.split_once('-') else {
        return false;
    };
    !isd.is_empty()
        && isd.bytes().all(|b| b.is_ascii_digit())
        && !asn.is_empty()
        && asn.bytes().all(|b| b.is_ascii_hexdigit() || b == b':')
}

type PathAwareParts = (IsdAs, IpAddr, Option<String>, Option<u16>);

fn parse_path_aware(input: &str) -> Result<PathAwareParts, AddrError> {
    let (identity, rest) = input
        .split_once(',')
        .ok_or_else(|| AddrError::malformed(input, "missing identity"))?;
    let ia: IsdAs = identity
        .parse()
        .map_err(|_| AddrError::malformed(input, "invalid ISD-AS identity"))?;

    if rest.is_empty() {
        return Err(AddrError::malformed(input, "missing host"));
    }

    if let Some(bracketed) = rest.strip_prefix('[') {
        let close = bracketed
            .find(']')
            .ok_or_else(|| AddrError::malformed(input, "unterminated bracket"))?;
        let (ip, zone) = parse_ip_zone(&bracketed[..close])
            .ok_or_else(|| AddrError::malformed(input, "invalid host IP"))?;
        let tail = &bracketed[close + 1..];
        let port = if tail.is_empty() {
            None
        } else {
            let digits = tail
                .strip_prefix(':')
                .ok_or_else(|| AddrError::malformed(input, "unexpected text after ']'"))?;
            Some(parse_port(input, digits)?)
        };
        return Ok((ia, ip, zone, port));
    }

    if rest.contains('[') || rest.contains(']') {
        return Err(AddrError::malformed(input, "misplaced bracket"));
    }

    // Bare IP (v4, v6, v6%zone) without port
    if let Some((ip, zone)) = parse_ip_zone(rest) {
        return Ok((ia, ip, zone, None));
    }

    let (host, digits) = rest
        .rsplit_once(':')
        .ok_or_else(|| AddrError::malformed(input, "invalid host IP"))?;
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| AddrError::malformed(input, "invalid host IP"))?;
    let port = parse_port(input, digits)?;
    Ok((ia, IpAddr::V4(ip), None, Some(port)))
}

fn parse_ip_zone(s: &str) -> Option<(IpAddr, Option<String>)> {
    match s.split_once('%') {
        Some((ip, zone)) => {
            if zone.is_empty() {
                return None;
            }
            let ip: Ipv6Addr = ip.parse().ok()?;
            Some((IpAddr::V6(ip), Some(zone.to_string())))
        }
        None => s.parse::<IpAddr>().ok().map(|ip| (ip, None)),
    }
}

fn parse_port(input: &str, digits: &str) -> Result<u16, AddrError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddrError::malformed(input, "invalid port"));
    }
    digits
        .parse()
        .map_err(|_| AddrError::malformed(input, "port out of range"))
}

fn split_conventional(input: &str) -> Result<(String, u16), AddrError> {
    if input.is_empty() {
        return Err(AddrError::malformed(input, "empty address"));
    }

    if let Some(bracketed) = input.strip_prefix('[') {
        let close = bracketed
            .find(']')
            .ok_or_else(|| AddrError::malformed(input, "missing ']'"))?;
        let host = &bracketed[..close];
        let digits = bracketed[close + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AddrError::malformed(input, "missing port"))?;
        if host.contains('[') || host.contains(']') {
            return Err(AddrError::malformed(input, "misplaced bracket"));
        }
        return Ok((host.to_string(), parse_port(input, digits)?));
    }

    let (host, digits) = input
        .rsplit_once(':')
        .ok_or_else(|| AddrError::malformed(input, "missing port"))?;
    if host.contains(':') {
        return Err(AddrError::malformed(input, "too many colons"));
    }
    if host.contains('[') || host.contains(']') {
        return Err(AddrError::malformed(input, "misplaced bracket"));
    }
    Ok((host.to_string(), parse_port(input, digits)?))
}
