//! Configuration system for the Pathlink CLI.

use pathlink_core::{AddressParser, IsdAs, SelectorPolicy, StaticResolver};
use pathlink_transport::{ClientTls, Credential, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pathlink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Path selection configuration
    #[serde(default)]
    pub selector: SelectorConfig,
    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address (path-aware or `ip:port`)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Port assumed when a path-aware address has none
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Local domain, used when no topology file is configured
    #[serde(default = "default_local_ia")]
    pub local_ia: String,
    /// Topology file for the static resolver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<PathBuf>,
    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Idle timeout in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// Path selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// `default` or `probing`
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Probe round interval in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Concurrent probes per round
    #[serde(default = "default_active_count")]
    pub active_count: usize,
    /// Path re-query interval in milliseconds (0 re-queries only on expiry)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Accept any server certificate
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Trusted roots (PEM) for verifying servers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Server certificate chain (PEM); self-signed when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// Server private key (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Name checked against the server certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// ALPN protocols
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "1-ff00:0:110,0.0.0.0:8666".to_string()
}

fn default_port() -> u16 {
    pathlink_core::DEFAULT_PORT
}

fn default_local_ia() -> String {
    "1-ff00:0:110".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_refresh_interval_ms() -> u64 {
    60_000
}

fn default_policy() -> String {
    "default".to_string()
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_active_count() -> usize {
    2
}

fn default_alpn() -> Vec<String> {
    vec![String::from_utf8_lossy(pathlink_transport::DEFAULT_ALPN).into_owned()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            default_port: default_port(),
            local_ia: default_local_ia(),
            topology: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            active_count: default_active_count(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            server_name: None,
            alpn: default_alpn(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pathlink/config.toml")
    }

    /// Load config from the default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or a new one
    /// cannot be written.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_create(Self::default_path())
    }

    /// Load config from `path`, writing the defaults there first if the
    /// file does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.local_ia()?;
        self.parser().classify(&self.network.listen_addr)?;
        self.selector_policy()?;

        if self.network.default_port == 0 {
            anyhow::bail!("Default port must not be 0");
        }
        if self.network.handshake_timeout_ms == 0 {
            anyhow::bail!("Handshake timeout must be greater than 0");
        }
        if self.tls.alpn.is_empty() {
            anyhow::bail!("At least one ALPN protocol is required");
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            anyhow::bail!("cert_file and key_file must be set together");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Local domain identity
    ///
    /// # Errors
    ///
    /// Returns an error if `local_ia` does not parse.
    pub fn local_ia(&self) -> anyhow::Result<IsdAs> {
        Ok(self.network.local_ia.parse()?)
    }

    /// Address parser with the configured default port
    #[must_use]
    pub fn parser(&self) -> AddressParser {
        AddressParser::with_default_port(self.network.default_port)
    }

    /// Path selection policy
    ///
    /// # Errors
    ///
    /// Returns an error for unknown policies or invalid probing parameters.
    pub fn selector_policy(&self) -> anyhow::Result<SelectorPolicy> {
        Ok(SelectorPolicy::from_name(
            &self.selector.policy,
            Duration::from_millis(self.selector.interval_ms),
            Duration::from_millis(self.selector.timeout_ms),
            self.selector.active_count,
        )?)
    }

    /// Session settings
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid selector policy.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            alpn: self.tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(self.network.idle_timeout_ms),
            selector: self.selector_policy()?,
            path_refresh: match self.selector.refresh_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            ..SessionConfig::default()
        })
    }

    /// Resolver from the topology file, or an empty topology for `local_ia`
    ///
    /// # Errors
    ///
    /// Returns an error if the topology file cannot be loaded.
    pub fn resolver(&self) -> anyhow::Result<StaticResolver> {
        match &self.network.topology {
            Some(path) => Ok(StaticResolver::load(path)?),
            None => Ok(StaticResolver::new(self.local_ia()?)),
        }
    }

    /// Client certificate policy
    ///
    /// # Errors
    ///
    /// Returns an error if the CA file cannot be loaded, or if neither a CA
    /// file nor `insecure_skip_verify` is configured.
    pub fn client_tls(&self) -> anyhow::Result<ClientTls> {
        if self.tls.insecure_skip_verify {
            return Ok(ClientTls::InsecureSkipVerify);
        }
        match &self.tls.ca_file {
            Some(path) => Ok(ClientTls::Verified {
                roots: pathlink_transport::tls::load_certificates(path)?,
            }),
            None => anyhow::bail!(
                "No trusted roots: set tls.ca_file or tls.insecure_skip_verify"
            ),
        }
    }

    /// Server credential from PEM files, or a fresh self-signed one
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM files cannot be loaded.
    pub fn credential(&self) -> anyhow::Result<Credential> {
        match (&self.tls.cert_file, &self.tls.key_file) {
            (Some(cert), Some(key)) => Ok(Credential::from_pem_files(cert, key)?),
            _ => Ok(Credential::self_signed(["localhost", "127.0.0.1", "::1"])?),
        }
    }
}
