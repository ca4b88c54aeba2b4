//! Onion Configuration
//!
//! Daemon base options, timing constants, transport helper settings and
//! the initial bridge selection. Loadable from TOML or JSON.

use crate::bridges::BridgeSettings;
use crate::entry::{ConfigEntry, keys};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the authentication cookie the daemon writes into its data directory
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Name of the file the daemon writes its control port address into
pub const CONTROL_PORT_FILE_NAME: &str = "controlport";

/// Daemon process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Daemon executable
    pub binary: PathBuf,
    /// SOCKS listener (`SocksPort`)
    pub socks_port: String,
    /// Log target (`Log`)
    pub log: String,
    /// Data directory; control port file, cookie and client auth keys live here
    pub data_dir: PathBuf,
    /// IPv4 GeoIP database
    pub geoip_file: Option<PathBuf>,
    /// IPv6 GeoIP database
    pub geoip6_file: Option<PathBuf>,
    /// Forward daemon stdout into the tracing log
    pub forward_output: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            socks_port: "127.0.0.1:39050".to_string(),
            log: default_log(),
            data_dir: default_data_dir(),
            geoip_file: None,
            geoip6_file: None,
            forward_output: false,
        }
    }
}

#[cfg(debug_assertions)]
fn default_log() -> String {
    "notice stdout".to_string()
}

#[cfg(not(debug_assertions))]
fn default_log() -> String {
    "notice file /dev/null".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("onion")
        .join("tor")
}

/// Fixed delays used by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after launch before touching the control port.
    ///
    /// There is no readiness check: if the daemon is slower than this the
    /// control connection fails and only the retry guard reports it.
    pub grace_delay_ms: u64,
    /// Bootstrap deadline before the retry guard fires
    pub retry_delay_ms: u64,
    /// Longest wait for a control port connection or reply
    pub control_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: 1_000,
            retry_delay_ms: 15_000,
            control_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// obfs4 helper settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Obfs4Config {
    /// Helper executable
    pub binary: PathBuf,
    /// Helper log level
    pub log_level: String,
    /// Enable helper logging
    pub enable_logging: bool,
    /// Time to wait for the helper to report its port
    pub startup_timeout_ms: u64,
}

impl Default for Obfs4Config {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("lyrebird"),
            log_level: "DEBUG".to_string(),
            enable_logging: cfg!(debug_assertions),
            startup_timeout_ms: 5_000,
        }
    }
}

impl Obfs4Config {
    /// Command line for the helper
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec!["-logLevel".to_string(), self.log_level.clone()];
        if self.enable_logging {
            args.push("-enableLogging".to_string());
        }
        args
    }
}

/// Snowflake helper settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    /// Helper executable
    pub binary: PathBuf,
    /// STUN servers for ICE
    pub stun_servers: Vec<String>,
    /// Rendezvous broker URL
    pub broker_url: String,
    /// Front domain for the broker
    pub front_domain: String,
    /// Maximum concurrent snowflake peers
    pub max_peers: u32,
    /// Time to wait for the helper to report its port
    pub startup_timeout_ms: u64,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        let stun_servers = [
            "stun.l.google.com:19302",
            "stun.voip.blackberry.com:3478",
            "stun.altar.com.pl:3478",
            "stun.antisip.com:3478",
            "stun.bluesip.net:3478",
            "stun.dus.net:3478",
            "stun.epygi.com:3478",
            "stun.sonetel.com:3478",
            "stun.sonetel.net:3478",
            "stun.stunprotocol.org:3478",
            "stun.uls.co.za:3478",
            "stun.voipgate.com:3478",
            "stun.voys.nl:3478",
        ]
        .iter()
        .map(|s| format!("stun:{s}"))
        .collect();

        Self {
            binary: PathBuf::from("snowflake-client"),
            stun_servers,
            broker_url: "https://snowflake-broker.torproject.net.global.prod.fastly.net/".to_string(),
            front_domain: "cdn.sstatic.net".to_string(),
            max_peers: 1,
            startup_timeout_ms: 5_000,
        }
    }
}

impl SnowflakeConfig {
    /// Command line for the helper
    pub fn arguments(&self) -> Vec<String> {
        vec![
            "-url".to_string(),
            self.broker_url.clone(),
            "-front".to_string(),
            self.front_domain.clone(),
            "-ice".to_string(),
            self.stun_servers.join(","),
            "-max".to_string(),
            self.max_peers.to_string(),
        ]
    }
}

/// Pluggable transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportsConfig {
    /// Built-in obfs4 bridge lines
    pub builtin_bridges: Vec<String>,
    /// JSON array of additional built-in bridge lines
    pub builtin_bridges_file: Option<PathBuf>,
    pub obfs4: Obfs4Config,
    pub snowflake: SnowflakeConfig,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            builtin_bridges: vec![
                "obfs4 192.95.36.142:443 CDF2E852BF539B82BD10E27E9115A31734E378C2 cert=qUVQ0srL1JI/vO6V6m/24anYXiJD3QP2HgzUKQtQ7GRqqUvs7P+tG43RtAqdhLOALP7DJQ iat-mode=1".to_string(),
                "obfs4 37.218.245.14:38224 D9A82D2F9C2F65A18407B1D2B764F130847F8B5D cert=bjRaMrr1BRiAW8IE9U5z27fQaYgOhX1UCmOpg2pFpoMvo6ZgQMzLsaTzzQNTlm7hNcb+Sg iat-mode=0".to_string(),
            ],
            builtin_bridges_file: None,
            obfs4: Obfs4Config::default(),
            snowflake: SnowflakeConfig::default(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionConfig {
    /// Raw daemon arguments supplied by the user
    pub extra_arguments: Vec<String>,
    pub daemon: DaemonConfig,
    pub timing: TimingConfig,
    pub transports: TransportsConfig,
    /// Initial bridge selection
    pub bridges: BridgeSettings,
}

impl OnionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config = match ext {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        info!("Loaded onion config from {}", path.display());
        Ok(config)
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingBinary("daemon"));
        }
        if self.transports.obfs4.binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingBinary("obfs4"));
        }
        if self.transports.snowflake.binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingBinary("snowflake"));
        }
        if self.daemon.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        if self.daemon.socks_port.trim().is_empty() {
            return Err(ConfigError::InvalidSocksPort);
        }
        if self.timing.retry_delay_ms <= self.timing.grace_delay_ms
            || self.timing.control_timeout_ms == 0
        {
            return Err(ConfigError::InvalidTiming);
        }
        Ok(())
    }

    /// Client authorization key directory
    pub fn auth_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("auth")
    }

    /// File the daemon writes its control port address into
    pub fn control_port_file(&self) -> PathBuf {
        self.daemon.data_dir.join(CONTROL_PORT_FILE_NAME)
    }

    /// Control-port authentication cookie
    pub fn cookie_file(&self) -> PathBuf {
        self.daemon.data_dir.join(COOKIE_FILE_NAME)
    }

    /// State directory handed to transport helpers
    pub fn transport_state_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("pt_state")
    }

    /// Create the data and auth directories if they do not exist
    pub fn ensure_directories(&self) {
        for dir in [self.daemon.data_dir.clone(), self.auth_dir()] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!("Could not create {}: {}", dir.display(), e);
            }
        }
        debug!("dataDir={}", self.daemon.data_dir.display());
    }

    /// Options every launch starts with
    pub fn base_entries(&self) -> Vec<ConfigEntry> {
        let data_dir = &self.daemon.data_dir;

        let mut entries = vec![
            ConfigEntry::new(keys::CLIENT_ONLY, "1"),
            ConfigEntry::new(keys::AVOID_DISK_WRITES, "1"),
            ConfigEntry::new(keys::SOCKS_PORT, &self.daemon.socks_port),
            ConfigEntry::new(keys::LOG, &self.daemon.log),
        ];

        if let Some(geoip) = &self.daemon.geoip_file {
            entries.push(ConfigEntry::new(keys::GEOIP_FILE, geoip.display().to_string()));
        }
        if let Some(geoip6) = &self.daemon.geoip6_file {
            entries.push(ConfigEntry::new(keys::GEOIP6_FILE, geoip6.display().to_string()));
        }

        entries.extend([
            ConfigEntry::new(keys::DATA_DIRECTORY, data_dir.display().to_string()),
            ConfigEntry::new(keys::CLIENT_ONION_AUTH_DIR, self.auth_dir().display().to_string()),
            ConfigEntry::new(keys::CONTROL_PORT, "auto"),
            ConfigEntry::new(
                keys::CONTROL_PORT_WRITE_TO_FILE,
                self.control_port_file().display().to_string(),
            ),
            ConfigEntry::new(keys::COOKIE_AUTHENTICATION, "1"),
            ConfigEntry::new(keys::OWNING_CONTROLLER_PROCESS, std::process::id().to_string()),
        ]);

        entries
    }

    /// Built-in obfs4 bridges, including those from `builtin_bridges_file`
    pub fn builtin_bridges(&self) -> Vec<String> {
        let mut bridges = self.transports.builtin_bridges.clone();

        if let Some(path) = &self.transports.builtin_bridges_file {
            match load_bridge_file(path) {
                Ok(extra) => bridges.extend(extra),
                Err(e) => warn!("Ignoring bridge list {}: {}", path.display(), e),
            }
        }

        bridges
    }
}

fn load_bridge_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Missing {0} executable")]
    MissingBinary(&'static str),

    #[error("Missing data directory")]
    MissingDataDir,

    #[error("Invalid SOCKS port")]
    InvalidSocksPort,

    #[error("Retry delay must exceed the grace delay and the control timeout must be non-zero")]
    InvalidTiming,
}
