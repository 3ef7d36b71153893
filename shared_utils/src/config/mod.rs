//! Configuration management for edgetun.
//!
//! This module loads the service configuration file (TOML), fills in
//! defaults, validates it and applies `EDGETUN_*` environment overrides.
//! Tunnel keys and address ranges are kept as text here; the service turns
//! them into typed values when it builds the tunnel configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "EDGETUN_";

/// Upper bound for the watcher's debounce and poll intervals.
pub const MAX_WATCHER_INTERVAL_MS: u64 = 3_600_000;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// A remote peer as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Base64 public key
    pub public_key: String,

    /// CIDR ranges routed to this peer
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// `host:port` of the peer
    pub endpoint: Option<String>,

    /// Keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

/// Tunnel interface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Interface name; also names the control socket
    #[serde(default = "default_tunnel_name")]
    pub name: String,

    #[serde(default)]
    pub listen_port: u16,

    /// Base64 private key
    pub private_key: Option<String>,

    pub mtu: Option<u16>,

    /// Addresses assigned to the adapter (CIDR)
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_tunnel_name() -> String {
    "edgetun0".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            listen_port: 0,
            private_key: None,
            mtu: None,
            addresses: Vec::new(),
            peers: Vec::new(),
        }
    }
}

/// Service process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Directory holding the control sockets
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// How long teardown waits for each subsystem
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Account to switch to once the adapter and firewall are set up
    pub run_as_user: Option<String>,

    pub run_as_group: Option<String>,

    /// User IDs allowed on the control socket besides root
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    /// Group IDs allowed on the control socket
    #[serde(default)]
    pub allowed_gids: Vec<u32>,
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/run/edgetun")
}

fn default_grace_period_ms() -> u64 {
    5_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            grace_period_ms: default_grace_period_ms(),
            run_as_user: None,
            run_as_group: None,
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Interface watcher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    /// Events within this window coalesce into one reconciliation
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval between interface table snapshots
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stop the service on a reconciliation failure instead of retrying
    #[serde(default = "default_true")]
    pub escalate_errors: bool,

    /// Interface names to ignore; a trailing `*` matches any suffix
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Capacity of the notification queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_ignore_patterns() -> Vec<String> {
    vec!["lo".to_string(), "veth*".to_string(), "docker*".to_string()]
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            escalate_errors: default_true(),
            ignore_patterns: default_ignore_patterns(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Host firewall settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    /// Install nftables rules and routes for the tunnel
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Remove the rules when the service stops
    #[serde(default = "default_true")]
    pub remove_on_stop: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remove_on_stop: true,
        }
    }
}

/// Main configuration structure for edgetun.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily rolling log files; stdout only when unset
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            log_dir: None,
            tunnel: TunnelConfig::default(),
            service: ServiceConfig::default(),
            watcher: WatcherConfig::default(),
            firewall: FirewallConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, applying process environment
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load configuration from a TOML file, reading overrides through `env`.
    pub fn load_with_env<P, F>(path: P, env: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;

        // Environment takes precedence over the file
        config.apply_env_overrides(env)?;
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.name.trim().is_empty() {
            return Err(ConfigError::MissingValue("tunnel.name".to_string()));
        }

        if let Some(mtu) = self.tunnel.mtu {
            if !(576..=65535).contains(&mtu) {
                return Err(ConfigError::InvalidValue {
                    key: "tunnel.mtu".to_string(),
                    message: format!("{mtu} is outside 576..=65535"),
                });
            }
        }

        for (i, peer) in self.tunnel.peers.iter().enumerate() {
            if peer.public_key.trim().is_empty() {
                return Err(ConfigError::MissingValue(format!(
                    "tunnel.peers[{i}].public_key"
                )));
            }
        }

        if self.service.runtime_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "service.runtime_dir".to_string(),
                message: "runtime directory cannot be empty".to_string(),
            });
        }

        let positive = [
            ("service.grace_period_ms", self.service.grace_period_ms),
            ("watcher.debounce_ms", self.watcher.debounce_ms),
            ("watcher.poll_interval_ms", self.watcher.poll_interval_ms),
            ("watcher.queue_capacity", self.watcher.queue_capacity as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        let intervals = [
            ("watcher.debounce_ms", self.watcher.debounce_ms),
            ("watcher.poll_interval_ms", self.watcher.poll_interval_ms),
        ];
        for (key, value) in intervals {
            if value > MAX_WATCHER_INTERVAL_MS {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{value} exceeds {MAX_WATCHER_INTERVAL_MS}"),
                });
            }
        }

        // nft and ip need CAP_NET_ADMIN for every reconciliation
        if self.service.run_as_user.is_some() && self.firewall.enabled {
            return Err(ConfigError::InvalidValue {
                key: "service.run_as_user".to_string(),
                message: "cannot drop privileges while firewall.enabled is true".to_string(),
            });
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: EDGETUN_)
    /// Example keys:
    /// - EDGETUN_LOG_LEVEL, EDGETUN_LOG_DIR
    /// - EDGETUN_TUNNEL_NAME, EDGETUN_TUNNEL_LISTEN_PORT, EDGETUN_TUNNEL_PRIVATE_KEY,
    ///   EDGETUN_TUNNEL_MTU, EDGETUN_TUNNEL_ADDRESSES
    /// - EDGETUN_SERVICE_RUNTIME_DIR, EDGETUN_SERVICE_GRACE_PERIOD_MS,
    ///   EDGETUN_SERVICE_RUN_AS_USER, EDGETUN_SERVICE_RUN_AS_GROUP,
    ///   EDGETUN_SERVICE_ALLOWED_UIDS, EDGETUN_SERVICE_ALLOWED_GIDS
    /// - EDGETUN_WATCHER_DEBOUNCE_MS, EDGETUN_WATCHER_POLL_INTERVAL_MS,
    ///   EDGETUN_WATCHER_ESCALATE_ERRORS, EDGETUN_WATCHER_IGNORE_PATTERNS,
    ///   EDGETUN_WATCHER_QUEUE_CAPACITY
    /// - EDGETUN_FIREWALL_ENABLED, EDGETUN_FIREWALL_REMOVE_ON_STOP
    fn apply_env_overrides<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| env(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.is_empty());

        fn parse<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{suffix}"),
                message: format!("cannot parse {value:?}"),
            })
        }
        fn parse_bool(suffix: &str, value: &str) -> Result<bool, ConfigError> {
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(true),
                "false" | "0" | "no" | "n" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{suffix}"),
                    message: format!("expected a boolean, got {value:?}"),
                }),
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }
        fn parse_csv_u32(suffix: &str, s: &str) -> Result<Vec<u32>, ConfigError> {
            split_csv(s).iter().map(|v| parse(suffix, v)).collect()
        }

        // Top-level
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }

        // Tunnel
        if let Some(v) = var("TUNNEL_NAME") {
            self.tunnel.name = v;
        }
        if let Some(v) = var("TUNNEL_LISTEN_PORT") {
            self.tunnel.listen_port = parse("TUNNEL_LISTEN_PORT", &v)?;
        }
        if let Some(v) = var("TUNNEL_PRIVATE_KEY") {
            self.tunnel.private_key = Some(v);
        }
        if let Some(v) = var("TUNNEL_MTU") {
            self.tunnel.mtu = Some(parse("TUNNEL_MTU", &v)?);
        }
        if let Some(v) = var("TUNNEL_ADDRESSES") {
            self.tunnel.addresses = split_csv(&v);
        }

        // Service
        if let Some(v) = var("SERVICE_RUNTIME_DIR") {
            self.service.runtime_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SERVICE_GRACE_PERIOD_MS") {
            self.service.grace_period_ms = parse("SERVICE_GRACE_PERIOD_MS", &v)?;
        }
        if let Some(v) = var("SERVICE_RUN_AS_USER") {
            self.service.run_as_user = Some(v);
        }
        if let Some(v) = var("SERVICE_RUN_AS_GROUP") {
            self.service.run_as_group = Some(v);
        }
        if let Some(v) = var("SERVICE_ALLOWED_UIDS") {
            self.service.allowed_uids = parse_csv_u32("SERVICE_ALLOWED_UIDS", &v)?;
        }
        if let Some(v) = var("SERVICE_ALLOWED_GIDS") {
            self.service.allowed_gids = parse_csv_u32("SERVICE_ALLOWED_GIDS", &v)?;
        }

        // Watcher
        if let Some(v) = var("WATCHER_DEBOUNCE_MS") {
            self.watcher.debounce_ms = parse("WATCHER_DEBOUNCE_MS", &v)?;
        }
        if let Some(v) = var("WATCHER_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = parse("WATCHER_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("WATCHER_ESCALATE_ERRORS") {
            self.watcher.escalate_errors = parse_bool("WATCHER_ESCALATE_ERRORS", &v)?;
        }
        if let Some(v) = var("WATCHER_IGNORE_PATTERNS") {
            self.watcher.ignore_patterns = split_csv(&v);
        }
        if let Some(v) = var("WATCHER_QUEUE_CAPACITY") {
            self.watcher.queue_capacity = parse("WATCHER_QUEUE_CAPACITY", &v)?;
        }

        // Firewall
        if let Some(v) = var("FIREWALL_ENABLED") {
            self.firewall.enabled = parse_bool("FIREWALL_ENABLED", &v)?;
        }
        if let Some(v) = var("FIREWALL_REMOVE_ON_STOP") {
            self.firewall.remove_on_stop = parse_bool("FIREWALL_REMOVE_ON_STOP", &v)?;
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("edgetun").join("edgetun.toml")
        } else {
            PathBuf::from("edgetun.toml")
        }
    }
}
