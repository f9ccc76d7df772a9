//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MSGRELAY_CONFIG)
//! 3. Environment variables
//!
//! The listening port can additionally come from a port file (`myport.info` by
//! default) holding a single port number. See [`NetworkConfig::resolve_bind_addr`].
//! The port file beats the port of a configured `bind_addr`, but an explicit
//! `MSGRELAY_PORT` disables the port file and always wins.

use msgrelay_protocol::{DEFAULT_MAX_CONTENT_SIZE, DEFAULT_PORT};
use msgrelay_storage::DEFAULT_COMPACT_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MSGRELAY_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    /// Applies `MSGRELAY_*` overrides read through `var`.
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        self.network.apply_overrides(var);
        self.storage.apply_overrides(var);
        self.metrics.apply_overrides(var);
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.network.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.read_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.network.write_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.write_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// File holding the port to listen on. Overrides the port of `bind_addr`
    /// when it exists and parses.
    pub port_file: Option<PathBuf>,
    /// Maximum connections served at once. Further connections wait.
    pub max_connections: usize,
    /// Timeout for each read of a request, in seconds. A client that sends
    /// nothing for this long is disconnected.
    pub read_timeout_secs: u64,
    /// Timeout for writing a whole response, in seconds.
    pub write_timeout_secs: u64,
    /// Largest message content accepted, in bytes.
    pub max_content_bytes: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            port_file: Some(PathBuf::from("myport.info")),
            max_connections: 5,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_content_bytes: DEFAULT_MAX_CONTENT_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(addr) = var("MSGRELAY_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(path) = var("MSGRELAY_PORT_FILE") {
            self.port_file = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Some(port) = var("MSGRELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.bind_addr.set_port(port);
                self.port_file = None;
            }
        }

        if let Some(max) = var("MSGRELAY_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Some(timeout) = var("MSGRELAY_READ_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.read_timeout_secs = secs;
            }
        }

        if let Some(timeout) = var("MSGRELAY_WRITE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.write_timeout_secs = secs;
            }
        }

        if let Some(max) = var("MSGRELAY_MAX_CONTENT_BYTES") {
            if let Ok(n) = max.parse() {
                self.max_content_bytes = n;
            }
        }
    }

    /// Returns the address to listen on, taking the port file into account.
    ///
    /// A missing or unparseable port file is not fatal: a warning is logged
    /// and the configured port is used.
    pub fn resolve_bind_addr(&self) -> SocketAddr {
        let mut addr = self.bind_addr;
        let Some(path) = &self.port_file else {
            return addr;
        };

        match std::fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<u16>() {
                Ok(port) if port != 0 => {
                    tracing::info!("Using port {} from {}", port, path.display());
                    addr.set_port(port);
                }
                _ => {
                    tracing::warn!(
                        "Port file {} does not hold a valid port, using default port {}",
                        path.display(),
                        addr.port()
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Cannot read port file {} ({}), using default port {}",
                    path.display(),
                    e,
                    addr.port()
                );
            }
        }
        addr
    }

    /// Returns the read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Returns the write timeout as Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the state file.
    pub data_dir: PathBuf,
    /// Keep state on disk. When false everything is lost on restart.
    pub persist: bool,
    /// Journal size in bytes at which it is folded into a fresh snapshot.
    pub compact_threshold_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            persist: true,
            compact_threshold_bytes: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl StorageConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(dir) = var("MSGRELAY_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(persist) = var("MSGRELAY_PERSIST") {
            self.persist = persist == "1" || persist.to_lowercase() == "true";
        }

        if let Some(bytes) = var("MSGRELAY_COMPACT_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.compact_threshold_bytes = n;
            }
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9090),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("MSGRELAY_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(addr) = var("MSGRELAY_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes a SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn with_vars(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        config.apply_overrides(&|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 1357);
        assert!(config.network.bind_addr.ip().is_unspecified());
        assert_eq!(config.network.max_connections, 5);
        assert_eq!(config.network.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.network.write_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.storage.compact_threshold_bytes,
            DEFAULT_COMPACT_THRESHOLD
        );
        assert_eq!(
            config.network.port_file.as_deref(),
            Some(Path::new("myport.info"))
        );
        assert!(config.storage.persist);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.storage.data_dir, config.storage.data_dir);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "network:\n  bind_addr: \"127.0.0.1:4000\"\nstorage:\n  persist: false\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr.port(), 4000);
        assert_eq!(config.network.max_connections, 5);
        assert!(!config.storage.persist);
    }

    #[test]
    fn test_zero_connections_rejected() {
        let mut config = Config::default();
        config.network.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_port_file_overrides_port() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("myport.info");
        std::fs::write(&path, "4242\n").unwrap();

        let network = NetworkConfig {
            port_file: Some(path),
            ..Default::default()
        };
        assert_eq!(network.resolve_bind_addr().port(), 4242);
    }

    #[test]
    fn test_port_file_fallbacks() {
        let dir = TempDir::new().unwrap();

        let missing = NetworkConfig {
            port_file: Some(dir.path().join("absent.info")),
            ..Default::default()
        };
        assert_eq!(missing.resolve_bind_addr().port(), DEFAULT_PORT);

        let path = dir.path().join("bad.info");
        std::fs::write(&path, "not a port").unwrap();
        let invalid = NetworkConfig {
            port_file: Some(path),
            ..Default::default()
        };
        assert_eq!(invalid.resolve_bind_addr().port(), DEFAULT_PORT);

        let disabled = NetworkConfig {
            port_file: None,
            ..Default::default()
        };
        assert_eq!(disabled.resolve_bind_addr(), disabled.bind_addr);
    }

    #[test]
    fn test_explicit_port_beats_port_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("myport.info"), "4242").unwrap();
        let port_file = dir.path().join("myport.info");

        let config = with_vars(&[
            ("MSGRELAY_PORT_FILE", port_file.to_str().unwrap()),
            ("MSGRELAY_PORT", "5151"),
        ]);
        assert!(config.network.port_file.is_none());
        assert_eq!(config.network.resolve_bind_addr().port(), 5151);

        let config = with_vars(&[("MSGRELAY_PORT_FILE", port_file.to_str().unwrap())]);
        assert_eq!(config.network.resolve_bind_addr().port(), 4242);

        // An unparseable port is ignored and leaves the port file in charge.
        let config = with_vars(&[("MSGRELAY_PORT", "http")]);
        assert!(config.network.port_file.is_some());
    }

    #[test]
    fn test_env_overrides() {
        let config = with_vars(&[
            ("MSGRELAY_BIND", "127.0.0.1:7000"),
            ("MSGRELAY_PORT_FILE", ""),
            ("MSGRELAY_READ_TIMEOUT", "5"),
            ("MSGRELAY_WRITE_TIMEOUT", "7"),
            ("MSGRELAY_PERSIST", "false"),
            ("MSGRELAY_COMPACT_BYTES", "4096"),
        ]);
        assert_eq!(config.network.resolve_bind_addr().port(), 7000);
        assert_eq!(config.network.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.network.write_timeout(), Duration::from_secs(7));
        assert!(!config.storage.persist);
        assert_eq!(config.storage.compact_threshold_bytes, 4096);

        let zero = with_vars(&[("MSGRELAY_WRITE_TIMEOUT", "0")]);
        assert!(zero.validate().is_err());
    }
}
