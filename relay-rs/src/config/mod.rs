//! Configuration
//!
//! Loaded from a TOML file through the `config` crate, so any key can be
//! overridden from the environment as `RELAY__<SECTION>__<KEY>` (for example
//! `RELAY__UPSTREAM__HOST=smtp.internal`). Every field has a default, which
//! lets a file carry only the values it changes.
//!
//! - [`reload`]: shared snapshot and hot reload

pub mod reload;

pub use reload::{ConfigWatcher, SharedConfig};

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels accepted in `[logging] level`
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];

/// Output formats accepted in `[logging] format`
pub const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Implicit TLS listener, disabled when unset
    pub tls_port: Option<u16>,
    /// Name used in the banner, replies and the upstream EHLO
    pub hostname: String,
    pub max_connections: u64,
    pub max_message_size: usize,
    pub max_recipients: usize,
    /// Upper bound on the per-session arena, in bytes
    pub session_memory_limit: usize,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub relay_threads: usize,
    pub scan_interval_ms: u64,
    pub retry_interval_secs: u64,
    /// Connect, read and write timeout for the upstream dialogue
    pub timeout_secs: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub blocked_clients: Vec<IpAddr>,
    pub blocked_senders: Vec<String>,
    /// Accept recipients in these domains only; empty accepts any
    pub allowed_recipient_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 25,
            tls_port: None,
            hostname: default_hostname(),
            max_connections: 1000,
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_recipients: 100,
            session_memory_limit: 1024 * 1024,
            cert_file: None,
            key_file: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/relay-rs"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25,
            relay_threads: 4,
            scan_interval_ms: 1000,
            retry_interval_secs: 300,
            timeout_secs: 60,
            queue_capacity: 1024,
        }
    }
}

fn default_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().to_string();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

impl Config {
    /// Load a configuration file, applying `RELAY__*` environment overrides
    ///
    /// # Errors
    /// Returns [`RelayError::Config`] if the file cannot be read or parsed.
    /// The result is not validated; call [`Config::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to load {}: {}", path.display(), e)))?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value, naming the first offending field
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.port == 0 {
            return Err(RelayError::invalid_config("server.port", "must be 1-65535"));
        }
        if let Some(tls_port) = server.tls_port {
            if tls_port == 0 {
                return Err(RelayError::invalid_config("server.tls_port", "must be 1-65535"));
            }
            if tls_port == server.port {
                return Err(RelayError::invalid_config(
                    "server.tls_port",
                    "must differ from server.port",
                ));
            }
        }
        if !(1..=100_000).contains(&server.max_connections) {
            return Err(RelayError::invalid_config(
                "server.max_connections",
                "must be 1-100000",
            ));
        }
        if server.bind_address.trim().is_empty() {
            return Err(RelayError::invalid_config("server.bind_address", "must not be empty"));
        }
        if server.hostname.trim().is_empty() {
            return Err(RelayError::invalid_config("server.hostname", "must not be empty"));
        }
        if server.max_message_size == 0 {
            return Err(RelayError::invalid_config("server.max_message_size", "must be at least 1"));
        }
        if server.max_recipients == 0 {
            return Err(RelayError::invalid_config("server.max_recipients", "must be at least 1"));
        }
        if server.session_memory_limit < 4096 {
            return Err(RelayError::invalid_config(
                "server.session_memory_limit",
                "must be at least 4096",
            ));
        }
        if server.cert_file.is_some() != server.key_file.is_some() {
            return Err(RelayError::invalid_config(
                "server.cert_file",
                "cert_file and key_file must be set together",
            ));
        }
        if server.tls_port.is_some() && server.cert_file.is_none() {
            return Err(RelayError::invalid_config(
                "server.tls_port",
                "requires cert_file and key_file",
            ));
        }

        let path = &self.storage.path;
        if path.as_os_str().is_empty() {
            return Err(RelayError::invalid_config("storage.path", "must not be empty"));
        }
        if path.exists() && !path.is_dir() {
            return Err(RelayError::invalid_config("storage.path", "is not a directory"));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(RelayError::invalid_config(
                "logging.level",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(RelayError::invalid_config(
                "logging.format",
                format!("must be one of {}", LOG_FORMATS.join(", ")),
            ));
        }

        let upstream = &self.upstream;
        if upstream.host.trim().is_empty() {
            return Err(RelayError::invalid_config("upstream.host", "must not be empty"));
        }
        if upstream.port == 0 {
            return Err(RelayError::invalid_config("upstream.port", "must be 1-65535"));
        }
        if !(1..=64).contains(&upstream.relay_threads) {
            return Err(RelayError::invalid_config("upstream.relay_threads", "must be 1-64"));
        }
        if upstream.scan_interval_ms < 10 {
            return Err(RelayError::invalid_config(
                "upstream.scan_interval_ms",
                "must be at least 10",
            ));
        }
        if upstream.queue_capacity == 0 {
            return Err(RelayError::invalid_config("upstream.queue_capacity", "must be at least 1"));
        }

        Ok(())
    }

    /// Address of the plain SMTP listener
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.server.bind_address, self.server.port)
    }

    /// Address of the implicit TLS listener, if enabled
    pub fn tls_listen_addr(&self) -> Result<Option<SocketAddr>> {
        self.server
            .tls_port
            .map(|port| parse_addr(&self.server.bind_address, port))
            .transpose()
    }
}

impl UpstreamConfig {
    /// `host:port` of the upstream server
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

fn parse_addr(bind: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = bind
        .parse()
        .map_err(|_| RelayError::invalid_config("server.bind_address", format!("not an IP address: {}", bind)))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.port, 25);
        assert_eq!(config.upstream.relay_threads, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[server]
port = 2525
hostname = "relay.example.com"

[upstream]
host = "smtp.example.com"
port = 587
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.port, 2525);
        assert_eq!(config.server.hostname, "relay.example.com");
        assert_eq!(config.upstream.address(), "smtp.example.com:587");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[server]\nport = 2526\n[policy]\nblocked_senders = [\"spammer@bad.com\"]\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.port, 2526);
        assert_eq!(config.policy.blocked_senders, vec!["spammer@bad.com"]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::from_file(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    fn field_of(err: RelayError) -> String {
        match err {
            RelayError::InvalidConfig { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validation_names_field() {
        let mut config = Config::default();
        config.server.tls_port = Some(25);
        config.server.cert_file = Some("cert.pem".into());
        config.server.key_file = Some("key.pem".into());
        assert_eq!(field_of(config.validate().unwrap_err()), "server.tls_port");

        let mut config = Config::default();
        config.upstream.relay_threads = 65;
        assert_eq!(field_of(config.validate().unwrap_err()), "upstream.relay_threads");

        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert_eq!(field_of(config.validate().unwrap_err()), "logging.level");

        let mut config = Config::default();
        config.server.max_connections = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "server.max_connections");

        let mut config = Config::default();
        config.upstream.host = " ".to_string();
        assert_eq!(field_of(config.validate().unwrap_err()), "upstream.host");

        let mut config = Config::default();
        config.server.cert_file = Some("cert.pem".into());
        assert_eq!(field_of(config.validate().unwrap_err()), "server.cert_file");
    }

    #[test]
    fn test_storage_path_must_be_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let mut config = Config::default();
        config.storage.path = file;
        assert_eq!(field_of(config.validate().unwrap_err()), "storage.path");
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr() {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 2525;
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:2525".parse().unwrap());
        assert!(config.tls_listen_addr().unwrap().is_none());
    }
}
