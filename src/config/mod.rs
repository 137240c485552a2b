//! Configuration Module
//!
//! TOML configuration for knx2mqtt:
//! - KNX gateways and link timing
//! - MQTT broker connection and topic prefixes
//! - Event log directory
//! - Device and group address catalog
//! - Environment variable overrides (KNX2MQTT__* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::bus::BusOptions;
use crate::catalog::Catalog;
use crate::dpt;
use crate::knx::{GroupAddr, IndividualAddr, TunnelConfig};
use crate::mqtt::MqttOptions;
use crate::topic::validate_topic_name;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Shortcut for `log.level = "debug"`
    pub debug: bool,
    /// KNX side
    pub knx: KnxConfig,
    /// Broker side
    pub mqtt: MqttConfig,
    /// Event log
    pub event_log: EventLogConfig,
    /// Named devices
    pub device: Vec<DeviceConfig>,
    /// Named group addresses
    pub group: Vec<GroupConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// KNX gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnxConfig {
    /// Gateway endpoints (`host[:port]`), in routing priority order
    pub gateways: Vec<String>,
    /// Pause between connection attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Time allowed for the tunnel handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Replace a silent link after this long (0, the default, disables)
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Interval between tunnel heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Capacity of the bus event and command queues
    pub queue_capacity: usize,
    /// Shortest address prefix the router treats as a match (0-16)
    pub min_prefix_bits: u8,
}

impl Default for KnxConfig {
    fn default() -> Self {
        Self {
            gateways: Vec::new(),
            reconnect_interval: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(60),
            queue_capacity: 5,
            min_prefix_bits: crate::bus::router::MAIN_GROUP_BITS,
        }
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address (`host[:port]`)
    pub server: String,
    /// Client identifier (default: knx2mqtt-<pid>)
    pub client_id: Option<String>,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Prefix for raw event topics
    pub prefix: String,
    /// Prefix for decoded values of catalogued groups
    pub named_prefix: Option<String>,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on a single publish or subscribe
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            client_id: None,
            keep_alive: Duration::from_secs(60),
            prefix: "knx".to_string(),
            named_prefix: None,
            reconnect_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(1),
        }
    }
}

/// Event log configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EventLogConfig {
    /// Directory for `YYYY/MMDD.log` files; disabled when unset
    pub dir: Option<PathBuf>,
}

/// A named KNX device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Individual address (`1.1.10`)
    pub address: String,
    pub name: String,
}

/// A named group address
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Group address (`2/5/7`)
    pub address: String,
    /// Datapoint type code (`9.001`)
    pub dpt: String,
    pub names: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `KNX2MQTT__` prefix with double underscores for nesting:
    ///    - `KNX2MQTT__MQTT__SERVER=broker:1883` overrides `mqtt.server`
    ///    - `KNX2MQTT__KNX__GATEWAYS=10.0.0.5,10.0.0.6` overrides `knx.gateways`
    ///    - `KNX2MQTT__KNX__MIN_PREFIX_BITS=8` overrides `knx.min_prefix_bits`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, for callers that apply
    /// further overrides first. A missing file yields defaults plus
    /// environment overrides.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("mqtt.prefix", "knx")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("KNX2MQTT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("knx.gateways")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.knx.gateways.is_empty() {
            return Err(ConfigError::Validation(
                "at least one KNX gateway is required".to_string(),
            ));
        }
        if self.knx.gateways.iter().any(|g| g.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "KNX gateway address is empty".to_string(),
            ));
        }
        if self.knx.min_prefix_bits > 16 {
            return Err(ConfigError::Validation(
                "knx.min_prefix_bits must be between 0 and 16".to_string(),
            ));
        }
        if self.knx.heartbeat_interval.is_zero() {
            return Err(ConfigError::Validation(
                "knx.heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.knx.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "knx.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.mqtt.server.trim().is_empty() {
            return Err(ConfigError::Validation(
                "no MQTT server specified".to_string(),
            ));
        }
        if self.mqtt.keep_alive.as_secs() > u16::MAX as u64 {
            return Err(ConfigError::Validation(
                "mqtt.keep_alive must not exceed 65535 seconds".to_string(),
            ));
        }
        if !self.mqtt.keep_alive.is_zero() && self.mqtt.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "mqtt.keep_alive must be 0 (disabled) or at least 1 second".to_string(),
            ));
        }
        validate_prefix("mqtt.prefix", &self.mqtt.prefix)?;
        if let Some(named) = &self.mqtt.named_prefix {
            validate_prefix("mqtt.named_prefix", named)?;
            if *named == self.mqtt.prefix {
                return Err(ConfigError::Validation(
                    "mqtt.named_prefix must differ from mqtt.prefix".to_string(),
                ));
            }
        }

        self.catalog()?;
        Ok(())
    }

    /// Effective log level: `debug = true` wins over `log.level`
    pub fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log.level
        }
    }

    /// Build the address catalog from `[[device]]` and `[[group]]` entries
    pub fn catalog(&self) -> Result<Catalog, ConfigError> {
        let mut catalog = Catalog::new();

        for device in &self.device {
            let address: IndividualAddr = device
                .address
                .parse()
                .map_err(|e| ConfigError::Validation(format!("device: {}", e)))?;
            catalog
                .add_device(address, &device.name)
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        for group in &self.group {
            let address: GroupAddr = group
                .address
                .parse()
                .map_err(|e| ConfigError::Validation(format!("group: {}", e)))?;
            let datapoint = dpt::lookup(&group.dpt).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "group {}: unknown datapoint type '{}'",
                    address, group.dpt
                ))
            })?;
            catalog
                .add_group(address, datapoint, group.names.clone())
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        Ok(catalog)
    }

    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            gateways: self.knx.gateways.clone(),
            reconnect_interval: self.knx.reconnect_interval,
            idle_timeout: Some(self.knx.idle_timeout).filter(|d| !d.is_zero()),
            queue_capacity: self.knx.queue_capacity,
            min_prefix_bits: self.knx.min_prefix_bits,
        }
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            connect_timeout: self.knx.connect_timeout,
            heartbeat_interval: self.knx.heartbeat_interval,
            ..Default::default()
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let client_id = self
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("knx2mqtt-{}", std::process::id()));
        let mut options = MqttOptions::new(self.mqtt.server.trim(), client_id);
        options.keep_alive = self.mqtt.keep_alive.as_secs().min(u16::MAX as u64) as u16;
        options.connect_timeout = self.mqtt.connect_timeout;
        options.operation_timeout = self.mqtt.operation_timeout;
        options.reconnect_interval = self.mqtt.reconnect_interval;
        options
    }
}

fn validate_prefix(key: &str, prefix: &str) -> Result<(), ConfigError> {
    validate_topic_name(prefix)
        .map_err(|e| ConfigError::Validation(format!("{}: {}", key, e)))?;
    if prefix.ends_with('/') {
        return Err(ConfigError::Validation(format!(
            "{} must not end with '/'",
            key
        )));
    }
    Ok(())
}
