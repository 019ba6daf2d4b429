//! Daemon configuration: loading, validation and pre-logger console output.
//!
//! One TOML file drives the whole process:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [transport.endpoint]
//! host = "broker.local"
//! port = 1883
//!
//! [transport.offline_queue]
//! capacity = 100
//! drop_policy = "drop_oldest"
//!
//! [daemon]
//! status_topic = "gateways/lab/status"
//!
//! [[daemon.subscriptions]]
//! topic = "sensors/+/temp"
//! qos = 1
//! ```
//!
//! The file is read once at startup and never reloaded.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tidewatch_mqtt::QoS;
use validator::Validate;

use self::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TIDEWATCH_CONFIG";
/// Used when `TIDEWATCH_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tidewatch/config.toml";

/// Current UTC time for the `print_*` macros.
#[doc(hidden)]
pub fn console_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while locating, reading, parsing or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level daemon configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Session settings handed to the MQTT core and engine as-is.
    #[validate(nested)]
    pub transport: tidewatch_mqtt::Config,

    #[validate(nested)]
    pub daemon: DaemonConfig,
}

/// What the daemon does with its session.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Retained `online` is published here after every (re)connect. Pair it with a
    /// `[transport.last_will]` on the same topic carrying `offline`.
    #[validate(length(min = 1, message = "Status topic must not be empty"))]
    pub status_topic: Option<String>,

    /// Topics subscribed at startup. Received messages are logged.
    #[validate(nested)]
    pub subscriptions: Vec<TopicConfig>,
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    #[validate(length(min = 1, message = "Subscription topic must not be empty"))]
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

impl Config {
    /// Locates, loads and validates the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `TIDEWATCH_CONFIG` if set, otherwise `/etc/tidewatch/config.toml` if it exists.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found, set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
