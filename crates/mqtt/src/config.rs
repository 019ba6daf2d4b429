//! Configuration of a client session.
//!
//! Everything here deserializes with serde (TOML in practice) and is checked with
//! `validator` before any network activity. Sections:
//!
//! - `endpoint`: broker address, client identity and engine sizing
//! - `credentials`, `tls`, `last_will`: optional connect-time options
//! - `backoff`: reconnect quiet-time bounds
//! - `offline_queue`: capacity and drop policy while offline
//! - `session`: draining pace and synchronous wait timeouts
//!
//! # Examples
//!
//! ```ignore
//! let config: Config = toml::from_str(r#"
//!     [endpoint]
//!     host = "broker.local"
//!     port = 8883
//!
//!     [tls]
//!     ca_cert_path = "/etc/tidewatch/ca.pem"
//!
//!     [offline_queue]
//!     capacity = -1
//! "#)?;
//! config.validate()?;
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    backoff::{BackoffError, BackoffTiming},
    message::QoS,
    queue::DropPolicy,
};

/// Complete session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub endpoint: EndpointConfig,

    #[validate(nested)]
    pub credentials: Option<CredentialsConfig>,

    /// TLS material. Absent means plain TCP.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    /// Message the broker publishes on our behalf if the session dies uncleanly.
    #[validate(nested)]
    pub last_will: Option<LastWillConfig>,

    #[validate(nested)]
    pub backoff: BackoffConfig,

    pub offline_queue: OfflineQueueConfig,

    #[validate(nested)]
    pub session: SessionConfig,
}

/// Broker address and client identity.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EndpointConfig {
    /// Broker hostname or IP address. Resolution happens at connect time.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port: 1883 for plain MQTT, 8883 for MQTT over TLS.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Client identifier presented in CONNECT. Defaults to a random UUID.
    #[validate(length(
        min = 1,
        max = 36,
        message = "Client ID must be between 1 and 36 characters"
    ))]
    pub client_id: String,

    /// Ask the broker to discard session state on connect.
    ///
    /// Subscriptions are replayed after every reconnect either way.
    pub clean_session: bool,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Capacity of the engine's internal request channel.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Threads running user callbacks.
    #[validate(range(
        min = 1,
        max = 64,
        message = "Callback workers must be between 1 and 64"
    ))]
    pub callback_workers: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: Uuid::new_v4().to_string(),
            clean_session: true,
            keep_alive: 30,
            request_channel_capacity: 64,
            callback_workers: 4,
        }
    }
}

impl EndpointConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }
}

/// Username/password authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CredentialsConfig {
    #[validate(length(min = 1, message = "Username must not be empty"))]
    pub username: String,
    pub password: Option<String>,
}

/// TLS/SSL configuration for secure broker connections.
///
/// Paths are checked for existence during validation; the files are read when the
/// engine is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM CA certificate used to verify the broker.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// PEM client certificate for mutual TLS. Needs `client_key_path` too.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted PEM private key matching `client_cert_path`.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    /// TLS with mutual authentication.
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    /// TLS with broker verification only.
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// True only if both client certificate and key are set.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks the combination of paths, beyond the per-field existence checks.
    ///
    /// A CA certificate is mandatory, and client certificate and key come as a pair.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Last will and testament.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LastWillConfig {
    #[validate(length(min = 1, message = "Last will topic must not be empty"))]
    pub topic: String,
    pub payload: String,
    /// 0 or 1; QoS 2 is not supported.
    #[validate(range(min = 0, max = 1, message = "Last will QoS must be 0 or 1"))]
    pub qos: u8,
    pub retain: bool,
}

impl Default for LastWillConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            payload: String::new(),
            qos: 0,
            retain: false,
        }
    }
}

impl LastWillConfig {
    pub fn qos(&self) -> QoS {
        QoS::try_from(self.qos).unwrap_or_default()
    }
}

/// Reconnect backoff bounds, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_bounds"))]
pub struct BackoffConfig {
    #[validate(range(min = 1, message = "Base reconnect time must be at least 1 second"))]
    pub base_reconnect_secs: u64,
    #[validate(range(min = 1, message = "Max reconnect time must be at least 1 second"))]
    pub max_reconnect_secs: u64,
    /// How long a connection must hold before backoff resets to the base.
    pub stable_connection_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_reconnect_secs: 1,
            max_reconnect_secs: 32,
            stable_connection_secs: 20,
        }
    }
}

impl BackoffConfig {
    pub fn timing(&self) -> Result<BackoffTiming, BackoffError> {
        BackoffTiming::from_secs(
            self.base_reconnect_secs,
            self.max_reconnect_secs,
            self.stable_connection_secs,
        )
    }
}

fn validate_backoff_bounds(config: &BackoffConfig) -> Result<(), ValidationError> {
    if config.base_reconnect_secs >= config.stable_connection_secs {
        return Err(ValidationError::new("base_not_below_stable").with_message(
            format!(
                "Base reconnect time ({}s) must be less than stable connection time ({}s)",
                config.base_reconnect_secs, config.stable_connection_secs
            )
            .into(),
        ));
    }
    if config.max_reconnect_secs < config.base_reconnect_secs {
        return Err(ValidationError::new("max_below_base").with_message(
            "Max reconnect time must not be less than the base reconnect time".into(),
        ));
    }
    Ok(())
}

/// Offline queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueConfig {
    /// `0` disables queueing, a negative value means unbounded.
    pub capacity: i64,
    pub drop_policy: DropPolicy,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

/// Recovery pacing and synchronous API timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between two replayed requests while resubscribing or draining.
    #[validate(range(
        min = 1,
        max = 60000,
        message = "Draining interval must be between 1 and 60000 milliseconds"
    ))]
    pub draining_interval_ms: u64,

    #[validate(range(
        min = 1,
        max = 300,
        message = "Connect/disconnect timeout must be between 1 and 300 seconds"
    ))]
    pub connect_disconnect_timeout_secs: u64,

    /// Wait bound for synchronous publish, subscribe and unsubscribe.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Operation timeout must be between 1 and 300 seconds"
    ))]
    pub operation_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            draining_interval_ms: 500,
            connect_disconnect_timeout_secs: 30,
            operation_timeout_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn draining_interval(&self) -> Duration {
        Duration::from_millis(self.draining_interval_ms)
    }

    pub fn connect_disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_disconnect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn validate_optional_file_exists(path: &str) -> Result<(), ValidationError> {
    validate_file_path(path)
}

/// Checks that `path` names an existing regular file.
fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}
