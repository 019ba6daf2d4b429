//! Error types for the session core.
//!
//! [`ClientError`] is what every public operation returns. Its variants follow the
//! request that failed and how:
//!
//! **Send-time failures** (the engine refused the request immediately):
//! - `Connect`, `Disconnect`, `Publish`, `Subscribe`, `Unsubscribe`
//!
//! **Synchronous wait timeouts** (the request is still in flight, nothing is cancelled):
//! - `ConnectTimeout`, `DisconnectTimeout`, `PublishTimeout`, `SubscribeTimeout`,
//!   `UnsubscribeTimeout`
//!
//! **Offline queue admission**:
//! - `QueueFull`, `QueueDisabled`
//!
//! **Configuration and setup** (caught before `connect`):
//! - `ConfigError`, `Backoff`, `InvalidArgument`, `ClientSetup`, `Io`
//!
//! A dropped connection is never an error: the reconnect supervisor recovers it
//! and applications observe it through the online/offline notifications.
//!
//! ```ignore
//! match core.publish("telemetry/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false) {
//!     Ok(true) => println!("acknowledged"),
//!     Ok(false) => println!("queued until the session is back"),
//!     Err(ClientError::QueueFull(_)) => eprintln!("offline queue saturated"),
//!     Err(e) => eprintln!("publish failed: {e}"),
//! }
//! ```

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{backoff::BackoffError, engine::EngineError, state::ConnectionState};

/// Operation a request belongs to, used to tag queue and state errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Connect => "connect",
            RequestKind::Disconnect => "disconnect",
            RequestKind::Publish => "publish",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
        })
    }
}

/// The unified error type of the session core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The engine refused to send CONNECT.
    #[error("Connect error: {0}")]
    Connect(#[source] EngineError),

    /// No CONNACK within the connect/disconnect timeout.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Disconnect error: {0}")]
    Disconnect(#[source] EngineError),

    #[error("Disconnect timed out after {0:?}")]
    DisconnectTimeout(Duration),

    #[error("Publish error: {0}")]
    Publish(#[source] EngineError),

    /// No PUBACK within the operation timeout. The publish may still complete.
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Subscribe error: {0}")]
    Subscribe(#[source] EngineError),

    #[error("Subscribe timed out after {0:?}")]
    SubscribeTimeout(Duration),

    #[error("Unsubscribe error: {0}")]
    Unsubscribe(#[source] EngineError),

    #[error("Unsubscribe timed out after {0:?}")]
    UnsubscribeTimeout(Duration),

    /// The offline queue was full.
    ///
    /// With `DropOldest` the request *was* stored after evicting the oldest one;
    /// the error still signals saturation.
    #[error("Offline queue is full while queueing {0} request")]
    QueueFull(RequestKind),

    /// Offline queueing is disabled (capacity 0) and the client is not connected.
    #[error("Offline queueing is disabled, {0} request rejected")]
    QueueDisabled(RequestKind),

    /// The request makes no sense in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: RequestKind,
        state: ConnectionState,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid backoff timing: {0}")]
    Backoff(#[from] BackoffError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The protocol engine could not be built (TLS material, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// A worker thread could not be started, or a file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub(crate) fn send_failure(kind: RequestKind, err: EngineError) -> Self {
        match kind {
            RequestKind::Connect => ClientError::Connect(err),
            RequestKind::Disconnect => ClientError::Disconnect(err),
            RequestKind::Publish => ClientError::Publish(err),
            RequestKind::Subscribe => ClientError::Subscribe(err),
            RequestKind::Unsubscribe => ClientError::Unsubscribe(err),
        }
    }

    pub(crate) fn timeout(kind: RequestKind, after: Duration) -> Self {
        match kind {
            RequestKind::Connect => ClientError::ConnectTimeout(after),
            RequestKind::Disconnect => ClientError::DisconnectTimeout(after),
            RequestKind::Publish => ClientError::PublishTimeout(after),
            RequestKind::Subscribe => ClientError::SubscribeTimeout(after),
            RequestKind::Unsubscribe => ClientError::UnsubscribeTimeout(after),
        }
    }

    /// True for the synchronous wait timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout(_)
                | ClientError::DisconnectTimeout(_)
                | ClientError::PublishTimeout(_)
                | ClientError::SubscribeTimeout(_)
                | ClientError::UnsubscribeTimeout(_)
        )
    }
}
