//! # tidewatch-mqtt: a persistent MQTT session core
//!
//! A client that keeps one MQTT 3.1.1 session alive for the lifetime of the
//! process, on top of a pluggable wire-protocol engine. While the network is
//! healthy requests go straight to the broker. While it is not, they are parked in
//! a bounded offline queue and replayed in order once the session is back.
//!
//! - **Connection state machine** with a single owner of every transition
//! - **Progressive backoff** that doubles per failed attempt and resets after a
//!   stable period
//! - **Automatic resubscription** of every acknowledged subscription after a
//!   reconnect, before queued requests are replayed
//! - **Offline queue** with `DropNewest`/`DropOldest` policies
//! - **Sync and async APIs** over one correlation table: block for the
//!   acknowledgment, or get called back with it
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidewatch_mqtt::{Config, Message, MqttCore, QoS, RumqttEngine};
//!
//! let config = Config::default();
//! let engine = Arc::new(RumqttEngine::from_config(&config)?);
//! let core = MqttCore::from_config(engine, &config)?;
//!
//! core.on_online(|| println!("online"));
//! core.connect()?;
//!
//! core.subscribe(
//!     "sensors/+/temp",
//!     QoS::AtLeastOnce,
//!     Arc::new(|message: &Message| println!("{}: {:?}", message.topic, message.payload_str())),
//! )?;
//!
//! // Acknowledged now, or queued and replayed after the next reconnect.
//! core.publish("sensors/kitchen/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false)?;
//! ```
//!
//! # Threads
//!
//! | Thread | Role |
//! |--------|------|
//! | `tidewatch-events` | Dispatches engine events in arrival order, paces recovery |
//! | `tidewatch-reconnect` | Sleeps through backoff and re-issues CONNECT |
//! | `tidewatch-callback-N` | Runs user callbacks and hooks |
//! | `tidewatch-stability` | Resets backoff after a stable period |
//! | `tidewatch-net` | Polls the rumqttc connection (one per session) |
//!
//! User code is never called on the event thread, so a slow callback delays
//! other callbacks but never acknowledgments or recovery.
//!
//! # Connection lifecycle
//!
//! ```text
//! Idle -> Connecting -> Resubscribing -> Draining -> Stable
//!             ^                                        |
//!             |                                        v
//!             +---------- AbnormalDisconnect <---------+
//!
//! any state -> UserDisconnect -> Connecting
//! ```

pub mod backoff;
pub mod callback;
pub mod client;
pub mod config;
mod consumer;
pub mod core;
mod correlation;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod queue;
pub mod state;
pub mod subscription;
mod supervisor;

#[cfg(test)]
mod testing;

// Re-exports: entry points
pub use crate::core::{CoreSettings, MqttCore};
pub use client::RumqttEngine;
// Re-exports: configuration
pub use config::{
    BackoffConfig, Config, CredentialsConfig, EndpointConfig, LastWillConfig,
    OfflineQueueConfig, SessionConfig, TlsConfig,
};
// Re-exports: errors
pub use error::{ClientError, RequestKind};
// Re-exports: engine seam
pub use engine::{EngineError, ProtocolEngine};
pub use event::{EventKind, EventProducer, EventRecord, RequestId};
// Re-exports: callbacks and payloads
pub use callback::{
    AckCallback, AckData, MessageCallback, NotifyCallback, SharedAckCallback,
    SharedMessageCallback, SubscribeReturn,
};
pub use message::{Message, QoS};
// Re-exports: building blocks
pub use backoff::{BackoffController, BackoffTiming};
pub use queue::{AppendResult, DropPolicy, OfflineQueue, OfflineRequest};
pub use state::{ConnectionState, StateCell};
pub use subscription::{SubscriptionRecord, SubscriptionRegistry};

/// Result type of every fallible session operation.
pub type Result<T> = std::result::Result<T, ClientError>;
