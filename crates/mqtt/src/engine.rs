//! The seam between the session core and the wire protocol.
//!
//! A [`ProtocolEngine`] encodes packets, owns the socket and runs the network loop.
//! The core only issues requests through it and learns about their outcome through
//! the [`EventProducer`] handed over by [`ProtocolEngine::bind`]. The crate ships a
//! `rumqttc`-backed implementation, [`RumqttEngine`](crate::client::RumqttEngine).

use std::time::Duration;

use thiserror::Error;

use crate::{event::EventProducer, message::QoS};

/// Immediate (send-time) failure reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// There is no network session to send on.
    #[error("Not connected to a broker")]
    NotConnected,

    /// The engine's request channel could not take the request right now (full or
    /// closing). Sending it again later may succeed.
    #[error("Engine busy: {0}")]
    Busy(String),

    /// The engine will never send this request, for example because its topic
    /// is malformed.
    #[error("Request rejected by the engine: {0}")]
    Rejected(String),

    /// The engine could not be set up for a new session.
    #[error("Engine setup failed: {0}")]
    Setup(String),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when the same request may go through on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::NotConnected)
    }
}

/// Operations the session core consumes from a wire-protocol implementation.
///
/// Implementations must be callable from several threads at once. Events must be
/// reported in wire order through the bound producer, and a session that ends for
/// any reason (including a refused CONNECT) must end with `on_disconnect`.
pub trait ProtocolEngine: Send + Sync {
    /// Registers the callback set. Called once, before any other method.
    fn bind(&self, producer: EventProducer);

    /// Starts a new network session and sends CONNECT.
    fn connect(&self, keep_alive: Duration) -> Result<(), EngineError>;

    /// Sends DISCONNECT on the current session.
    fn disconnect(&self) -> Result<(), EngineError>;

    /// Sends PUBLISH, returning the identifier its acknowledgment will carry.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool)
        -> Result<u32, EngineError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<u32, EngineError>;

    fn unsubscribe(&self, topic: &str) -> Result<u32, EngineError>;

    /// Tears down the background network loop after a user disconnect.
    fn stop_background_io(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_and_not_connected_are_transient() {
        assert!(EngineError::Busy("full".into()).is_transient());
        assert!(EngineError::NotConnected.is_transient());
        assert!(!EngineError::Rejected("invalid topic".into()).is_transient());
        assert!(!EngineError::Setup("unbound".into()).is_transient());
    }
}
