//! Message and quality-of-service types shared by the public API and the engines.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// QoS value outside the supported `{0, 1}` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unsupported QoS {0}, expected 0 or 1")]
pub struct UnsupportedQos(pub u8);

/// Delivery guarantee for a publish or subscription.
///
/// Only the two levels the session core replays are supported: a queued QoS 2
/// request could not be replayed with its exactly-once guarantee intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Best effort, no acknowledgment from the broker.
    #[default]
    AtMostOnce,
    /// Acknowledged by the broker, may be delivered more than once.
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = UnsupportedQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(UnsupportedQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", u8::from(*self))
    }
}

/// An application message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
