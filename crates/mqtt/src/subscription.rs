//! Registry of active subscriptions, replayed after every reconnect.
//!
//! Records are keyed by exact topic filter. The broker forgets subscriptions of a
//! clean session, so after each CONNACK the event consumer walks a snapshot of this
//! registry and re-issues every subscription.
//!
//! Inbound messages carry the concrete topic they were published on, so routing
//! goes through [`SubscriptionRegistry::matching`], which also resolves `+` and
//! `#` filters.

use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    callback::{SharedAckCallback, SharedMessageCallback},
    message::QoS,
};

/// One active subscription.
#[derive(Clone)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub qos: QoS,
    pub message_callback: SharedMessageCallback,
    pub ack_callback: Option<SharedAckCallback>,
}

impl fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("has_ack_callback", &self.ack_callback.is_some())
            .finish()
    }
}

/// Thread-safe, insertion-ordered map of topic to [`SubscriptionRecord`].
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    records: Mutex<Vec<SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `topic`. A replaced record keeps its position.
    pub fn add_record(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        message_callback: SharedMessageCallback,
        ack_callback: Option<SharedAckCallback>,
    ) {
        let record = SubscriptionRecord {
            topic: topic.into(),
            qos,
            message_callback,
            ack_callback,
        };
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.topic == record.topic) {
            Some(existing) => {
                debug!("Replacing subscription record for {}", record.topic);
                *existing = record;
            }
            None => {
                debug!("Adding subscription record for {}", record.topic);
                records.push(record);
            }
        }
    }

    /// Removes the record for `topic`. Returns whether one existed.
    pub fn remove_record(&self, topic: &str) -> bool {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.topic != topic);
        let removed = records.len() != before;
        if removed {
            debug!("Removed subscription record for {}", topic);
        }
        removed
    }

    /// Snapshot of all records, safe to iterate while the registry changes.
    pub fn list_records(&self) -> Vec<SubscriptionRecord> {
        self.records.lock().clone()
    }

    pub fn get(&self, topic: &str) -> Option<SubscriptionRecord> {
        self.records.lock().iter().find(|r| r.topic == topic).cloned()
    }

    /// The record whose filter covers the concrete `topic`.
    ///
    /// A record for the exact topic wins; otherwise the oldest wildcard filter
    /// that matches.
    pub fn matching(&self, topic: &str) -> Option<SubscriptionRecord> {
        let records = self.records.lock();
        records
            .iter()
            .find(|r| r.topic == topic)
            .or_else(|| records.iter().find(|r| rumqttc::matches(topic, &r.topic)))
            .cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
