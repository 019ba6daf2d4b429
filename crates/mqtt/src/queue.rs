//! Offline request queue.
//!
//! Requests made while the session is down or still recovering are parked here and
//! replayed in FIFO order once the connection is back ("draining"). The queue is
//! bounded by a signed capacity:
//!
//! | capacity | behavior                                  |
//! |----------|-------------------------------------------|
//! | `0`      | disabled, every append is rejected        |
//! | `< 0`    | unbounded                                 |
//! | `> 0`    | bounded, overflow handled by `DropPolicy` |
//!
//! A `DropOldest` append on a full queue evicts the head and stores the new item,
//! yet still reports [`AppendResult::FailureQueueFull`] so the caller learns the
//! queue is saturated.

use std::{collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    callback::{SharedAckCallback, SharedMessageCallback},
    error::RequestKind,
    message::QoS,
};

/// What to discard when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued request to make room.
    DropOldest,
    /// Reject the incoming request.
    #[default]
    DropNewest,
}

/// Result of [`OfflineQueue::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Success,
    FailureQueueFull,
    FailureQueueDisabled,
}

/// Capacity decoded from its signed configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCapacity {
    Disabled,
    Unbounded,
    Bounded(usize),
}

impl From<i64> for QueueCapacity {
    fn from(capacity: i64) -> Self {
        match capacity {
            0 => QueueCapacity::Disabled,
            c if c < 0 => QueueCapacity::Unbounded,
            c => QueueCapacity::Bounded(usize::try_from(c).unwrap_or(usize::MAX)),
        }
    }
}

/// FIFO buffer with capacity and eviction policy.
#[derive(Debug)]
pub struct OfflineQueue<T> {
    items: VecDeque<T>,
    capacity: QueueCapacity,
    policy: DropPolicy,
}

impl<T> OfflineQueue<T> {
    pub fn new(capacity: i64, policy: DropPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.into(),
            policy,
        }
    }

    pub fn append(&mut self, item: T) -> AppendResult {
        match self.capacity {
            QueueCapacity::Disabled => AppendResult::FailureQueueDisabled,
            QueueCapacity::Bounded(limit) if self.items.len() >= limit => match self.policy {
                DropPolicy::DropNewest => AppendResult::FailureQueueFull,
                DropPolicy::DropOldest => {
                    self.items.pop_front();
                    self.items.push_back(item);
                    AppendResult::FailureQueueFull
                }
            },
            _ => {
                self.items.push_back(item);
                AppendResult::Success
            }
        }
    }

    /// Removes and returns the oldest item.
    pub fn pop_next(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Puts an item back at the head, ahead of everything else.
    ///
    /// Only meant for an item just taken with [`pop_next`](Self::pop_next), so the
    /// capacity bound still holds.
    pub fn requeue_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Puts requests that were in flight on a lost session back at the head,
    /// keeping their order.
    ///
    /// They were admitted once already, so the bound is not applied.
    pub fn restore_front(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.capacity == QueueCapacity::Disabled
    }

    /// Applies a new capacity and policy, trimming stored items that no longer fit.
    ///
    /// Trimming follows the policy: `DropOldest` keeps the most recent items,
    /// `DropNewest` keeps the earliest ones.
    pub fn reconfigure(&mut self, capacity: i64, policy: DropPolicy) {
        self.capacity = capacity.into();
        self.policy = policy;

        let keep = match self.capacity {
            QueueCapacity::Disabled => 0,
            QueueCapacity::Unbounded => self.items.len(),
            QueueCapacity::Bounded(limit) => limit.min(self.items.len()),
        };
        let excess = self.items.len() - keep;
        if excess > 0 {
            warn!(
                "Offline queue reconfigured, discarding {} queued requests",
                excess
            );
            match policy {
                DropPolicy::DropOldest => {
                    self.items.drain(..excess);
                }
                DropPolicy::DropNewest => self.items.truncate(keep),
            }
        }
        debug!(
            "Offline queue configured: capacity={:?}, policy={:?}",
            self.capacity, self.policy
        );
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// A request parked while offline, replayed during draining.
#[derive(Clone)]
pub enum OfflineRequest {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        ack_callback: Option<SharedAckCallback>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        message_callback: SharedMessageCallback,
        ack_callback: Option<SharedAckCallback>,
    },
    Unsubscribe {
        topic: String,
        ack_callback: Option<SharedAckCallback>,
    },
}

impl OfflineRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            OfflineRequest::Publish { .. } => RequestKind::Publish,
            OfflineRequest::Subscribe { .. } => RequestKind::Subscribe,
            OfflineRequest::Unsubscribe { .. } => RequestKind::Unsubscribe,
        }
    }

    /// Callback to notify when the replayed request is acknowledged.
    pub fn ack_callback(&self) -> Option<SharedAckCallback> {
        match self {
            OfflineRequest::Publish { ack_callback, .. }
            | OfflineRequest::Subscribe { ack_callback, .. }
            | OfflineRequest::Unsubscribe { ack_callback, .. } => ack_callback.clone(),
        }
    }

    /// Replaces the callback notified when the request is acknowledged.
    pub fn with_ack_callback(mut self, callback: Option<SharedAckCallback>) -> Self {
        match &mut self {
            OfflineRequest::Publish { ack_callback, .. }
            | OfflineRequest::Subscribe { ack_callback, .. }
            | OfflineRequest::Unsubscribe { ack_callback, .. } => *ack_callback = callback,
        }
        self
    }

    pub fn topic(&self) -> &str {
        match self {
            OfflineRequest::Publish { topic, .. }
            | OfflineRequest::Subscribe { topic, .. }
            | OfflineRequest::Unsubscribe { topic, .. } => topic,
        }
    }
}

impl fmt::Debug for OfflineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineRequest::Publish {
                topic,
                payload,
                qos,
                retain,
                ack_callback,
            } => f
                .debug_struct("Publish")
                .field("topic", topic)
                .field("payload_len", &payload.len())
                .field("qos", qos)
                .field("retain", retain)
                .field("has_ack_callback", &ack_callback.is_some())
                .finish(),
            OfflineRequest::Subscribe {
                topic,
                qos,
                ack_callback,
                ..
            } => f
                .debug_struct("Subscribe")
                .field("topic", topic)
                .field("qos", qos)
                .field("has_ack_callback", &ack_callback.is_some())
                .finish(),
            OfflineRequest::Unsubscribe {
                topic,
                ack_callback,
            } => f
                .debug_struct("Unsubscribe")
                .field("topic", topic)
                .field("has_ack_callback", &ack_callback.is_some())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::Message;

    fn fill(queue: &mut OfflineQueue<u32>, items: impl IntoIterator<Item = u32>) -> Vec<AppendResult> {
        items.into_iter().map(|item| queue.append(item)).collect()
    }

    fn contents(queue: &OfflineQueue<u32>) -> Vec<u32> {
        queue.iter().copied().collect()
    }

    #[test]
    fn test_drop_newest_keeps_first_items() {
        let mut queue = OfflineQueue::new(3, DropPolicy::DropNewest);
        let results = fill(&mut queue, 0..5);

        assert_eq!(contents(&queue), vec![0, 1, 2]);
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == AppendResult::FailureQueueFull)
                .count(),
            2
        );
        assert_eq!(results[..3], [AppendResult::Success; 3]);
    }

    #[test]
    fn test_drop_oldest_keeps_latest_items() {
        let mut queue = OfflineQueue::new(3, DropPolicy::DropOldest);
        let results = fill(&mut queue, 0..5);

        assert_eq!(contents(&queue), vec![2, 3, 4]);
        assert_eq!(
            results,
            vec![
                AppendResult::Success,
                AppendResult::Success,
                AppendResult::Success,
                AppendResult::FailureQueueFull,
                AppendResult::FailureQueueFull,
            ]
        );
    }

    #[test]
    fn test_bounded_length_never_exceeds_capacity() {
        for policy in [DropPolicy::DropOldest, DropPolicy::DropNewest] {
            let mut queue = OfflineQueue::new(4, policy);
            for item in 0..50 {
                queue.append(item);
                assert!(queue.len() <= 4);
            }
            let expected: Vec<u32> = match policy {
                DropPolicy::DropOldest => (46..50).collect(),
                DropPolicy::DropNewest => (0..4).collect(),
            };
            assert_eq!(contents(&queue), expected);
        }
    }

    #[test]
    fn test_disabled_queue_rejects_everything() {
        let mut queue = OfflineQueue::new(0, DropPolicy::DropOldest);
        for item in 0..10 {
            assert_eq!(queue.append(item), AppendResult::FailureQueueDisabled);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), QueueCapacity::Disabled);
    }

    #[test]
    fn test_negative_capacity_is_unbounded() {
        let mut queue = OfflineQueue::new(-1, DropPolicy::DropNewest);
        assert!(fill(&mut queue, 0..1000)
            .iter()
            .all(|r| *r == AppendResult::Success));
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.capacity(), QueueCapacity::Unbounded);
    }

    #[test]
    fn test_pop_next_is_fifo() {
        let mut queue = OfflineQueue::new(-1, DropPolicy::DropNewest);
        fill(&mut queue, [3, 1, 2]);

        assert_eq!(queue.pop_next(), Some(3));
        queue.requeue_front(3);
        assert_eq!(queue.pop_next(), Some(3));
        assert_eq!(queue.pop_next(), Some(1));
        assert_eq!(queue.pop_next(), Some(2));
        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn test_restore_front_keeps_order_past_capacity() {
        let mut queue = OfflineQueue::new(2, DropPolicy::DropNewest);
        fill(&mut queue, [10, 11]);

        queue.restore_front(vec![1, 2]);
        assert_eq!(contents(&queue), vec![1, 2, 10, 11]);
        assert_eq!(queue.append(12), AppendResult::FailureQueueFull);
        assert!(!queue.is_disabled());
        assert!(OfflineQueue::<u32>::new(0, DropPolicy::DropNewest).is_disabled());
    }

    #[test]
    fn test_reconfigure_trims_by_policy() {
        let mut oldest = OfflineQueue::new(-1, DropPolicy::DropNewest);
        fill(&mut oldest, 0..6);
        oldest.reconfigure(2, DropPolicy::DropOldest);
        assert_eq!(contents(&oldest), vec![4, 5]);

        let mut newest = OfflineQueue::new(-1, DropPolicy::DropNewest);
        fill(&mut newest, 0..6);
        newest.reconfigure(2, DropPolicy::DropNewest);
        assert_eq!(contents(&newest), vec![0, 1]);

        newest.reconfigure(0, DropPolicy::DropNewest);
        assert!(newest.is_empty());
    }

    #[test]
    fn test_offline_request_kind_and_topic() {
        let publish = OfflineRequest::Publish {
            topic: "p".into(),
            payload: vec![1, 2],
            qos: QoS::AtLeastOnce,
            retain: false,
            ack_callback: None,
        };
        let subscribe = OfflineRequest::Subscribe {
            topic: "s".into(),
            qos: QoS::AtMostOnce,
            message_callback: Arc::new(|_: &Message| {}),
            ack_callback: None,
        };
        let unsubscribe = OfflineRequest::Unsubscribe {
            topic: "u".into(),
            ack_callback: None,
        };

        assert_eq!(publish.kind(), RequestKind::Publish);
        assert_eq!(subscribe.kind(), RequestKind::Subscribe);
        assert_eq!(unsubscribe.kind(), RequestKind::Unsubscribe);
        assert_eq!(subscribe.topic(), "s");
        assert!(format!("{publish:?}").contains("payload_len: 2"));
    }
}
