//! Normalized protocol events and the queue connecting the engine to the consumer.
//!
//! The protocol engine reports what happens on the wire through an
//! [`EventProducer`]. Each notification becomes an [`EventRecord`] pushed onto the
//! shared [`EventQueue`]; the event consumer pops them strictly in arrival order.
//! Producer calls only touch the queue lock, so an engine may call them from its
//! network thread, or even from inside a `publish` call, without deadlocking the
//! orchestrator.

use std::{collections::VecDeque, fmt, sync::Arc, time::Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{callback::SubscribeReturn, message::Message};

/// Correlation identifier of a request or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// The single in-flight CONNECT.
    Connect,
    /// The single in-flight DISCONNECT.
    Disconnect,
    /// Inbound messages, never correlated with a request.
    Message,
    /// Returned for requests parked in the offline queue. Never stored.
    Queued,
    /// Identifier assigned by the protocol engine.
    Packet(u32),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Connect => f.write_str("connect"),
            RequestId::Disconnect => f.write_str("disconnect"),
            RequestId::Message => f.write_str("message"),
            RequestId::Queued => f.write_str("queued"),
            RequestId::Packet(id) => write!(f, "#{id}"),
        }
    }
}

/// Event type with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ConnAck { code: u8 },
    Disconnect { code: u8 },
    PubAck,
    SubAck(SubscribeReturn),
    UnsubAck,
    Message(Message),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ConnAck { .. } => "connack",
            EventKind::Disconnect { .. } => "disconnect",
            EventKind::PubAck => "puback",
            EventKind::SubAck(_) => "suback",
            EventKind::UnsubAck => "unsuback",
            EventKind::Message(_) => "message",
        }
    }
}

/// A normalized `(correlation id, event)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: RequestId,
    pub kind: EventKind,
}

/// What the consumer should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Next {
    Event(EventRecord),
    /// The requested tick deadline passed with no event pending.
    Tick,
    Stopped,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<EventRecord>,
    stopped: bool,
}

/// FIFO of event records guarded by a mutex/condition pair.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl EventQueue {
    pub(crate) fn push(&self, record: EventRecord) {
        let mut state = self.state.lock();
        if state.stopped {
            trace!("Event queue stopped, dropping {} event", record.kind.name());
            return;
        }
        state.events.push_back(record);
        self.available.notify_one();
    }

    /// Pops the oldest event, blocking until one arrives, the queue is stopped, or
    /// `tick_at` passes.
    pub(crate) fn next(&self, tick_at: Option<Instant>) -> Next {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Next::Stopped;
            }
            if let Some(record) = state.events.pop_front() {
                return Next::Event(record);
            }
            match tick_at {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.available.wait_until(&mut state, deadline).timed_out()
                    {
                        return Next::Tick;
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Wakes the consumer and makes every later `next` return [`Next::Stopped`].
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        let dropped = state.events.len();
        state.events.clear();
        if dropped > 0 {
            debug!("Event queue stopped with {} undispatched events", dropped);
        }
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().events.len()
    }
}

/// Callback set handed to a [`ProtocolEngine`](crate::engine::ProtocolEngine).
///
/// Cheap to clone; every method is non-blocking.
#[derive(Debug, Clone)]
pub struct EventProducer {
    queue: Arc<EventQueue>,
}

impl EventProducer {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }

    fn emit(&self, id: RequestId, kind: EventKind) {
        trace!("Producing {} event for {}", kind.name(), id);
        self.queue.push(EventRecord { id, kind });
    }

    /// CONNACK received; `code` 0 means accepted.
    pub fn on_connect(&self, code: u8) {
        self.emit(RequestId::Connect, EventKind::ConnAck { code });
    }

    /// The network session ended, for whatever reason.
    pub fn on_disconnect(&self, code: u8) {
        self.emit(RequestId::Disconnect, EventKind::Disconnect { code });
    }

    pub fn on_publish_ack(&self, id: u32) {
        self.emit(RequestId::Packet(id), EventKind::PubAck);
    }

    pub fn on_subscribe_ack(&self, id: u32, granted: SubscribeReturn) {
        self.emit(RequestId::Packet(id), EventKind::SubAck(granted));
    }

    pub fn on_unsubscribe_ack(&self, id: u32) {
        self.emit(RequestId::Packet(id), EventKind::UnsubAck);
    }

    pub fn on_message(&self, message: Message) {
        self.emit(RequestId::Message, EventKind::Message(message));
    }
}
