//! Scripted protocol engine for unit tests.

use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    callback::SubscribeReturn,
    engine::{EngineError, ProtocolEngine},
    event::EventProducer,
    message::{Message, QoS},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect,
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        id: u32,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        id: u32,
    },
    Unsubscribe {
        topic: String,
        id: u32,
    },
    StopIo,
}

/// Records every call. With `auto_ack` on, each request is acknowledged
/// immediately from inside the call, the way a fast broker on a busy network
/// thread would race the caller.
#[derive(Default)]
pub(crate) struct MockEngine {
    producer: Mutex<Option<EventProducer>>,
    calls: Mutex<Vec<Call>>,
    call_made: Condvar,
    next_id: AtomicU32,
    auto_ack: AtomicBool,
    fail_sends: AtomicBool,
    /// Topics refused for good, the way rumqttc refuses a malformed one.
    rejected_topics: Mutex<Vec<String>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn auto_ack() -> Self {
        let engine = Self::default();
        engine.auto_ack.store(true, Ordering::SeqCst);
        engine
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn reject_topic(&self, topic: &str) {
        self.rejected_topics.lock().push(topic.to_string());
    }

    pub(crate) fn producer(&self) -> EventProducer {
        self.producer
            .lock()
            .clone()
            .expect("engine was never bound")
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Waits until at least `count` calls match `filter`, returning them.
    pub(crate) fn wait_for_calls<F>(&self, count: usize, timeout: Duration, filter: F) -> Vec<Call>
    where
        F: Fn(&Call) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut calls = self.calls.lock();
        loop {
            let matching: Vec<Call> = calls.iter().filter(|c| filter(c)).cloned().collect();
            if matching.len() >= count
                || self.call_made.wait_until(&mut calls, deadline).timed_out()
            {
                return calls.iter().filter(|c| filter(c)).cloned().collect();
            }
        }
    }

    pub(crate) fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| filter(c)).count()
    }

    pub(crate) fn connack(&self, code: u8) {
        self.producer().on_connect(code);
    }

    pub(crate) fn drop_connection(&self, code: u8) {
        self.producer().on_disconnect(code);
    }

    pub(crate) fn puback(&self, id: u32) {
        self.producer().on_publish_ack(id);
    }

    pub(crate) fn suback(&self, id: u32, granted: SubscribeReturn) {
        self.producer().on_subscribe_ack(id, granted);
    }

    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) {
        self.producer()
            .on_message(Message::new(topic, payload.to_vec(), QoS::AtMostOnce));
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
        self.call_made.notify_all();
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(EngineError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn check_topic(&self, topic: &str) -> Result<(), EngineError> {
        self.check()?;
        if self.rejected_topics.lock().iter().any(|t| t == topic) {
            return Err(EngineError::Rejected(format!("invalid topic {topic:?}")));
        }
        Ok(())
    }

    fn acking(&self) -> Option<EventProducer> {
        self.auto_ack
            .load(Ordering::SeqCst)
            .then(|| self.producer.lock().clone())
            .flatten()
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ProtocolEngine for MockEngine {
    fn bind(&self, producer: EventProducer) {
        *self.producer.lock() = Some(producer);
    }

    fn connect(&self, _keep_alive: Duration) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Connect);
        if let Some(producer) = self.acking() {
            producer.on_connect(0);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Disconnect);
        if let Some(producer) = self.acking() {
            producer.on_disconnect(0);
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<u32, EngineError> {
        self.check_topic(topic)?;
        let id = self.next_id();
        self.record(Call::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            id,
        });
        if let Some(producer) = self.acking() {
            producer.on_publish_ack(id);
        }
        Ok(id)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<u32, EngineError> {
        self.check_topic(topic)?;
        let id = self.next_id();
        self.record(Call::Subscribe {
            topic: topic.to_string(),
            qos,
            id,
        });
        if let Some(producer) = self.acking() {
            producer.on_subscribe_ack(id, SubscribeReturn::Granted(qos));
        }
        Ok(id)
    }

    fn unsubscribe(&self, topic: &str) -> Result<u32, EngineError> {
        self.check_topic(topic)?;
        let id = self.next_id();
        self.record(Call::Unsubscribe {
            topic: topic.to_string(),
            id,
        });
        if let Some(producer) = self.acking() {
            producer.on_unsubscribe_ack(id);
        }
        Ok(id)
    }

    fn stop_background_io(&self) {
        self.record(Call::StopIo);
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
