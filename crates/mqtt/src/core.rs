//! The request orchestrator.
//!
//! [`MqttCore`] is the object applications hold. It owns one persistent session:
//! it routes each request either straight to the protocol engine or into the
//! offline queue, correlates acknowledgments with the callers waiting for them, and
//! runs two background threads:
//!
//! - `tidewatch-events`: the event consumer, sole driver of the recovery states
//! - `tidewatch-reconnect`: the reconnect supervisor, which backs off and reconnects
//!   after an abnormal disconnect
//!
//! Every operation comes in two forms. The `*_async` form returns a [`RequestId`]
//! immediately ([`RequestId::Queued`] if the request was parked offline) and reports
//! the acknowledgment through an optional callback. The blocking form waits for the
//! acknowledgment up to the configured timeout. A timeout never cancels the request.
//!
//! # Examples
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
//! core.subscribe("sensors/+/temp", QoS::AtLeastOnce, Arc::new(|m: &Message| {
//!     println!("{}: {:?}", m.topic, m.payload_str());
//! }))?;
//! core.publish("gateway/status", "online", QoS::AtLeastOnce, true)?;
//! ```

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::{
    backoff::{BackoffController, BackoffTiming},
    callback::{
        AckData, CallbackPool, MessageCallback, NotifyCallback, SharedAckCallback,
        SharedMessageCallback, SubscribeReturn,
    },
    config::Config,
    consumer,
    correlation::{Completion, PendingRequest, PendingTable, RegistryEffect, Responder},
    engine::{EngineError, ProtocolEngine},
    error::{ClientError, RequestKind},
    event::{EventProducer, EventQueue, RequestId},
    message::QoS,
    queue::{AppendResult, DropPolicy, OfflineQueue, OfflineRequest},
    state::{ConnectionState, StateCell},
    subscription::{SubscriptionRecord, SubscriptionRegistry},
    supervisor::{self, InterruptibleSleeper, Signal},
};

/// Runtime settings of a client, adjustable through the `configure_*` methods.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Pause between two replayed requests while resubscribing or draining.
    pub draining_interval: Duration,
    pub connect_disconnect_timeout: Duration,
    /// Wait bound of the blocking publish, subscribe and unsubscribe.
    pub operation_timeout: Duration,
    pub keep_alive: Duration,
    /// Number of threads running user callbacks. Fixed at construction.
    pub callback_workers: usize,
    pub backoff: BackoffTiming,
    /// `0` disables the offline queue, a negative value makes it unbounded.
    pub queue_capacity: i64,
    pub drop_policy: DropPolicy,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            draining_interval: Duration::from_millis(500),
            connect_disconnect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
            callback_workers: 4,
            backoff: BackoffTiming::default(),
            queue_capacity: 20,
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

impl CoreSettings {
    /// Validates `config` and extracts the settings the core needs from it.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            draining_interval: config.session.draining_interval(),
            connect_disconnect_timeout: config.session.connect_disconnect_timeout(),
            operation_timeout: config.session.operation_timeout(),
            keep_alive: config.endpoint.keep_alive(),
            callback_workers: config.endpoint.callback_workers,
            backoff: config.backoff.timing()?,
            queue_capacity: config.offline_queue.capacity,
            drop_policy: config.offline_queue.drop_policy,
        })
    }
}

/// Application notification hooks.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) online: Option<NotifyCallback>,
    pub(crate) offline: Option<NotifyCallback>,
    /// Sees every inbound message, before topic routing.
    pub(crate) message: Option<SharedMessageCallback>,
    /// Messages on topics with no registry record. Logged when unset.
    pub(crate) unhandled: Option<SharedMessageCallback>,
}

/// State shared by the orchestrator, the event consumer and the supervisor.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) queue: Mutex<OfflineQueue<OfflineRequest>>,
    pub(crate) pending: PendingTable,
    pub(crate) events: Arc<EventQueue>,
    pub(crate) backoff: BackoffController,
    pub(crate) sleeper: Arc<InterruptibleSleeper>,
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) pool: CallbackPool,
    pub(crate) settings: Mutex<CoreSettings>,
    pub(crate) hooks: Mutex<Hooks>,
    /// Bumped by every connect and disconnect; a reconnect attempt only proceeds
    /// if nothing else happened since the disconnect that scheduled it.
    pub(crate) connect_epoch: Mutex<u64>,
    pub(crate) signals: Sender<Signal>,
}

impl Shared {
    pub(crate) fn send_connect(
        &self,
        responder: Option<Responder>,
    ) -> Result<RequestId, EngineError> {
        let keep_alive = self.settings.lock().keep_alive;
        self.pending
            .register_with(PendingRequest::new(responder), || {
                self.engine.connect(keep_alive)?;
                Ok(RequestId::Connect)
            })
    }

    pub(crate) fn send_disconnect(
        &self,
        responder: Option<Responder>,
    ) -> Result<RequestId, EngineError> {
        self.pending
            .register_with(PendingRequest::new(responder), || {
                self.engine.disconnect()?;
                Ok(RequestId::Disconnect)
            })
    }

    fn send_publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        entry: PendingRequest,
    ) -> Result<RequestId, EngineError> {
        self.pending.register_with(entry, || {
            self.engine
                .publish(topic, payload, qos, retain)
                .map(RequestId::Packet)
        })
    }

    fn send_subscribe(
        &self,
        topic: &str,
        qos: QoS,
        message_callback: SharedMessageCallback,
        ack_callback: Option<SharedAckCallback>,
        entry: PendingRequest,
    ) -> Result<RequestId, EngineError> {
        let entry = entry.with_effect(RegistryEffect::Subscribe {
            topic: topic.to_string(),
            qos,
            message_callback,
            ack_callback,
        });
        self.pending.register_with(entry, || {
            self.engine.subscribe(topic, qos).map(RequestId::Packet)
        })
    }

    /// Re-issues a registry record after a reconnect.
    pub(crate) fn resubscribe(&self, record: &SubscriptionRecord) -> Result<RequestId, EngineError> {
        let entry = PendingRequest::new(record.ack_callback.clone().map(Responder::Callback))
            .resubscribe();
        self.send_subscribe(
            &record.topic,
            record.qos,
            Arc::clone(&record.message_callback),
            record.ack_callback.clone(),
            entry,
        )
    }

    fn send_unsubscribe(&self, topic: &str, entry: PendingRequest) -> Result<RequestId, EngineError> {
        let entry = entry.with_effect(RegistryEffect::Unsubscribe {
            topic: topic.to_string(),
        });
        self.pending.register_with(entry, || {
            self.engine.unsubscribe(topic).map(RequestId::Packet)
        })
    }

    /// Sends `request`, reporting its acknowledgment to `responder`.
    ///
    /// Used for live requests and for requests replayed from the offline queue.
    /// A subscribe request's own ack callback is what its registry record keeps.
    /// The pending entry keeps a copy of the request in case the session drops
    /// before the acknowledgment.
    pub(crate) fn issue(
        &self,
        request: &OfflineRequest,
        responder: Option<Responder>,
    ) -> Result<RequestId, EngineError> {
        let entry = PendingRequest::new(responder).replayable(request.clone());
        match request {
            OfflineRequest::Publish {
                topic,
                payload,
                qos,
                retain,
                ..
            } => self.send_publish(topic, payload, *qos, *retain, entry),
            OfflineRequest::Subscribe {
                topic,
                qos,
                message_callback,
                ack_callback,
            } => self.send_subscribe(
                topic,
                *qos,
                Arc::clone(message_callback),
                ack_callback.clone(),
                entry,
            ),
            OfflineRequest::Unsubscribe { topic, .. } => self.send_unsubscribe(topic, entry),
        }
    }

    /// Finishes a user disconnect without the engine's help. The consumer handles
    /// the produced event like a closed session: it releases `responder`, stops
    /// the network loop and drops outstanding requests.
    pub(crate) fn disconnect_locally(&self, responder: Option<Responder>) -> RequestId {
        self.pending
            .insert(RequestId::Disconnect, PendingRequest::new(responder));
        EventProducer::new(Arc::clone(&self.events)).on_disconnect(0);
        RequestId::Disconnect
    }
}

/// How the caller of an operation wants to hear about its acknowledgment.
enum Caller {
    Async(Option<SharedAckCallback>),
    Blocking(Arc<Completion>),
}

impl Caller {
    fn responder(&self) -> Option<Responder> {
        match self {
            Caller::Async(callback) => callback.clone().map(Responder::Callback),
            Caller::Blocking(completion) => Some(Responder::Waiter(Arc::clone(completion))),
        }
    }

    /// The callback a queued request (or a registry record) keeps. Blocking callers
    /// keep none: they return as soon as their request is queued.
    fn callback(&self) -> Option<SharedAckCallback> {
        match self {
            Caller::Async(callback) => callback.clone(),
            Caller::Blocking(_) => None,
        }
    }
}

/// A persistent MQTT session with offline queueing and automatic recovery.
pub struct MqttCore {
    shared: Arc<Shared>,
    consumer: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl MqttCore {
    /// Creates a client with default settings.
    pub fn new<E>(engine: Arc<E>) -> Result<Self, ClientError>
    where
        E: ProtocolEngine + 'static,
    {
        Self::with_settings(engine, CoreSettings::default())
    }

    /// Creates a client from a validated [`Config`].
    pub fn from_config<E>(engine: Arc<E>, config: &Config) -> Result<Self, ClientError>
    where
        E: ProtocolEngine + 'static,
    {
        Self::with_settings(engine, CoreSettings::from_config(config)?)
    }

    /// Creates a client, binds the engine and starts the background threads.
    pub fn with_settings<E>(engine: Arc<E>, settings: CoreSettings) -> Result<Self, ClientError>
    where
        E: ProtocolEngine + 'static,
    {
        let engine: Arc<dyn ProtocolEngine> = engine;
        let events = Arc::new(EventQueue::default());
        engine.bind(EventProducer::new(Arc::clone(&events)));

        let sleeper = Arc::new(InterruptibleSleeper::default());
        let backoff = BackoffController::with_sleeper(settings.backoff, sleeper.clone());
        let pool = CallbackPool::new(settings.callback_workers)?;
        let (signals, signal_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            state: StateCell::default(),
            registry: SubscriptionRegistry::new(),
            queue: Mutex::new(OfflineQueue::new(
                settings.queue_capacity,
                settings.drop_policy,
            )),
            pending: PendingTable::default(),
            events,
            backoff,
            sleeper,
            engine,
            pool,
            settings: Mutex::new(settings),
            hooks: Mutex::new(Hooks::default()),
            connect_epoch: Mutex::new(0),
            signals,
        });

        let consumer = thread::Builder::new()
            .name("tidewatch-events".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || consumer::run(shared)
            })?;

        let supervisor = match thread::Builder::new()
            .name("tidewatch-reconnect".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || supervisor::run(shared, signal_rx)
            }) {
            Ok(handle) => handle,
            Err(e) => {
                shared.events.stop();
                if consumer.join().is_err() {
                    error!("Event consumer panicked during startup rollback");
                }
                return Err(e.into());
            }
        };

        debug!("MQTT core started");
        Ok(Self {
            shared,
            consumer: Some(consumer),
            supervisor: Some(supervisor),
        })
    }

    // ---- configuration ----

    /// Sets the reconnect backoff bounds. `base` must be shorter than `stable`.
    pub fn configure_backoff(
        &self,
        base: Duration,
        max: Duration,
        stable: Duration,
    ) -> Result<(), ClientError> {
        self.configure_backoff_timing(BackoffTiming::new(base, max, stable)?);
        Ok(())
    }

    pub fn configure_backoff_timing(&self, timing: BackoffTiming) {
        self.shared.backoff.reconfigure(timing);
        self.shared.settings.lock().backoff = timing;
    }

    /// Resizes the offline queue. Requests that no longer fit are discarded
    /// according to `policy`.
    pub fn configure_offline_queue(&self, capacity: i64, policy: DropPolicy) {
        self.shared.queue.lock().reconfigure(capacity, policy);
        let mut settings = self.shared.settings.lock();
        settings.queue_capacity = capacity;
        settings.drop_policy = policy;
    }

    pub fn configure_draining_interval(&self, interval: Duration) {
        self.shared.settings.lock().draining_interval = interval;
    }

    /// Sets the draining pace as requests per second.
    pub fn configure_draining_frequency(&self, hz: f64) -> Result<(), ClientError> {
        if !(hz.is_finite() && hz > 0.0) {
            return Err(ClientError::InvalidArgument(format!(
                "Draining frequency must be a positive number, got {hz}"
            )));
        }
        self.configure_draining_interval(Duration::from_secs_f64(1.0 / hz));
        Ok(())
    }

    pub fn configure_connect_disconnect_timeout(&self, timeout: Duration) {
        self.shared.settings.lock().connect_disconnect_timeout = timeout;
    }

    pub fn configure_operation_timeout(&self, timeout: Duration) {
        self.shared.settings.lock().operation_timeout = timeout;
    }

    /// Keep-alive sent with the next CONNECT.
    pub fn configure_keep_alive(&self, keep_alive: Duration) {
        self.shared.settings.lock().keep_alive = keep_alive;
    }

    pub fn settings(&self) -> CoreSettings {
        self.shared.settings.lock().clone()
    }

    // ---- hooks ----

    /// Called each time a CONNACK accepts the session.
    pub fn on_online<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.hooks.lock().online = Some(Arc::new(hook));
    }

    /// Called each time an accepted session ends.
    pub fn on_offline<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.hooks.lock().offline = Some(Arc::new(hook));
    }

    /// Observes every inbound message, in addition to its topic's handler.
    pub fn on_message<C>(&self, callback: C)
    where
        C: MessageCallback + 'static,
    {
        self.shared.hooks.lock().message = Some(Arc::new(callback));
    }

    /// Replaces the default handler (a warning log) for messages on unknown topics.
    pub fn on_unhandled_message<C>(&self, callback: C)
    where
        C: MessageCallback + 'static,
    {
        self.shared.hooks.lock().unhandled = Some(Arc::new(callback));
    }

    // ---- inspection ----

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Blocks until `predicate` accepts the state or `timeout` elapses, returning
    /// the last state seen.
    pub fn wait_for_state<F>(&self, timeout: Duration, predicate: F) -> ConnectionState
    where
        F: FnMut(ConnectionState) -> bool,
    {
        self.shared.state.wait_for(timeout, predicate)
    }

    /// Number of requests parked in the offline queue.
    pub fn queued_requests(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Topics currently in the subscription registry.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.registry.topics()
    }

    // ---- asynchronous API ----

    /// Starts a connection. Accepted from `Idle`, `AbnormalDisconnect` and
    /// `UserDisconnect`; the CONNACK is reported to `ack_callback`.
    pub fn connect_async(
        &self,
        ack_callback: Option<SharedAckCallback>,
    ) -> Result<RequestId, ClientError> {
        self.connect_with(Caller::Async(ack_callback))
    }

    /// Ends the session on purpose. Stops reconnecting until the next `connect`.
    pub fn disconnect_async(
        &self,
        ack_callback: Option<SharedAckCallback>,
    ) -> Result<RequestId, ClientError> {
        self.disconnect_with(Caller::Async(ack_callback))
    }

    pub fn publish_async(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
        ack_callback: Option<SharedAckCallback>,
    ) -> Result<RequestId, ClientError> {
        self.publish_with(topic, payload.into(), qos, retain, Caller::Async(ack_callback))
    }

    /// Subscribes to `topic`. Once the broker grants it, the subscription is
    /// recorded and replayed after every reconnect.
    pub fn subscribe_async(
        &self,
        topic: &str,
        qos: QoS,
        message_callback: SharedMessageCallback,
        ack_callback: Option<SharedAckCallback>,
    ) -> Result<RequestId, ClientError> {
        self.subscribe_with(topic, qos, message_callback, Caller::Async(ack_callback))
    }

    pub fn unsubscribe_async(
        &self,
        topic: &str,
        ack_callback: Option<SharedAckCallback>,
    ) -> Result<RequestId, ClientError> {
        self.unsubscribe_with(topic, Caller::Async(ack_callback))
    }

    // ---- blocking API ----

    /// Connects and waits for the CONNACK, returning its return code.
    pub fn connect(&self) -> Result<u8, ClientError> {
        let completion = Completion::new();
        let id = self.connect_with(Caller::Blocking(Arc::clone(&completion)))?;
        let timeout = self.shared.settings.lock().connect_disconnect_timeout;
        let ack = self.await_ack(RequestKind::Connect, id, &completion, timeout)?;
        Ok(ack.map_or(0, |ack| ack.return_code()))
    }

    /// Disconnects and waits until the session is torn down.
    pub fn disconnect(&self) -> Result<u8, ClientError> {
        let completion = Completion::new();
        let id = self.disconnect_with(Caller::Blocking(Arc::clone(&completion)))?;
        let timeout = self.shared.settings.lock().connect_disconnect_timeout;
        let ack = self.await_ack(RequestKind::Disconnect, id, &completion, timeout)?;
        Ok(ack.map_or(0, |ack| ack.return_code()))
    }

    /// Publishes and waits for the acknowledgment.
    ///
    /// Returns `Ok(true)` once acknowledged, `Ok(false)` if the request was queued
    /// for replay.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, ClientError> {
        let completion = Completion::new();
        let id = self.publish_with(
            topic,
            payload.into(),
            qos,
            retain,
            Caller::Blocking(Arc::clone(&completion)),
        )?;
        let timeout = self.shared.settings.lock().operation_timeout;
        Ok(self
            .await_ack(RequestKind::Publish, id, &completion, timeout)?
            .is_some())
    }

    /// Subscribes and waits for the SUBACK.
    ///
    /// Returns the broker's answer, or `None` if the request was queued for replay.
    pub fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        message_callback: SharedMessageCallback,
    ) -> Result<Option<SubscribeReturn>, ClientError> {
        let completion = Completion::new();
        let id = self.subscribe_with(
            topic,
            qos,
            message_callback,
            Caller::Blocking(Arc::clone(&completion)),
        )?;
        let timeout = self.shared.settings.lock().operation_timeout;
        let ack = self.await_ack(RequestKind::Subscribe, id, &completion, timeout)?;
        Ok(ack.map(|ack| match ack {
            AckData::Subscribed(granted) => granted,
            _ => SubscribeReturn::Failure,
        }))
    }

    /// Unsubscribes and waits for the UNSUBACK. `Ok(false)` means queued.
    pub fn unsubscribe(&self, topic: &str) -> Result<bool, ClientError> {
        let completion = Completion::new();
        let id = self.unsubscribe_with(topic, Caller::Blocking(Arc::clone(&completion)))?;
        let timeout = self.shared.settings.lock().operation_timeout;
        Ok(self
            .await_ack(RequestKind::Unsubscribe, id, &completion, timeout)?
            .is_some())
    }

    // ---- routing ----

    fn connect_with(&self, caller: Caller) -> Result<RequestId, ClientError> {
        let mut epoch = self.shared.connect_epoch.lock();
        let state = self.shared.state.get();
        if !state.accepts_connect() {
            return Err(ClientError::InvalidState {
                operation: RequestKind::Connect,
                state,
            });
        }

        self.shared.state.set(ConnectionState::Connecting);
        *epoch += 1;
        info!("Connecting to broker");
        self.shared.send_connect(caller.responder()).map_err(|e| {
            warn!("Failed to send CONNECT: {}", e);
            self.shared.state.set(ConnectionState::Idle);
            ClientError::Connect(e)
        })
    }

    fn disconnect_with(&self, caller: Caller) -> Result<RequestId, ClientError> {
        let mut epoch = self.shared.connect_epoch.lock();
        *epoch += 1;
        let previous = self.shared.state.get();
        self.shared.state.set(ConnectionState::UserDisconnect);
        self.shared.backoff.stop_stability_timer();
        info!("Disconnecting from broker");

        if !previous.is_connected() {
            debug!("No live session while {}, disconnecting locally", previous);
            return Ok(self.shared.disconnect_locally(caller.responder()));
        }
        match self.shared.send_disconnect(caller.responder()) {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("Failed to send DISCONNECT, closing the session locally: {}", e);
                Ok(self.shared.disconnect_locally(caller.responder()))
            }
        }
    }

    fn publish_with(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        caller: Caller,
    ) -> Result<RequestId, ClientError> {
        let request = OfflineRequest::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            ack_callback: caller.callback(),
        };
        self.route(request, caller)
    }

    fn subscribe_with(
        &self,
        topic: &str,
        qos: QoS,
        message_callback: SharedMessageCallback,
        caller: Caller,
    ) -> Result<RequestId, ClientError> {
        let request = OfflineRequest::Subscribe {
            topic: topic.to_string(),
            qos,
            message_callback,
            ack_callback: caller.callback(),
        };
        self.route(request, caller)
    }

    fn unsubscribe_with(&self, topic: &str, caller: Caller) -> Result<RequestId, ClientError> {
        let request = OfflineRequest::Unsubscribe {
            topic: topic.to_string(),
            ack_callback: caller.callback(),
        };
        self.route(request, caller)
    }

    /// Sends a request or parks it, depending on the connection state.
    ///
    /// The state is read under the queue lock, which the consumer also holds when
    /// it declares the session `Stable`, so a request is never parked behind a
    /// queue that has already been drained.
    fn route(&self, request: OfflineRequest, caller: Caller) -> Result<RequestId, ClientError> {
        let kind = request.kind();
        check_topic(&request)?;

        let mut queue = self.shared.queue.lock();
        let state = self.shared.state.get();

        if !state.is_recovering() {
            return self
                .shared
                .issue(&request, caller.responder())
                .map_err(|e| ClientError::send_failure(kind, e));
        }

        let topic = request.topic().to_string();
        match queue.append(request) {
            AppendResult::Success => {
                debug!(
                    "Queued {} request for {} while {} ({} queued)",
                    kind,
                    topic,
                    state,
                    queue.len()
                );
                Ok(RequestId::Queued)
            }
            AppendResult::FailureQueueFull => {
                warn!("Offline queue full while queueing {} request for {}", kind, topic);
                Err(ClientError::QueueFull(kind))
            }
            AppendResult::FailureQueueDisabled => Err(ClientError::QueueDisabled(kind)),
        }
    }

    fn await_ack(
        &self,
        kind: RequestKind,
        id: RequestId,
        completion: &Completion,
        timeout: Duration,
    ) -> Result<Option<AckData>, ClientError> {
        if id == RequestId::Queued {
            return Ok(None);
        }
        match completion.wait(timeout) {
            Some(AckData::Discarded) => Err(ClientError::send_failure(
                kind,
                EngineError::Rejected("request discarded before reaching the broker".into()),
            )),
            Some(ack) => Ok(Some(ack)),
            None => Err(ClientError::timeout(kind, timeout)),
        }
    }
}

/// Rejects topics the broker would refuse: a publish needs a concrete topic name,
/// subscribe and unsubscribe need a well-formed filter.
fn check_topic(request: &OfflineRequest) -> Result<(), ClientError> {
    let topic = request.topic();
    let valid = match request {
        OfflineRequest::Publish { .. } => !topic.is_empty() && rumqttc::valid_topic(topic),
        OfflineRequest::Subscribe { .. } | OfflineRequest::Unsubscribe { .. } => {
            rumqttc::valid_filter(topic)
        }
    };
    if valid {
        Ok(())
    } else {
        Err(ClientError::InvalidArgument(format!(
            "Cannot {} invalid topic {:?}",
            request.kind(),
            topic
        )))
    }
}

impl Drop for MqttCore {
    fn drop(&mut self) {
        debug!("Shutting down MQTT core");
        let _ = self.shared.signals.send(Signal::Shutdown);
        self.shared.sleeper.interrupt();
        self.shared.events.stop();

        for (name, handle) in [
            ("event consumer", self.consumer.take()),
            ("reconnect supervisor", self.supervisor.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("MQTT {} thread panicked", name);
                }
            }
        }

        self.shared.backoff.stop_stability_timer();
        self.shared.engine.stop_background_io();
    }
}

impl std::fmt::Debug for MqttCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttCore")
            .field("state", &self.shared.state.get())
            .field("subscriptions", &self.shared.registry.len())
            .field("queued", &self.shared.queue.lock().len())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        callback::AckData,
        message::Message,
        testing::{eventually, Call, MockEngine},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn start(engine: &Arc<MockEngine>) -> MqttCore {
        let core = MqttCore::new(Arc::clone(engine)).unwrap();
        core.configure_draining_interval(Duration::from_millis(5));
        core
    }

    fn is(expected: ConnectionState) -> impl FnMut(ConnectionState) -> bool {
        move |state| state == expected
    }

    fn noop() -> SharedMessageCallback {
        Arc::new(|_: &Message| {})
    }

    fn counting() -> (Arc<AtomicUsize>, SharedMessageCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let callback: SharedMessageCallback = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_: &Message| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, callback)
    }

    fn recording() -> (
        crossbeam_channel::Receiver<(RequestId, AckData)>,
        SharedAckCallback,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let callback: SharedAckCallback = Arc::new(move |id: RequestId, ack: AckData| {
            let _ = tx.send((id, ack));
        });
        (rx, callback)
    }

    /// Identifier of the most recent request the engine saw for `topic`.
    fn last_id(engine: &MockEngine, topic: &str) -> u32 {
        engine
            .calls()
            .iter()
            .rev()
            .find_map(|call| match call {
                Call::Publish { topic: t, id, .. }
                | Call::Subscribe { topic: t, id, .. }
                | Call::Unsubscribe { topic: t, id }
                    if t == topic =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap()
    }

    fn published_topics(engine: &MockEngine) -> Vec<String> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish { topic, .. } => Some(topic),
                _ => None,
            })
            .collect()
    }

    fn go_stable(core: &MqttCore, engine: &MockEngine) {
        core.connect_async(None).unwrap();
        engine.connack(0);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
    }

    #[test]
    fn test_sync_connect_and_publish() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);

        assert_eq!(core.connect().unwrap(), 0);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert!(core
            .publish("gateway/status", "online", QoS::AtLeastOnce, true)
            .unwrap());
        assert_eq!(
            engine.calls().last(),
            Some(&Call::Publish {
                topic: "gateway/status".into(),
                payload: b"online".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
                id: 1,
            })
        );
    }

    #[test]
    fn test_requests_queue_while_connecting_and_drain_in_order() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);

        core.connect_async(None).unwrap();
        assert_eq!(core.state(), ConnectionState::Connecting);
        for topic in ["a", "b", "c"] {
            assert_eq!(
                core.publish_async(topic, "x", QoS::AtLeastOnce, false, None)
                    .unwrap(),
                RequestId::Queued
            );
        }
        assert_eq!(core.queued_requests(), 3);
        assert!(published_topics(&engine).is_empty());

        engine.connack(0);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert_eq!(published_topics(&engine), vec!["a", "b", "c"]);
        assert_eq!(core.queued_requests(), 0);
    }

    #[test]
    fn test_blocking_publish_returns_false_when_queued() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);

        core.connect_async(None).unwrap();
        assert!(!core.publish("t", "x", QoS::AtLeastOnce, false).unwrap());
        assert_eq!(core.queued_requests(), 1);
    }

    #[test]
    fn test_resubscribes_after_reconnect_before_stable() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);

        for topic in ["t1", "t2"] {
            core.subscribe_async(topic, QoS::AtLeastOnce, noop(), None)
                .unwrap();
            engine.suback(
                last_id(&engine, topic),
                SubscribeReturn::Granted(QoS::AtLeastOnce),
            );
        }
        assert!(eventually(WAIT, || core.subscriptions().len() == 2));

        engine.drop_connection(1);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::AbnormalDisconnect)),
            ConnectionState::AbnormalDisconnect
        );

        core.connect_async(None).unwrap();
        engine.connack(0);
        let subscribes = engine.wait_for_calls(4, WAIT, |c| matches!(c, Call::Subscribe { .. }));
        assert_eq!(subscribes.len(), 4);
        assert_eq!(core.state(), ConnectionState::Resubscribing);

        let replayed: Vec<u32> = subscribes[2..]
            .iter()
            .map(|call| match call {
                Call::Subscribe { id, .. } => *id,
                _ => unreachable!(),
            })
            .collect();

        engine.suback(replayed[0], SubscribeReturn::Granted(QoS::AtLeastOnce));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(core.state(), ConnectionState::Resubscribing);

        engine.suback(replayed[1], SubscribeReturn::Granted(QoS::AtLeastOnce));
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert_eq!(core.subscriptions(), vec!["t1", "t2"]);
        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 2);
    }

    #[test]
    fn test_queued_subscribe_is_replayed_and_recorded() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        let (acks, on_ack) = recording();

        core.connect_async(None).unwrap();
        assert_eq!(
            core.subscribe_async("late/topic", QoS::AtMostOnce, noop(), Some(on_ack))
                .unwrap(),
            RequestId::Queued
        );
        engine.connack(0);

        engine.wait_for_calls(1, WAIT, |c| matches!(c, Call::Subscribe { .. }));
        let id = last_id(&engine, "late/topic");
        engine.suback(id, SubscribeReturn::Granted(QoS::AtMostOnce));

        assert_eq!(
            acks.recv_timeout(WAIT).unwrap(),
            (
                RequestId::Packet(id),
                AckData::Subscribed(SubscribeReturn::Granted(QoS::AtMostOnce))
            )
        );
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert_eq!(core.subscriptions(), vec!["late/topic"]);
    }

    #[test]
    fn test_sync_timeout_leaves_request_in_flight() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        core.configure_operation_timeout(Duration::from_millis(30));

        let err = core
            .publish("slow", "x", QoS::AtLeastOnce, false)
            .unwrap_err();
        assert!(matches!(err, ClientError::PublishTimeout(_)));

        let id = RequestId::Packet(last_id(&engine, "slow"));
        assert!(core.shared.pending.contains(id));

        engine.puback(last_id(&engine, "slow"));
        assert!(eventually(WAIT, || !core.shared.pending.contains(id)));

        engine.puback(last_id(&engine, "slow"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(core.state(), ConnectionState::Stable);
    }

    #[test]
    fn test_ack_callback_runs_once() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        let (acks, on_ack) = recording();

        let id = core
            .publish_async("t", "x", QoS::AtLeastOnce, false, Some(on_ack))
            .unwrap();
        let RequestId::Packet(packet) = id else {
            panic!("expected a packet id, got {id}");
        };
        engine.puback(packet);
        engine.puback(packet);

        assert_eq!(acks.recv_timeout(WAIT).unwrap(), (id, AckData::Published));
        assert!(acks.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_connect_send_failure_reverts_to_idle() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        engine.set_fail_sends(true);

        let err = core.connect_async(None).unwrap_err();
        assert!(matches!(err, ClientError::Connect(EngineError::NotConnected)));
        assert_eq!(core.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_connect_rejected_while_stable() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));

        let err = core.connect_async(None).unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidState {
                operation: RequestKind::Connect,
                state: ConnectionState::Stable,
            }
        ));
    }

    #[test]
    fn test_refused_connack_returns_to_idle_without_retrying() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        let (acks, on_ack) = recording();

        core.connect_async(Some(on_ack)).unwrap();
        engine.connack(5);
        engine.drop_connection(5);

        assert_eq!(
            acks.recv_timeout(WAIT).unwrap(),
            (RequestId::Connect, AckData::Connected(5))
        );
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Idle)),
            ConnectionState::Idle
        );
        assert!(eventually(WAIT, || engine
            .count(|c| matches!(c, Call::StopIo))
            == 1));

        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(core.state(), ConnectionState::Idle);
        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 1);

        core.connect_async(None).unwrap();
        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 2);
    }

    #[test]
    fn test_user_disconnect_stops_reconnecting() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));

        assert_eq!(core.disconnect().unwrap(), 0);
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert!(eventually(WAIT, || engine
            .count(|c| matches!(c, Call::StopIo))
            == 1));

        engine.drop_connection(1);
        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 1);
    }

    #[test]
    fn test_supervisor_reconnects_after_connection_loss() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        let online = Arc::new(AtomicUsize::new(0));
        let offline = Arc::new(AtomicUsize::new(0));
        {
            let online = Arc::clone(&online);
            core.on_online(move || {
                online.fetch_add(1, Ordering::SeqCst);
            });
            let offline = Arc::clone(&offline);
            core.on_offline(move || {
                offline.fetch_add(1, Ordering::SeqCst);
            });
        }

        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));

        engine.drop_connection(1);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::AbnormalDisconnect)),
            ConnectionState::AbnormalDisconnect
        );
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );

        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 2);
        assert!(eventually(WAIT, || online.load(Ordering::SeqCst) == 2));
        assert_eq!(offline.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_offline_queue_admission_errors() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        core.configure_offline_queue(1, DropPolicy::DropNewest);
        core.connect_async(None).unwrap();

        assert_eq!(
            core.publish_async("a", "1", QoS::AtMostOnce, false, None)
                .unwrap(),
            RequestId::Queued
        );
        assert!(matches!(
            core.publish_async("b", "2", QoS::AtMostOnce, false, None),
            Err(ClientError::QueueFull(RequestKind::Publish))
        ));

        core.configure_offline_queue(0, DropPolicy::DropNewest);
        assert_eq!(core.queued_requests(), 0);
        assert!(matches!(
            core.subscribe_async("c", QoS::AtMostOnce, noop(), None),
            Err(ClientError::QueueDisabled(RequestKind::Subscribe))
        ));
    }

    #[test]
    fn test_messages_route_to_subscription_or_unhandled() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        let (routed, on_topic) = counting();
        let (unhandled, on_unhandled) = counting();
        let (observed, on_any) = counting();
        core.on_unhandled_message(move |m: &Message| on_unhandled.on_message(m));
        core.on_message(move |m: &Message| on_any.on_message(m));

        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));
        assert_eq!(
            core.subscribe("sensors/temp", QoS::AtMostOnce, on_topic)
                .unwrap(),
            Some(SubscribeReturn::Granted(QoS::AtMostOnce))
        );

        engine.deliver("sensors/temp", b"21.5");
        engine.deliver("sensors/humidity", b"40");

        assert!(eventually(WAIT, || routed.load(Ordering::SeqCst) == 1
            && unhandled.load(Ordering::SeqCst) == 1
            && observed.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_rejected_subscription_is_not_recorded() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        let (acks, on_ack) = recording();

        core.subscribe_async("forbidden", QoS::AtLeastOnce, noop(), Some(on_ack))
            .unwrap();
        engine.suback(last_id(&engine, "forbidden"), SubscribeReturn::Failure);

        let (_, ack) = acks.recv_timeout(WAIT).unwrap();
        assert_eq!(ack, AckData::Subscribed(SubscribeReturn::Failure));
        assert!(core.subscriptions().is_empty());
    }

    #[test]
    fn test_unsubscribe_removes_record() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));

        core.subscribe("t", QoS::AtMostOnce, noop()).unwrap();
        assert_eq!(core.subscriptions(), vec!["t"]);
        assert!(core.unsubscribe("t").unwrap());
        assert!(core.subscriptions().is_empty());
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);

        assert!(matches!(
            core.publish_async("", "x", QoS::AtMostOnce, false, None),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(core.configure_draining_frequency(0.0).is_err());
        assert!(core.configure_draining_frequency(f64::NAN).is_err());
        core.configure_draining_frequency(4.0).unwrap();
        assert_eq!(core.settings().draining_interval, Duration::from_millis(250));

        assert!(matches!(
            core.configure_backoff(
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(10)
            ),
            Err(ClientError::Backoff(_))
        ));
    }

    #[test]
    fn test_from_config_validates() {
        let engine = Arc::new(MockEngine::new());
        let mut config = Config::default();
        config.session.draining_interval_ms = 50;
        let core = MqttCore::from_config(Arc::clone(&engine), &config).unwrap();
        assert_eq!(core.settings().draining_interval, Duration::from_millis(50));
        drop(core);

        config.backoff.base_reconnect_secs = 40;
        assert!(matches!(
            MqttCore::from_config(engine, &config),
            Err(ClientError::ConfigError(_))
        ));
    }

    #[test]
    fn test_malformed_topics_rejected_before_queueing() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        core.connect_async(None).unwrap();

        assert!(matches!(
            core.publish_async("alerts/#", "x", QoS::AtLeastOnce, false, None),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            core.publish_async("sensors/+/temp", "x", QoS::AtMostOnce, false, None),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            core.subscribe_async("alerts/#/fire", QoS::AtMostOnce, noop(), None),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            core.unsubscribe_async("", None),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(core.queued_requests(), 0);

        assert_eq!(
            core.subscribe_async("alerts/#", QoS::AtMostOnce, noop(), None)
                .unwrap(),
            RequestId::Queued
        );
    }

    #[test]
    fn test_wildcard_subscriptions_receive_messages() {
        let engine = Arc::new(MockEngine::auto_ack());
        let core = start(&engine);
        let (temps, on_temp) = counting();
        let (alerts, on_alert) = counting();
        let (unhandled, on_unhandled) = counting();
        core.on_unhandled_message(move |m: &Message| on_unhandled.on_message(m));

        core.connect().unwrap();
        core.wait_for_state(WAIT, is(ConnectionState::Stable));
        core.subscribe("sensors/+/temp", QoS::AtMostOnce, on_temp)
            .unwrap();
        core.subscribe("alerts/#", QoS::AtLeastOnce, on_alert).unwrap();

        engine.deliver("sensors/kitchen/temp", b"21.5");
        engine.deliver("alerts/fire/floor2", b"evacuate");
        engine.deliver("sensors/kitchen/humidity", b"40");

        assert!(eventually(WAIT, || temps.load(Ordering::SeqCst) == 1
            && alerts.load(Ordering::SeqCst) == 1
            && unhandled.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_rejected_replay_is_discarded_and_draining_continues() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        engine.reject_topic("refused/topic");
        let (acks, on_ack) = recording();

        core.connect_async(None).unwrap();
        for topic in ["refused/topic", "fine/topic"] {
            assert_eq!(
                core.publish_async(topic, "x", QoS::AtLeastOnce, false, Some(Arc::clone(&on_ack)))
                    .unwrap(),
                RequestId::Queued
            );
        }
        engine.connack(0);

        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert_eq!(published_topics(&engine), vec!["fine/topic"]);
        assert_eq!(core.queued_requests(), 0);
        assert_eq!(
            acks.recv_timeout(WAIT).unwrap(),
            (RequestId::Queued, AckData::Discarded)
        );
    }

    #[test]
    fn test_busy_engine_replay_is_retried() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);

        core.connect_async(None).unwrap();
        core.publish_async("retry/topic", "x", QoS::AtLeastOnce, false, None)
            .unwrap();
        engine.set_fail_sends(true);
        engine.connack(0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(core.state(), ConnectionState::Draining);
        assert_eq!(core.queued_requests(), 1);

        engine.set_fail_sends(false);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert_eq!(published_topics(&engine), vec!["retry/topic"]);
    }

    #[test]
    fn test_in_flight_publish_replayed_on_next_session() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        let (acks, on_ack) = recording();

        let first = core
            .publish_async("telemetry", "21.5", QoS::AtLeastOnce, false, Some(on_ack))
            .unwrap();
        engine.drop_connection(1);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::AbnormalDisconnect)),
            ConnectionState::AbnormalDisconnect
        );
        assert_eq!(core.queued_requests(), 1);
        assert!(!core.shared.pending.contains(first));

        core.connect_async(None).unwrap();
        engine.connack(0);
        let publishes = engine.wait_for_calls(2, WAIT, |c| matches!(c, Call::Publish { .. }));
        assert_eq!(publishes.len(), 2);
        let replayed = last_id(&engine, "telemetry");
        assert_ne!(RequestId::Packet(replayed), first);
        engine.puback(replayed);

        assert_eq!(
            acks.recv_timeout(WAIT).unwrap(),
            (RequestId::Packet(replayed), AckData::Published)
        );
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::Stable)),
            ConnectionState::Stable
        );
        assert!(eventually(WAIT, || core.shared.pending.len() == 0));
    }

    #[test]
    fn test_in_flight_request_discarded_when_queue_disabled() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        core.configure_offline_queue(0, DropPolicy::DropNewest);
        let (acks, on_ack) = recording();

        let id = core
            .subscribe_async("alerts/#", QoS::AtLeastOnce, noop(), Some(on_ack))
            .unwrap();
        engine.drop_connection(1);

        assert_eq!(acks.recv_timeout(WAIT).unwrap(), (id, AckData::Discarded));
        assert_eq!(core.queued_requests(), 0);
        assert!(core.subscriptions().is_empty());
    }

    #[test]
    fn test_disconnect_while_reconnecting_finishes_locally() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);

        engine.drop_connection(1);
        assert_eq!(
            core.wait_for_state(WAIT, is(ConnectionState::AbnormalDisconnect)),
            ConnectionState::AbnormalDisconnect
        );
        engine.set_fail_sends(true);

        assert_eq!(core.disconnect().unwrap(), 0);
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert!(eventually(WAIT, || engine
            .count(|c| matches!(c, Call::StopIo))
            == 1));
        assert_eq!(engine.count(|c| matches!(c, Call::Disconnect)), 0);

        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert_eq!(engine.count(|c| matches!(c, Call::Connect)), 1);
    }

    #[test]
    fn test_failed_disconnect_send_still_tears_down() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        go_stable(&core, &engine);
        engine.set_fail_sends(true);

        assert_eq!(core.disconnect().unwrap(), 0);
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert!(eventually(WAIT, || engine
            .count(|c| matches!(c, Call::StopIo))
            == 1));
    }

    #[test]
    fn test_connack_after_user_disconnect_stays_offline() {
        let engine = Arc::new(MockEngine::new());
        let core = start(&engine);
        let online = Arc::new(AtomicUsize::new(0));
        {
            let online = Arc::clone(&online);
            core.on_online(move || {
                online.fetch_add(1, Ordering::SeqCst);
            });
        }

        core.connect_async(None).unwrap();
        assert_eq!(
            core.disconnect_async(None).unwrap(),
            RequestId::Disconnect
        );
        engine.connack(0);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(core.state(), ConnectionState::UserDisconnect);
        assert_eq!(online.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_stops_background_io() {
        let engine = Arc::new(MockEngine::new());
        drop(start(&engine));
        assert_eq!(engine.count(|c| matches!(c, Call::StopIo)), 1);
    }
}
