//! `rumqttc`-backed protocol engine.
//!
//! [`RumqttEngine`] drives a blocking [`rumqttc::Client`] and runs its
//! [`Connection`] iterator on a dedicated `tidewatch-net` thread. Every `connect`
//! starts a fresh session (client, connection and thread); the previous one is
//! abandoned. rumqttc's own reconnect-on-poll is never used: the network thread
//! exits on the first connection error and reports `on_disconnect`, leaving
//! the retry policy to the session core.
//!
//! rumqttc only reveals the packet identifier of a request once the event loop
//! writes it out. The engine hands the core its own sequential identifiers and a
//! [`PacketTracker`] pairs them with packet identifiers as the matching
//! `Outgoing` events arrive, in the order the requests entered the channel.
//!
//! ```ignore
//! let engine = Arc::new(RumqttEngine::from_config(&config)?);
//! let core = MqttCore::from_config(engine, &config)?;
//! core.connect()?;
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt, fs,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, LastWill, MqttOptions,
    Outgoing, Packet, SubscribeReasonCode, TlsConfiguration, Transport,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    callback::SubscribeReturn,
    config::{Config, TlsConfig},
    engine::{EngineError, ProtocolEngine},
    error::ClientError,
    event::EventProducer,
    message::{Message, QoS},
};

/// Disconnect code for a session closed by our own DISCONNECT.
const CLOSED_LOCALLY: u8 = 0;
/// Disconnect code for a session lost to a network or protocol error.
const CONNECTION_LOST: u8 = 1;
/// Disconnect code for a DISCONNECT sent by the broker.
const CLOSED_BY_BROKER: u8 = 2;

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Inbound QoS 2 can only appear on a broker that ignores the granted level.
fn from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce | rumqttc::QoS::ExactlyOnce => QoS::AtLeastOnce,
    }
}

/// MQTT 3.1.1 CONNACK return code as a byte.
#[allow(unreachable_patterns)]
fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
        _ => u8::MAX,
    }
}

/// Errors that reconnecting cannot fix without a configuration change.
fn is_fatal(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Tls(_) | ConnectionError::NotConnAck(_) => true,
        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::RefusedProtocolVersion
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
        ),
        _ => false,
    }
}

/// Innermost message of an error chain.
fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// What a wire event means to the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notice {
    ConnAck(u8),
    PubAck(u32),
    SubAck(u32, SubscribeReturn),
    UnsubAck(u32),
    Message(Message),
    /// The session is over; the network thread stops after reporting it.
    Closed(u8),
}

impl Notice {
    fn deliver(self, producer: &EventProducer) {
        match self {
            Notice::ConnAck(code) => producer.on_connect(code),
            Notice::PubAck(id) => producer.on_publish_ack(id),
            Notice::SubAck(id, granted) => producer.on_subscribe_ack(id, granted),
            Notice::UnsubAck(id) => producer.on_unsubscribe_ack(id),
            Notice::Message(message) => producer.on_message(message),
            Notice::Closed(code) => producer.on_disconnect(code),
        }
    }
}

/// Pairs engine request identifiers with MQTT packet identifiers.
#[derive(Debug, Default)]
pub(crate) struct PacketTracker {
    /// Requests handed to rumqttc and not written out yet, oldest first.
    unsent: VecDeque<(Sent, u32)>,
    publishes: HashMap<u16, u32>,
    subscribes: HashMap<u16, u32>,
    unsubscribes: HashMap<u16, u32>,
}

impl PacketTracker {
    fn expect(&mut self, sent: Sent, id: u32) {
        self.unsent.push_back((sent, id));
    }

    /// Withdraws a request rumqttc refused to queue.
    fn forget(&mut self, id: u32) {
        self.unsent.retain(|(_, queued)| *queued != id);
    }

    /// Oldest unsent request of the given kind. Requests are written in channel
    /// order, so anything older of the same kind was never going to be written.
    fn written(&mut self, sent: Sent) -> Option<u32> {
        let position = self.unsent.iter().position(|(kind, _)| *kind == sent)?;
        self.unsent.remove(position).map(|(_, id)| id)
    }

    pub(crate) fn translate(&mut self, event: Event) -> Option<Notice> {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                let id = self.written(Sent::Publish)?;
                if pkid == 0 {
                    // QoS 0 is done once it is on the wire.
                    Some(Notice::PubAck(id))
                } else {
                    self.publishes.insert(pkid, id);
                    None
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let id = self.written(Sent::Subscribe)?;
                self.subscribes.insert(pkid, id);
                None
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let id = self.written(Sent::Unsubscribe)?;
                self.unsubscribes.insert(pkid, id);
                None
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                self.reset();
                Some(Notice::Closed(CLOSED_LOCALLY))
            }
            Event::Outgoing(other) => {
                trace!("Outgoing packet: {:?}", other);
                None
            }
            Event::Incoming(Packet::ConnAck(ack)) => Some(Notice::ConnAck(return_code(ack.code))),
            Event::Incoming(Packet::PubAck(ack)) => {
                self.publishes.remove(&ack.pkid).map(Notice::PubAck)
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let id = self.subscribes.remove(&ack.pkid)?;
                let granted = match ack.return_codes.first() {
                    Some(SubscribeReasonCode::Success(qos)) => {
                        SubscribeReturn::Granted(from_rumqttc(*qos))
                    }
                    _ => SubscribeReturn::Failure,
                };
                Some(Notice::SubAck(id, granted))
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                self.unsubscribes.remove(&ack.pkid).map(Notice::UnsubAck)
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let mut message = Message::new(
                    publish.topic,
                    publish.payload.to_vec(),
                    from_rumqttc(publish.qos),
                );
                message.retain = publish.retain;
                Some(Notice::Message(message))
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.reset();
                Some(Notice::Closed(CLOSED_BY_BROKER))
            }
            Event::Incoming(_) => None,
        }
    }

    /// Notices for a connection error. The session ends either way.
    pub(crate) fn fail(&mut self, err: &ConnectionError) -> Vec<Notice> {
        self.reset();
        match err {
            ConnectionError::ConnectionRefused(code) => {
                let code = return_code(*code);
                vec![Notice::ConnAck(code), Notice::Closed(code)]
            }
            _ => vec![Notice::Closed(CONNECTION_LOST)],
        }
    }

    fn reset(&mut self) {
        self.unsent.clear();
        self.publishes.clear();
        self.subscribes.clear();
        self.unsubscribes.clear();
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.unsent.len() + self.publishes.len() + self.subscribes.len() + self.unsubscribes.len()
    }
}

/// One network session: the request handle plus the thread polling it.
struct Session {
    client: Client,
    tracker: Arc<Mutex<PacketTracker>>,
    stop: Arc<AtomicBool>,
    network: JoinHandle<()>,
}

impl Session {
    /// Silences the network thread and closes the request channel, which ends
    /// its event loop. The thread is only joined if it already exited.
    fn close(self) {
        self.stop.store(true, Ordering::Release);
        drop(self.client);
        if self.network.is_finished() && self.network.join().is_err() {
            error!("Network thread exited with a panic");
        }
    }
}

/// [`ProtocolEngine`] over rumqttc's blocking client (MQTT 3.1.1).
pub struct RumqttEngine {
    options: MqttOptions,
    capacity: usize,
    producer: Mutex<Option<EventProducer>>,
    session: Mutex<Option<Session>>,
    next_id: AtomicU32,
}

impl fmt::Debug for RumqttEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RumqttEngine")
            .field("broker", &self.options.broker_address())
            .field("client_id", &self.options.client_id())
            .field("capacity", &self.capacity)
            .field("active", &self.session.lock().is_some())
            .finish()
    }
}

impl RumqttEngine {
    /// Plain TCP engine with default options.
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        capacity: usize,
    ) -> Result<Self, ClientError> {
        let client_id = client_id.into();
        check_client_id(&client_id)?;
        Ok(Self::with_options(
            MqttOptions::new(client_id, host, port),
            capacity,
        ))
    }

    /// Builds the engine from a validated [`Config`], loading TLS material from disk.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let endpoint = &config.endpoint;
        check_client_id(&endpoint.client_id)?;

        let mut options =
            MqttOptions::new(endpoint.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(endpoint.keep_alive());
        options.set_clean_session(endpoint.clean_session);

        if let Some(credentials) = &config.credentials {
            options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone().unwrap_or_default(),
            );
        }

        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone().into_bytes(),
                to_rumqttc(will.qos()),
                will.retain,
            ));
        }

        if let Some(tls) = config.tls.as_ref().filter(|tls| tls.is_enabled()) {
            options.set_transport(build_tls_transport(tls)?);
        }

        info!(
            "MQTT engine configured for {}:{} as {}",
            endpoint.host, endpoint.port, endpoint.client_id
        );
        Ok(Self::with_options(options, endpoint.request_channel_capacity))
    }

    fn with_options(options: MqttOptions, capacity: usize) -> Self {
        Self {
            options,
            capacity: capacity.max(1),
            producer: Mutex::new(None),
            session: Mutex::new(None),
            next_id: AtomicU32::new(0),
        }
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Registers the request with the tracker and hands it to rumqttc under the
    /// tracker lock, so tracker order matches channel order.
    fn send<F>(&self, sent: Sent, request: F) -> Result<u32, EngineError>
    where
        F: FnOnce(&Client) -> Result<(), rumqttc::ClientError>,
    {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(EngineError::NotConnected)?;

        let id = self.next_id();
        let mut tracker = session.tracker.lock();
        tracker.expect(sent, id);
        if let Err(e) = request(&session.client) {
            tracker.forget(id);
            return Err(EngineError::Busy(e.to_string()));
        }
        Ok(id)
    }
}

/// rumqttc reports a malformed topic exactly like a full channel, so topics are
/// checked before they reach it.
fn check_topic(topic: &str, filter: bool) -> Result<(), EngineError> {
    let valid = if filter {
        rumqttc::valid_filter(topic)
    } else {
        !topic.is_empty() && rumqttc::valid_topic(topic)
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::Rejected(format!("invalid topic {topic:?}")))
    }
}

impl ProtocolEngine for RumqttEngine {
    fn bind(&self, producer: EventProducer) {
        *self.producer.lock() = Some(producer);
    }

    fn connect(&self, keep_alive: Duration) -> Result<(), EngineError> {
        let producer = self
            .producer
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Setup("engine is not bound to a session core".into()))?;
        if !keep_alive.is_zero() && keep_alive < Duration::from_secs(1) {
            return Err(EngineError::Setup(format!(
                "keep alive of {keep_alive:?} is below one second"
            )));
        }

        let mut session = self.session.lock();
        if let Some(previous) = session.take() {
            debug!("Abandoning previous network session");
            previous.close();
        }

        let mut options = self.options.clone();
        options.set_keep_alive(keep_alive);
        let (client, connection) = Client::new(options, self.capacity);

        let tracker = Arc::new(Mutex::new(PacketTracker::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let network = {
            let tracker = Arc::clone(&tracker);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("tidewatch-net".into())
                .spawn(move || run_network(connection, tracker, stop, producer))?
        };

        debug!("Connecting to {:?}", self.options.broker_address());
        *session = Some(Session {
            client,
            tracker,
            stop,
            network,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(EngineError::NotConnected)?;
        session
            .client
            .try_disconnect()
            .map_err(|e| EngineError::Busy(e.to_string()))
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u32, EngineError> {
        check_topic(topic, false)?;
        self.send(Sent::Publish, |client| {
            client.try_publish(topic, to_rumqttc(qos), retain, payload.to_vec())
        })
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<u32, EngineError> {
        check_topic(topic, true)?;
        self.send(Sent::Subscribe, |client| {
            client.try_subscribe(topic, to_rumqttc(qos))
        })
    }

    fn unsubscribe(&self, topic: &str) -> Result<u32, EngineError> {
        check_topic(topic, true)?;
        self.send(Sent::Unsubscribe, |client| client.try_unsubscribe(topic))
    }

    fn stop_background_io(&self) {
        if let Some(session) = self.session.lock().take() {
            debug!("Stopping network session");
            session.close();
        }
    }
}

impl Drop for RumqttEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.close();
        }
    }
}

/// Network thread body: polls the connection until the session ends.
fn run_network(
    mut connection: Connection,
    tracker: Arc<Mutex<PacketTracker>>,
    stop: Arc<AtomicBool>,
    producer: EventProducer,
) {
    debug!("Network loop started");
    for notification in connection.iter() {
        if stop.load(Ordering::Acquire) {
            break;
        }

        match notification {
            Ok(event) => {
                let notice = tracker.lock().translate(event);
                if let Some(notice) = notice {
                    let closed = matches!(notice, Notice::Closed(_));
                    notice.deliver(&producer);
                    if closed {
                        break;
                    }
                }
            }
            Err(e) => {
                if is_fatal(&e) {
                    error!("Connection failed: {}", root_cause(&e));
                } else {
                    warn!("Connection lost: {}", root_cause(&e));
                }
                let notices = tracker.lock().fail(&e);
                for notice in notices {
                    notice.deliver(&producer);
                }
                break;
            }
        }
    }
    debug!("Network loop stopped");
}

fn check_client_id(client_id: &str) -> Result<(), ClientError> {
    if client_id.is_empty() || client_id.starts_with(' ') {
        return Err(ClientError::ClientSetup(format!(
            "Invalid client id {client_id:?}"
        )));
    }
    Ok(())
}

fn build_tls_transport(tls: &TlsConfig) -> Result<Transport, ClientError> {
    tls.validate_config()
        .map_err(|e| ClientError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

    let ca = load_file(tls.ca_cert_path.as_deref())?;
    let client_auth = if tls.has_client_auth() {
        let cert = load_file(tls.client_cert_path.as_deref())?;
        let key = load_file(tls.client_key_path.as_deref())?;
        Some((cert, key))
    } else {
        None
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        client_auth,
        alpn: None,
    }))
}

fn load_file(path: Option<&str>) -> Result<Vec<u8>, ClientError> {
    let path = path.ok_or_else(|| ClientError::ClientSetup("TLS file path is not set".into()))?;
    Ok(fs::read(path)?)
}
