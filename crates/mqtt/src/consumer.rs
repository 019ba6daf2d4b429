//! The event consumer thread.
//!
//! A single thread pops [`EventRecord`]s in arrival order and is the only writer of
//! the recovery states. After an accepted CONNACK it walks the session through
//! recovery:
//!
//! 1. `Resubscribing`: every registry record is re-sent, one per draining
//!    interval, until all of them are acknowledged (or failed to send).
//! 2. `Draining`: the offline queue is replayed, one request per interval.
//! 3. `Stable`: once the queue is empty, under its lock; the stability timer starts.
//!
//! A replay the engine refuses for good is discarded and its callback told so;
//! one it is merely too busy for goes back to the head of the queue.
//!
//! When an accepted session is lost, requests still waiting for their
//! acknowledgment move back to the head of the offline queue, since the next
//! session cannot acknowledge packets sent on this one.
//!
//! Pacing uses the event queue's wait deadline rather than sleeping, so acks keep
//! flowing while a recovery step is due. User callbacks never run on this thread;
//! they are handed to the callback pool.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    callback::{AckCallback, AckData, MessageCallback, SubscribeReturn},
    core::Shared,
    correlation::{RegistryEffect, Responder},
    event::{EventKind, EventRecord, Next, RequestId},
    message::Message,
    state::ConnectionState,
    subscription::SubscriptionRecord,
    supervisor::Signal,
};

enum Phase {
    Resubscribing {
        /// Records not sent yet.
        pending: VecDeque<SubscriptionRecord>,
        /// Records sent (or about to be) whose SUBACK has not been dispatched.
        outstanding: usize,
    },
    Draining,
}

struct Recovery {
    phase: Phase,
    next_tick: Instant,
}

impl Recovery {
    /// When the next paced step is due, if there is one to take.
    fn due(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Resubscribing { pending, .. } if pending.is_empty() => None,
            _ => Some(self.next_tick),
        }
    }
}

struct EventConsumer {
    shared: Arc<Shared>,
    recovery: Option<Recovery>,
    /// An accepted session is up; gates the online/offline hooks.
    online: bool,
}

/// Consumer thread body. Returns once the event queue is stopped.
pub(crate) fn run(shared: Arc<Shared>) {
    debug!("Event consumer started");
    EventConsumer {
        shared,
        recovery: None,
        online: false,
    }
    .run();
    debug!("Event consumer stopped");
}

impl EventConsumer {
    fn run(&mut self) {
        loop {
            let due = self.recovery.as_ref().and_then(Recovery::due);
            match self.shared.events.next(due) {
                Next::Event(record) => self.dispatch(record),
                Next::Tick => {}
                Next::Stopped => break,
            }

            let due = self.recovery.as_ref().and_then(Recovery::due);
            if due.is_some_and(|at| Instant::now() >= at) {
                self.tick();
            }
        }
    }

    fn dispatch(&mut self, record: EventRecord) {
        trace!("Dispatching {} event for {}", record.kind.name(), record.id);
        match record.kind {
            EventKind::ConnAck { code } => self.on_connack(code),
            EventKind::Disconnect { code } => self.on_disconnect(code),
            EventKind::PubAck => self.on_ack(record.id, AckData::Published),
            EventKind::SubAck(granted) => self.on_ack(record.id, AckData::Subscribed(granted)),
            EventKind::UnsubAck => self.on_ack(record.id, AckData::Unsubscribed),
            EventKind::Message(message) => self.on_message(message),
        }
    }

    // ---- connection lifecycle ----

    fn on_connack(&mut self, code: u8) {
        self.complete(RequestId::Connect, AckData::Connected(code));

        if code != 0 {
            self.connection_refused(code);
            return;
        }

        let state = self.shared.state.get();
        if state != ConnectionState::Connecting
            || !self.shared.state.set(ConnectionState::Resubscribing)
        {
            debug!("Ignoring CONNACK of an abandoned attempt while {}", state);
            self.recovery = None;
            return;
        }

        info!("Connected to broker");
        self.online = true;
        let hook = self.shared.hooks.lock().online.clone();
        if let Some(hook) = hook {
            self.shared.pool.execute("online", move || hook());
        }

        let records = self.shared.registry.list_records();
        if records.is_empty() {
            self.enter_draining();
            return;
        }

        info!("Resubscribing to {} topics", records.len());
        self.recovery = Some(Recovery {
            phase: Phase::Resubscribing {
                outstanding: records.len(),
                pending: records.into(),
            },
            next_tick: Instant::now(),
        });
    }

    /// A refused CONNECT ends the attempt. Nothing retries until the application
    /// connects again.
    fn connection_refused(&mut self, code: u8) {
        warn!("Broker refused the connection, return code {}", code);
        self.recovery = None;
        {
            let mut epoch = self.shared.connect_epoch.lock();
            if self.shared.state.get() != ConnectionState::Connecting {
                return;
            }
            *epoch += 1;
            self.shared.state.set(ConnectionState::Idle);
        }
        self.shared.backoff.stop_stability_timer();
        self.shared.engine.stop_background_io();
    }

    fn on_disconnect(&mut self, code: u8) {
        // Read before the state changes: an application connect can only follow
        // the transition below, and must supersede the reconnect scheduled here.
        let epoch = *self.shared.connect_epoch.lock();

        if self.online {
            self.online = false;
            let hook = self.shared.hooks.lock().offline.clone();
            if let Some(hook) = hook {
                self.shared.pool.execute("offline", move || hook());
            }
        }
        self.recovery = None;

        match self.shared.state.get() {
            ConnectionState::UserDisconnect => {
                info!("Disconnected from broker");
                self.complete(RequestId::Disconnect, AckData::Disconnected(code));
                self.shared.engine.stop_background_io();
                let dropped = self.shared.pending.clear();
                if dropped > 0 {
                    debug!("Dropped {} unacknowledged requests", dropped);
                }
            }
            ConnectionState::Idle => {
                debug!("Ignoring disconnect (code {}) while idle", code);
            }
            ConnectionState::Connecting => {
                warn!("Connection attempt failed (code {})", code);
                self.shared.backoff.stop_stability_timer();
                self.request_reconnect(epoch);
            }
            previous => {
                warn!("Connection lost while {} (code {})", previous, code);
                self.session_lost();
                self.shared.backoff.stop_stability_timer();
                self.request_reconnect(epoch);
            }
        }
    }

    /// Marks the session lost and moves every request it can no longer
    /// acknowledge back to the head of the offline queue, oldest first.
    ///
    /// Runs under the queue lock, so a request routed while the state still read
    /// as connected is already in the pending table.
    fn session_lost(&self) {
        let mut queue = self.shared.queue.lock();
        self.shared.state.set(ConnectionState::AbnormalDisconnect);

        let mut replays = Vec::new();
        for (id, entry) in self.shared.pending.take_in_flight() {
            // The registry re-issues these on the next session.
            if entry.resubscribe {
                continue;
            }
            if queue.is_disabled() || entry.replay.is_none() {
                warn!("Discarding in-flight request {} of the lost session", id);
                respond(&self.shared, id, entry.responder, AckData::Discarded);
                continue;
            }
            replays.extend(entry.into_replay());
        }

        if !replays.is_empty() {
            info!(
                "Requeued {} unacknowledged requests for the next session",
                replays.len()
            );
            queue.restore_front(replays);
        }
    }

    fn request_reconnect(&self, epoch: u64) {
        if self.shared.signals.send(Signal::Reconnect { epoch }).is_err() {
            debug!("Reconnect supervisor is gone, not reconnecting");
        }
    }

    // ---- acknowledgments ----

    fn on_ack(&mut self, id: RequestId, ack: AckData) {
        let Some(entry) = self.shared.pending.take(id) else {
            debug!("Ignoring late or unknown acknowledgment for {}", id);
            return;
        };

        match (&entry.effect, ack) {
            (
                RegistryEffect::Subscribe {
                    topic,
                    qos,
                    message_callback,
                    ack_callback,
                },
                AckData::Subscribed(SubscribeReturn::Granted(_)),
            ) => self.shared.registry.add_record(
                topic.clone(),
                *qos,
                Arc::clone(message_callback),
                ack_callback.clone(),
            ),
            (RegistryEffect::Subscribe { topic, .. }, AckData::Subscribed(SubscribeReturn::Failure)) => {
                warn!("Broker rejected subscription to {}", topic);
            }
            (RegistryEffect::Unsubscribe { topic }, AckData::Unsubscribed) => {
                self.shared.registry.remove_record(topic);
            }
            _ => {}
        }

        if entry.resubscribe {
            self.settle_resubscribe();
        }
        respond(&self.shared, id, entry.responder, ack);
    }

    /// Takes the entry for `id` and responds to it, if there is one.
    fn complete(&self, id: RequestId, ack: AckData) {
        if let Some(entry) = self.shared.pending.take(id) {
            respond(&self.shared, id, entry.responder, ack);
        }
    }

    // ---- messages ----

    fn on_message(&self, message: Message) {
        let message = Arc::new(message);
        let (observer, unhandled) = {
            let hooks = self.shared.hooks.lock();
            (hooks.message.clone(), hooks.unhandled.clone())
        };

        if let Some(observer) = observer {
            let message = Arc::clone(&message);
            self.shared
                .pool
                .execute("message", move || observer.on_message(&message));
        }

        let handler = self
            .shared
            .registry
            .matching(&message.topic)
            .map(|record| record.message_callback)
            .or(unhandled);
        match handler {
            Some(handler) => self
                .shared
                .pool
                .execute("message", move || handler.on_message(&message)),
            None => warn!(
                "Unhandled message on {} ({} bytes)",
                message.topic,
                message.payload.len()
            ),
        }
    }

    // ---- recovery ----

    fn settle_resubscribe(&mut self) {
        let done = match &mut self.recovery {
            Some(Recovery {
                phase: Phase::Resubscribing {
                    pending,
                    outstanding,
                },
                ..
            }) => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0 && pending.is_empty()
            }
            _ => false,
        };
        if done {
            self.enter_draining();
        }
    }

    fn enter_draining(&mut self) {
        if self.shared.state.set(ConnectionState::Draining) {
            self.recovery = Some(Recovery {
                phase: Phase::Draining,
                next_tick: Instant::now(),
            });
        } else {
            self.recovery = None;
        }
    }

    fn tick(&mut self) {
        let state = self.shared.state.get();
        if !matches!(
            state,
            ConnectionState::Resubscribing | ConnectionState::Draining
        ) {
            self.recovery = None;
            return;
        }

        let interval = self.shared.settings.lock().draining_interval;
        if matches!(
            self.recovery,
            Some(Recovery {
                phase: Phase::Draining,
                ..
            })
        ) {
            self.drain_one(interval);
            return;
        }

        let Some(Recovery {
            phase: Phase::Resubscribing {
                pending,
                outstanding,
            },
            next_tick,
        }) = &mut self.recovery
        else {
            return;
        };

        if let Some(record) = pending.pop_front() {
            debug!("Resubscribing to {}", record.topic);
            if let Err(e) = self.shared.resubscribe(&record) {
                warn!("Failed to resubscribe to {}: {}", record.topic, e);
                *outstanding = outstanding.saturating_sub(1);
            }
        }
        *next_tick = Instant::now() + interval;

        if *outstanding == 0 && pending.is_empty() {
            self.enter_draining();
        }
    }

    /// Replays the oldest queued request, or declares the session stable.
    fn drain_one(&mut self, interval: Duration) {
        let mut queue = self.shared.queue.lock();
        let Some(request) = queue.pop_next() else {
            if self.shared.state.set(ConnectionState::Stable) {
                info!("Connection stable");
                self.shared.backoff.start_stability_timer();
            }
            drop(queue);
            self.recovery = None;
            return;
        };

        let responder = request.ack_callback().map(Responder::Callback);
        match self.shared.issue(&request, responder) {
            Ok(id) => debug!(
                "Replayed queued {} request for {} as {} ({} left)",
                request.kind(),
                request.topic(),
                id,
                queue.len()
            ),
            Err(e) if e.is_transient() => {
                warn!(
                    "Failed to replay queued {} request for {}, retrying: {}",
                    request.kind(),
                    request.topic(),
                    e
                );
                queue.requeue_front(request);
            }
            Err(e) => {
                warn!(
                    "Discarding queued {} request for {}: {}",
                    request.kind(),
                    request.topic(),
                    e
                );
                let responder = request.ack_callback().map(Responder::Callback);
                respond(&self.shared, RequestId::Queued, responder, AckData::Discarded);
            }
        }
        drop(queue);

        if let Some(recovery) = &mut self.recovery {
            recovery.next_tick = Instant::now() + interval;
        }
    }
}

/// Delivers an acknowledgment. Waiters are released inline; callbacks go to the pool.
fn respond(shared: &Shared, id: RequestId, responder: Option<Responder>, ack: AckData) {
    match responder {
        Some(Responder::Waiter(completion)) => completion.complete(ack),
        Some(Responder::Callback(callback)) => {
            shared.pool.execute("ack", move || callback.on_ack(id, ack));
        }
        None => {}
    }
}
