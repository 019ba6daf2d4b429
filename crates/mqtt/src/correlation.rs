//! Pending-request correlation table.
//!
//! Every request handed to the engine gets an entry keyed by its [`RequestId`].
//! The event consumer takes the entry out when the matching acknowledgment is
//! dispatched, so each entry completes at most once; an ack with no entry (late,
//! duplicate, or never issued) finds nothing and is dropped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{
    callback::{AckCallback, AckData, SharedAckCallback, SharedMessageCallback},
    engine::EngineError,
    event::RequestId,
    message::QoS,
    queue::OfflineRequest,
};

/// One-shot handle a blocking caller waits on.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    slot: Mutex<Option<AckData>>,
    done: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn complete(&self, ack: AckData) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(ack);
            self.done.notify_all();
        }
    }

    /// Waits up to `timeout` for the acknowledgment.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<AckData> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            let _ = self.done.wait_while_for(&mut slot, |s| s.is_none(), timeout);
        }
        *slot
    }
}

/// Lets a blocking caller's handle ride along with a request that is replayed
/// after a reconnect.
impl AckCallback for Completion {
    fn on_ack(&self, _id: RequestId, ack: AckData) {
        self.complete(ack);
    }
}

/// Who gets told when a request is acknowledged.
#[derive(Clone)]
pub(crate) enum Responder {
    Callback(SharedAckCallback),
    Waiter(Arc<Completion>),
}

/// Registry change applied when the acknowledgment reports success.
#[derive(Clone, Default)]
pub(crate) enum RegistryEffect {
    #[default]
    None,
    Subscribe {
        topic: String,
        qos: QoS,
        message_callback: SharedMessageCallback,
        ack_callback: Option<SharedAckCallback>,
    },
    Unsubscribe {
        topic: String,
    },
}

#[derive(Clone, Default)]
pub(crate) struct PendingRequest {
    pub(crate) responder: Option<Responder>,
    pub(crate) effect: RegistryEffect,
    /// Re-issued by the consumer after a reconnect; its ack settles resubscription.
    pub(crate) resubscribe: bool,
    /// The request as issued, so it can be sent again if the session drops
    /// before it is acknowledged.
    pub(crate) replay: Option<OfflineRequest>,
}

impl PendingRequest {
    pub(crate) fn new(responder: Option<Responder>) -> Self {
        Self {
            responder,
            ..Self::default()
        }
    }

    pub(crate) fn with_effect(mut self, effect: RegistryEffect) -> Self {
        self.effect = effect;
        self
    }

    pub(crate) fn resubscribe(mut self) -> Self {
        self.resubscribe = true;
        self
    }

    pub(crate) fn replayable(mut self, request: OfflineRequest) -> Self {
        self.replay = Some(request);
        self
    }

    /// The request to queue again after a lost session, carrying this entry's
    /// responder as its ack callback.
    pub(crate) fn into_replay(self) -> Option<OfflineRequest> {
        let request = self.replay?;
        let callback: Option<SharedAckCallback> = match self.responder {
            Some(Responder::Callback(callback)) => Some(callback),
            Some(Responder::Waiter(completion)) => Some(completion as SharedAckCallback),
            None => None,
        };
        Some(request.with_ack_callback(callback))
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingTable {
    /// Sends a request and records it under the identifier the send returns.
    ///
    /// The table lock is held across `send`, so an acknowledgment the engine
    /// produces before `send` returns still finds its entry. On failure nothing
    /// is recorded.
    pub(crate) fn register_with<F>(
        &self,
        request: PendingRequest,
        send: F,
    ) -> Result<RequestId, EngineError>
    where
        F: FnOnce() -> Result<RequestId, EngineError>,
    {
        let mut entries = self.entries.lock();
        let id = send()?;
        if entries.insert(id, request).is_some() {
            debug!("Replaced stale pending entry for {}", id);
        }
        Ok(id)
    }

    /// Records an entry for a request that completes without the engine.
    pub(crate) fn insert(&self, id: RequestId, request: PendingRequest) {
        self.entries.lock().insert(id, request);
    }

    /// Removes and returns the entry for `id`.
    pub(crate) fn take(&self, id: RequestId) -> Option<PendingRequest> {
        self.entries.lock().remove(&id)
    }

    /// Drops every entry, returning how many were discarded.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Removes every entry for a packet request, oldest identifier first.
    ///
    /// Called when a session is lost: the engine's next session cannot
    /// acknowledge packets sent on the previous one.
    pub(crate) fn take_in_flight(&self) -> Vec<(RequestId, PendingRequest)> {
        let mut entries = self.entries.lock();
        let mut ids: Vec<u32> = entries
            .keys()
            .filter_map(|id| match id {
                RequestId::Packet(packet) => Some(*packet),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|packet| {
                let id = RequestId::Packet(packet);
                entries.remove(&id).map(|entry| (id, entry))
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }
}
