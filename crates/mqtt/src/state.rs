//! Connection state shared between the orchestrator and the event consumer.
//!
//! A client owns exactly one [`StateCell`]. The event consumer is the only writer
//! for the recovery states; application threads only ever write `Connecting`
//! (when asking for a connection) and `UserDisconnect` (when tearing it down).
//!
//! # Examples
//!
//! ```ignore
//! use tidewatch_mqtt::{ConnectionState, StateCell};
//!
//! let cell = StateCell::default();
//! cell.set(ConnectionState::UserDisconnect);
//! cell.set(ConnectionState::AbnormalDisconnect); // ignored
//! assert_eq!(cell.get(), ConnectionState::UserDisconnect);
//! ```

use std::{
    fmt,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

/// Lifecycle state of an MQTT session.
///
/// The normal cycle is:
/// - `Idle` -> `Connecting` -> `Resubscribing` -> `Draining` -> `Stable`
/// - `Stable` -> `AbnormalDisconnect` -> `Connecting` -> ... (reconnect with backoff)
/// - any -> `UserDisconnect` (explicit teardown, only left through `Connecting`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected, or the last connect request could not be sent.
    Idle,

    /// A CONNECT has been issued and no CONNACK has been processed yet.
    Connecting,

    /// The session dropped without the application asking for it.
    ///
    /// The reconnect supervisor owns recovery from here.
    AbnormalDisconnect,

    /// Connected; previously active subscriptions are being re-issued.
    Resubscribing,

    /// Connected and resubscribed; requests queued while offline are being replayed.
    Draining,

    /// Connected with nothing left to recover. Requests go straight to the engine.
    Stable,

    /// The application disconnected on purpose. Terminal until the next `connect`.
    UserDisconnect,
}

impl ConnectionState {
    /// Returns a short static identifier, handy for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::AbnormalDisconnect => "AbnormalDisconnect",
            ConnectionState::Resubscribing => "Resubscribing",
            ConnectionState::Draining => "Draining",
            ConnectionState::Stable => "Stable",
            ConnectionState::UserDisconnect => "UserDisconnect",
        }
    }

    /// Returns true only in `Stable`, the one state where requests bypass the queue.
    pub fn is_stable(&self) -> bool {
        matches!(self, ConnectionState::Stable)
    }

    /// Returns true while the session is being (re)established.
    ///
    /// Publish, subscribe and unsubscribe requests issued in these states are
    /// parked in the offline queue and replayed once the session is back.
    pub fn is_recovering(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::AbnormalDisconnect
                | ConnectionState::Resubscribing
                | ConnectionState::Draining
        )
    }

    /// Returns true while an accepted session is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Resubscribing | ConnectionState::Draining | ConnectionState::Stable
        )
    }

    /// Returns true in the states from which a new CONNECT may be issued.
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle
                | ConnectionState::AbnormalDisconnect
                | ConnectionState::UserDisconnect
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single authoritative [`ConnectionState`] of a client, guarded by a
/// mutex/condition pair so other threads can wait for a given state.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<ConnectionState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Idle)
    }
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Writes a new state.
    ///
    /// While in `UserDisconnect` only `Connecting` is accepted; every other write
    /// is dropped so a late disconnect notification cannot revive a session the
    /// application closed. Returns whether the write was applied.
    pub fn set(&self, new_state: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::UserDisconnect && new_state != ConnectionState::Connecting {
            debug!(
                "Ignoring transition to {} while in {}",
                new_state,
                ConnectionState::UserDisconnect
            );
            return false;
        }
        if *state != new_state {
            info!("Connection state changed: {} -> {}", *state, new_state);
        }
        *state = new_state;
        self.changed.notify_all();
        true
    }

    /// Blocks until `predicate` holds for the current state or `timeout` elapses.
    ///
    /// Returns the state observed last; callers check it against the predicate.
    pub fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> ConnectionState
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !predicate(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}
