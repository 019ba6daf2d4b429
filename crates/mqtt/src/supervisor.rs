//! Reconnect supervisor.
//!
//! The event consumer never blocks on backoff. When it sees an abnormal
//! disconnect (or a failed connect attempt) it sends a [`Signal::Reconnect`] to
//! this dedicated thread, which sleeps through the backoff controller and then
//! re-issues CONNECT. The supervisor stops retrying as soon as the application
//! disconnects on purpose or the client is dropped.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{backoff::Sleeper, core::Shared, state::ConnectionState};

/// Messages from the event consumer (and shutdown) to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Reconnect, unless a connect or disconnect happened after `epoch` was read.
    Reconnect { epoch: u64 },
    Shutdown,
}

/// A [`Sleeper`] that can be woken early, and stays awake once interrupted.
#[derive(Debug, Default)]
pub(crate) struct InterruptibleSleeper {
    interrupted: Mutex<bool>,
    wake: Condvar,
}

impl InterruptibleSleeper {
    pub(crate) fn interrupt(&self) {
        *self.interrupted.lock() = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        *self.interrupted.lock()
    }
}

impl Sleeper for InterruptibleSleeper {
    fn sleep(&self, duration: Duration) {
        let mut interrupted = self.interrupted.lock();
        if !*interrupted {
            let _ = self
                .wake
                .wait_while_for(&mut interrupted, |stop| !*stop, duration);
        }
    }
}

/// Supervisor thread body. Returns on [`Signal::Shutdown`] or when every sender
/// is gone.
pub(crate) fn run(shared: Arc<Shared>, signals: Receiver<Signal>) {
    debug!("Reconnect supervisor started");

    while let Ok(signal) = signals.recv() {
        let Signal::Reconnect { mut epoch } = signal else {
            break;
        };

        // Collapse a burst of disconnects into one reconnect cycle.
        let mut shutdown = false;
        for queued in signals.try_iter() {
            match queued {
                Signal::Reconnect { epoch: newer } => epoch = epoch.max(newer),
                Signal::Shutdown => shutdown = true,
            }
        }
        if shutdown {
            break;
        }

        reconnect(&shared, epoch);
    }

    debug!("Reconnect supervisor stopped");
}

/// Backs off and reconnects until a CONNECT is sent or reconnecting no longer
/// makes sense.
fn reconnect(shared: &Shared, mut expected_epoch: u64) {
    let mut attempt: u32 = 0;
    loop {
        if shared.sleeper.is_interrupted()
            || shared.state.get() == ConnectionState::UserDisconnect
        {
            return;
        }

        let slept = shared.backoff.back_off();
        if shared.sleeper.is_interrupted() {
            return;
        }

        let mut epoch = shared.connect_epoch.lock();
        if *epoch != expected_epoch {
            debug!("Connection changed during backoff, dropping reconnect attempt");
            return;
        }
        if shared.state.get() == ConnectionState::UserDisconnect {
            return;
        }

        attempt += 1;
        shared.state.set(ConnectionState::Connecting);
        *epoch += 1;
        expected_epoch = *epoch;
        info!(
            "Reconnecting to broker (attempt {}, after {:?} backoff)",
            attempt, slept
        );

        match shared.send_connect(None) {
            Ok(_) => return,
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}
