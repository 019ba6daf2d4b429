//! User callback capabilities and the worker pool that runs them.
//!
//! Acknowledgment and message handlers are supplied as trait objects. Plain closures
//! work through blanket impls:
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidewatch_mqtt::{AckData, RequestId, SharedAckCallback};
//!
//! let on_ack: SharedAckCallback = Arc::new(|id: RequestId, ack: AckData| {
//!     println!("{id} acknowledged: {ack:?}");
//! });
//! ```
//!
//! Callbacks never run on the event consumer thread. They are handed to a small
//! fixed [`CallbackPool`] so a slow handler cannot stall event dispatch, and a
//! panicking handler is caught and logged instead of taking a thread down.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, warn};

use crate::{
    event::RequestId,
    message::{Message, QoS},
};

/// Outcome of a single subscribe request as reported in the SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturn {
    Granted(QoS),
    Failure,
}

/// Data carried by an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckData {
    /// CONNACK with its return code (0 = accepted).
    Connected(u8),
    /// Disconnect completed, with the engine's reason code.
    Disconnected(u8),
    Published,
    Subscribed(SubscribeReturn),
    Unsubscribed,
    /// The request was dropped without reaching the broker and will not be retried.
    Discarded,
}

impl AckData {
    /// Return code carried by connect/disconnect acknowledgments, 0 otherwise.
    pub fn return_code(&self) -> u8 {
        match self {
            AckData::Connected(code) | AckData::Disconnected(code) => *code,
            _ => 0,
        }
    }
}

/// Receives the acknowledgment of a request issued through the async API.
pub trait AckCallback: Send + Sync {
    fn on_ack(&self, id: RequestId, ack: AckData);
}

impl<F> AckCallback for F
where
    F: Fn(RequestId, AckData) + Send + Sync,
{
    fn on_ack(&self, id: RequestId, ack: AckData) {
        self(id, ack)
    }
}

/// Receives messages delivered on a subscribed topic.
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, message: &Message);
}

impl<F> MessageCallback for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

pub type SharedAckCallback = Arc<dyn AckCallback>;
pub type SharedMessageCallback = Arc<dyn MessageCallback>;
/// Online/offline notification.
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named threads running user callbacks in submission order.
pub(crate) struct CallbackPool {
    sender: Option<Sender<(&'static str, Job)>>,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackPool {
    /// Starts `size` workers (at least one).
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<(&'static str, Job)>();
        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("tidewatch-callback-{index}"))
                .spawn(move || run_worker(receiver))?;
            workers.push(worker);
        }
        debug!("Callback pool started with {} workers", workers.len());

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queues a callback invocation. `label` names the callback in panic reports.
    pub(crate) fn execute<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => {
                if sender.send((label, Box::new(job))).is_err() {
                    warn!("Callback pool is closed, dropping {} callback", label);
                }
            }
            None => warn!("Callback pool is shut down, dropping {} callback", label),
        }
    }

    /// Stops accepting work, lets queued callbacks finish and joins the workers.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last handle to a client can be released from inside a callback.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Callback worker exited with a panic");
            }
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<(&'static str, Job)>) {
    for (label, job) in receiver.iter() {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("User {} callback panicked: {}", label, reason);
        }
    }
}
