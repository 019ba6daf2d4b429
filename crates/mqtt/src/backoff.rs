//! Progressive backoff for reconnect attempts.
//!
//! Every reconnect attempt first calls [`BackoffController::back_off`], which sleeps
//! for the current quiet time and then doubles it, capped at the configured maximum.
//! Once a connection has been acknowledged the consumer arms the stability timer;
//! if the session survives for the stable threshold the quiet time drops back to
//! the base value. A flapping connection never lets the timer fire, so its backoff
//! keeps escalating.
//!
//! ```text
//! current = 1s
//! back_off(): sleep(current); current = if current == 0 { base } else { min(max, current * 2) }
//! stability timer fired: current = base
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use tidewatch_mqtt::backoff::{BackoffController, BackoffTiming};
//!
//! let timing = BackoffTiming::from_secs(1, 16, 5)?;
//! let backoff = BackoffController::new(timing);
//!
//! assert_eq!(backoff.back_off(), Duration::from_secs(1));
//! assert_eq!(backoff.back_off(), Duration::from_secs(2));
//! assert_eq!(backoff.back_off(), Duration::from_secs(4));
//! ```

use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Quiet time used before the very first reconnect, whatever the base is.
const INITIAL_QUIET_TIME: Duration = Duration::from_secs(1);

/// Error type for invalid backoff timing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    /// The base quiet time must be strictly shorter than the stable connection time,
    /// otherwise a reset could never be distinguished from an ordinary backoff.
    #[error(
        "Base reconnect quiet time ({base:?}) must be shorter than the stable connection time ({stable:?})"
    )]
    BaseNotBelowStable { base: Duration, stable: Duration },
}

/// Validated timing triple for the backoff controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffTiming {
    base: Duration,
    max: Duration,
    stable: Duration,
}

impl BackoffTiming {
    /// Creates a timing triple.
    ///
    /// # Errors
    /// Returns [`BackoffError::BaseNotBelowStable`] if `base >= stable`.
    pub fn new(base: Duration, max: Duration, stable: Duration) -> Result<Self, BackoffError> {
        if base >= stable {
            return Err(BackoffError::BaseNotBelowStable { base, stable });
        }
        Ok(Self { base, max, stable })
    }

    /// Whole-second convenience constructor, matching the configuration file units.
    pub fn from_secs(base: u64, max: u64, stable: u64) -> Result<Self, BackoffError> {
        Self::new(
            Duration::from_secs(base),
            Duration::from_secs(max),
            Duration::from_secs(stable),
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn stable(&self) -> Duration {
        self.stable
    }
}

impl Default for BackoffTiming {
    /// Base 1s, max 32s, stable after 20s.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(32),
            stable: Duration::from_secs(20),
        }
    }
}

/// The blocking primitive used by [`BackoffController::back_off`].
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Puts the calling thread to sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

struct BackoffState {
    timing: BackoffTiming,
    current: Duration,
    /// Bumped on every start/stop; a timer thread only resets `current` if the
    /// generation it was started with is still current.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct BackoffInner {
    state: Mutex<BackoffState>,
    timer_cv: Condvar,
}

/// Progressive backoff controller with an owned stability timer.
///
/// Thread-safe: the reconnect supervisor calls `back_off` while the event consumer
/// starts and stops the timer.
pub struct BackoffController {
    inner: Arc<BackoffInner>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BackoffController")
            .field("timing", &state.timing)
            .field("current", &state.current)
            .field("timer_armed", &state.timer.is_some())
            .finish()
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(BackoffTiming::default())
    }
}

impl BackoffController {
    pub fn new(timing: BackoffTiming) -> Self {
        Self::with_sleeper(timing, Arc::new(ThreadSleeper))
    }

    /// Creates a controller that blocks through the given [`Sleeper`].
    pub fn with_sleeper(timing: BackoffTiming, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner: Arc::new(BackoffInner {
                state: Mutex::new(BackoffState {
                    timing,
                    current: INITIAL_QUIET_TIME,
                    generation: 0,
                    timer: None,
                }),
                timer_cv: Condvar::new(),
            }),
            sleeper,
        }
    }

    /// Replaces the timing triple. The current quiet time is kept.
    pub fn reconfigure(&self, timing: BackoffTiming) {
        self.inner.state.lock().timing = timing;
    }

    pub fn timing(&self) -> BackoffTiming {
        self.inner.state.lock().timing
    }

    /// The quiet time the next `back_off` call will sleep for.
    pub fn current(&self) -> Duration {
        self.inner.state.lock().current
    }

    /// Sleeps for the current quiet time, then escalates it.
    ///
    /// Cancels a pending stability timer first: reaching this point means the last
    /// connection did not hold. Returns the duration slept.
    pub fn back_off(&self) -> Duration {
        self.stop_stability_timer();

        let delay = self.inner.state.lock().current;
        debug!("Backing off for {:?} before reconnecting", delay);
        self.sleeper.sleep(delay);

        let mut state = self.inner.state.lock();
        state.current = if state.current.is_zero() {
            state.timing.base
        } else {
            state.current.saturating_mul(2).min(state.timing.max)
        };
        delay
    }

    /// Arms the one-shot stability timer, replacing any armed one.
    pub fn start_stability_timer(&self) {
        let stale = {
            let mut state = self.inner.state.lock();
            let stale = Self::disarm(&self.inner, &mut state);
            let generation = state.generation;
            let stable = state.timing.stable;

            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name("tidewatch-stability".into())
                .spawn(move || run_stability_timer(inner, generation, stable));
            match spawned {
                Ok(handle) => state.timer = Some(handle),
                Err(e) => warn!("Failed to arm stability timer: {}", e),
            }
            stale
        };
        join_timer(stale);
    }

    /// Cancels the stability timer if armed.
    pub fn stop_stability_timer(&self) {
        let stale = {
            let mut state = self.inner.state.lock();
            Self::disarm(&self.inner, &mut state)
        };
        join_timer(stale);
    }

    fn disarm(inner: &BackoffInner, state: &mut BackoffState) -> Option<JoinHandle<()>> {
        state.generation = state.generation.wrapping_add(1);
        inner.timer_cv.notify_all();
        state.timer.take()
    }
}

impl Drop for BackoffController {
    fn drop(&mut self) {
        self.stop_stability_timer();
    }
}

fn run_stability_timer(inner: Arc<BackoffInner>, generation: u64, stable: Duration) {
    let deadline = Instant::now() + stable;
    let mut state = inner.state.lock();
    while state.generation == generation {
        if inner.timer_cv.wait_until(&mut state, deadline).timed_out() {
            break;
        }
    }
    if state.generation == generation {
        state.current = state.timing.base;
        debug!(
            "Connection stable for {:?}, backoff reset to {:?}",
            stable, state.current
        );
    }
}

fn join_timer(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("Stability timer thread panicked");
        }
    }
}
