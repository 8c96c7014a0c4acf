//! Cancellable one-shot deadline.
//!
//! Used for the watcher's change debounce and the link's reconnect grace
//! timer. The owner polls it from its event loop; there are no timer handles
//! to leak or double-cancel.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending(Instant),
}

#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    state: DebounceState,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: DebounceState::Idle,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::Pending(_))
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Idle => None,
            DebounceState::Pending(deadline) => Some(deadline),
        }
    }

    /// Start or restart the delay from `now`.
    pub fn trigger(&mut self, now: Instant) {
        self.state = DebounceState::Pending(now + self.delay);
    }

    /// Start the delay only if nothing is pending. Returns true if it armed.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.is_pending() {
            return false;
        }
        self.trigger(now);
        true
    }

    /// True exactly once per pending deadline, once `now` reaches it.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending(deadline) if now >= deadline => {
                self.state = DebounceState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.state = DebounceState::Idle;
    }
}

/// A deadline far enough away to stand in for "never" in `select!` arms.
pub(crate) fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
