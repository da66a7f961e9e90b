//! Tick-driven cancellable deadline.
//!
//! Every bounded wait in the crate (HCI request ceiling, legacy connection
//! timeout, per-chunk transfer timeout) is one of these. The platform tick
//! advances it; nothing reads a wall clock.
//!
//! ```text
//!            arm()              tick() crosses limit
//!   Idle ────────────▶ Armed ──────────────────────▶ Expired
//!    ▲                   │
//!    │     cancel()      ▼
//!    └──────────────  Cancelled
//! ```

use embassy_time::Duration;

/// Lifecycle of a [`Deadline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    Idle,
    Armed,
    Expired,
    Cancelled,
}

/// A single-shot timeout advanced by explicit ticks.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    limit: Duration,
    elapsed: Duration,
    state: DeadlineState,
}

impl Deadline {
    pub const fn new() -> Self {
        Self {
            limit: Duration::from_ticks(0),
            elapsed: Duration::from_ticks(0),
            state: DeadlineState::Idle,
        }
    }

    /// Start (or restart) the countdown.
    pub fn arm(&mut self, limit: Duration) {
        self.limit = limit;
        self.elapsed = Duration::from_ticks(0);
        self.state = DeadlineState::Armed;
    }

    /// Advance by one platform tick. Returns the state after the step.
    ///
    /// Only an armed deadline moves; expiry is reported once and then the
    /// deadline stays `Expired` until re-armed.
    pub fn tick(&mut self, step: Duration) -> DeadlineState {
        if self.state == DeadlineState::Armed {
            self.elapsed += step;
            if self.elapsed >= self.limit {
                self.state = DeadlineState::Expired;
            }
        }
        self.state
    }

    /// Stop an armed deadline. No effect in any other state.
    pub fn cancel(&mut self) {
        if self.state == DeadlineState::Armed {
            self.state = DeadlineState::Cancelled;
        }
    }

    /// Return to `Idle` regardless of state.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> DeadlineState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == DeadlineState::Armed
    }

    /// Time left before expiry, zero unless armed.
    pub fn remaining(&self) -> Duration {
        if self.is_armed() {
            self.limit.checked_sub(self.elapsed).unwrap_or(Duration::from_ticks(0))
        } else {
            Duration::from_ticks(0)
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────
