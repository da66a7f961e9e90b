//! Per-link transport state.
//!
//! A [`Session`] is created once when the link comes up and reset in place
//! on INIT, on a malformed chunk, on disconnect and on power-cycle. Receive
//! and send share its [`TransportLock`], so the two directions of one link
//! never interleave.

use crate::error::SendError;

// ───────────────────────────────────────────────────────────────
// TransportLock
// ───────────────────────────────────────────────────────────────

/// Send ownership plus an explicit re-entrancy guard.
///
/// `try_acquire` / `release` bracket a whole APDU send. `seal` / `unseal`
/// bracket each synchronous transmit, during which the platform may pump
/// events and re-enter the receive path. A re-entrant INIT calls `abort`,
/// and the sender observes it at its next `seal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportLock {
    sending: bool,
    depth: u8,
}

impl TransportLock {
    pub const fn new() -> Self {
        Self {
            sending: false,
            depth: 0,
        }
    }

    pub fn try_acquire(&mut self) -> Result<(), SendError> {
        if self.sending {
            return Err(SendError::Busy);
        }
        self.sending = true;
        Ok(())
    }

    pub fn release(&mut self) {
        self.sending = false;
        self.depth = 0;
    }

    /// Enter a transmit. Fails with `Aborted` if the send was cancelled.
    pub fn seal(&mut self) -> Result<(), SendError> {
        if !self.sending {
            return Err(SendError::Aborted);
        }
        self.depth = self.depth.saturating_add(1);
        Ok(())
    }

    pub fn unseal(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Cancel the send in progress. An in-flight transmit keeps its seal
    /// until it unwinds.
    pub fn abort(&mut self) {
        self.sending = false;
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Whether a transmit is currently on the stack.
    pub fn is_sealed(&self) -> bool {
        self.depth > 0
    }
}

// ───────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────

/// Reception state of one link.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Next sequence number accepted. 0 means idle.
    pub expected_seq: u16,
    /// Bytes still expected for the APDU being received.
    pub remaining: u16,
    /// Declared length of the APDU being received.
    pub total: u16,
    /// Write position in the APDU buffer.
    pub cursor: usize,
    /// Channel captured from the first chunk (USB only).
    pub channel: u16,
    pub lock: TransportLock,
}

impl Session {
    pub const fn new() -> Self {
        Self {
            expected_seq: 0,
            remaining: 0,
            total: 0,
            cursor: 0,
            channel: 0,
            lock: TransportLock::new(),
        }
    }

    /// Start a reception from a first chunk.
    pub fn begin(&mut self, total: u16, channel: u16) {
        self.expected_seq = 0;
        self.remaining = total;
        self.total = total;
        self.cursor = 0;
        self.channel = channel;
    }

    /// Record `n` copied bytes and advance the sequence.
    /// Returns `true` once the APDU is complete.
    pub fn advance(&mut self, n: u16) -> bool {
        self.cursor += usize::from(n);
        self.remaining -= n;
        if self.remaining == 0 {
            self.expected_seq = 0;
            true
        } else {
            self.expected_seq = self.expected_seq.wrapping_add(1);
            false
        }
    }

    /// Drop any partial reception. The send lock is untouched.
    pub fn reset_rx(&mut self) {
        self.expected_seq = 0;
        self.remaining = 0;
        self.total = 0;
        self.cursor = 0;
    }

    /// Full reset: reception cleared and any send in flight aborted.
    pub fn reset(&mut self) {
        self.reset_rx();
        self.channel = 0;
        self.lock.abort();
    }

    pub fn is_idle(&self) -> bool {
        self.expected_seq == 0 && self.remaining == 0
    }
}

// ───────────────────────────────────────────────────────────────
// SendCursor
// ───────────────────────────────────────────────────────────────

/// Progress of the APDU being fragmented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendCursor {
    pub offset: usize,
    pub len: usize,
    pub seq: u16,
    pub active: bool,
}

impl SendCursor {
    pub fn start(len: usize) -> Self {
        Self {
            offset: 0,
            len,
            seq: 0,
            active: true,
        }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }
}

// ── Tests ─────────────────────────────────────────────────────
