//! Unified error types for the APDU link.
//!
//! Every subsystem has its own small `Copy` enum, and all of them convert
//! into the top-level [`Error`] so an event loop can log and drop failures
//! uniformly. None of these errors is fatal: a malformed exchange resets
//! the affected session and the host restarts from sequence 0.

use core::fmt;

use crate::apdu::layout::tag;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming chunk was malformed or out of sequence.
    Frame(FrameError),
    /// An outgoing APDU could not be sent.
    Send(SendError),
    /// The transmit primitive failed.
    Tx(TxError),
    /// A correlated HCI command failed.
    Hci(HciError),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::Send(e) => write!(f, "send: {e}"),
            Self::Tx(e) => write!(f, "tx: {e}"),
            Self::Hci(e) => write!(f, "hci: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame (protocol + capacity) errors
// ---------------------------------------------------------------------------

/// Receive-side failures. Each one resets the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The chunk is shorter than its header requires.
    TooShort { len: usize },
    /// APDU chunk carried the wrong sequence number.
    SequenceMismatch { expected: u16, got: u16 },
    /// Continuation chunk arrived on a different channel (USB only).
    ChannelMismatch { expected: u16, got: u16 },
    /// Declared total length exceeds the APDU buffer. Nothing was copied.
    Overflow { declared: u16, capacity: u16 },
    /// A control tag that must be sent alone arrived with a nonzero sequence.
    UnexpectedSequence { tag: u8 },
    /// The tag byte is not part of the protocol.
    UnknownTag(u8),
}

impl FrameError {
    /// Code carried in byte 1 of a legacy error chunk.
    pub const fn wire_code(self) -> u8 {
        match self {
            Self::TooShort { .. }
            | Self::SequenceMismatch { .. }
            | Self::ChannelMismatch { .. } => 0,
            Self::Overflow { .. } => 1,
            Self::UnexpectedSequence { tag: t } => match t {
                tag::VERSION => 3,
                tag::ECHO => 4,
                tag::INIT => 5,
                other => other,
            },
            Self::UnknownTag(t) => t,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "chunk too short ({len} bytes)"),
            Self::SequenceMismatch { expected, got } => {
                write!(f, "sequence mismatch (expected {expected}, got {got})")
            }
            Self::ChannelMismatch { expected, got } => {
                write!(f, "channel mismatch (expected 0x{expected:04X}, got 0x{got:04X})")
            }
            Self::Overflow { declared, capacity } => {
                write!(f, "declared length {declared} exceeds capacity {capacity}")
            }
            Self::UnexpectedSequence { tag } => {
                write!(f, "tag 0x{tag:02X} requires sequence 0")
            }
            Self::UnknownTag(tag) => write!(f, "unknown tag 0x{tag:02X}"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Send errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// A send is already in progress on this link.
    Busy,
    /// The host issued INIT (or the link dropped) while chunks were going out.
    Aborted,
    /// The APDU does not fit the 16-bit length field or the link buffer.
    TooLong { len: usize },
    /// The transmit primitive gave up.
    Link(TxError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "already sending"),
            Self::Aborted => write!(f, "aborted by host"),
            Self::TooLong { len } => write!(f, "APDU too long ({len} bytes)"),
            Self::Link(e) => write!(f, "link: {e}"),
        }
    }
}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        Self::Send(e)
    }
}

impl From<TxError> for SendError {
    fn from(e: TxError) -> Self {
        Self::Link(e)
    }
}

// ---------------------------------------------------------------------------
// Transmit primitive errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Controller is out of TX buffers (transient, retried by policy).
    InsufficientResources,
    /// The bounded retry policy ran out of attempts.
    RetriesExhausted,
    /// No peer is subscribed to the notify characteristic.
    NotConnected,
    /// Controller rejected the write with this status.
    Status(u8),
    /// The underlying bus refused the frame.
    Io,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources => write!(f, "controller out of resources"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
            Self::NotConnected => write!(f, "no client connected"),
            Self::Status(s) => write!(f, "controller status 0x{s:02X}"),
            Self::Io => write!(f, "bus I/O error"),
        }
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        Self::Tx(e)
    }
}

// ---------------------------------------------------------------------------
// HCI errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciError {
    /// No reply before the deadline expired.
    Timeout,
    /// Command status reported a nonzero status.
    Controller(u8),
    /// Controller raised a hardware error event.
    Hardware(u8),
    /// Packet failed type/length verification.
    Malformed,
    /// Every pool slot is in use; the platform re-delivers the packet later.
    PoolExhausted,
    /// Another command is still outstanding.
    Busy,
    /// The command frame could not be written.
    Link(TxError),
}

impl fmt::Display for HciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Controller(s) => write!(f, "controller status 0x{s:02X}"),
            Self::Hardware(code) => write!(f, "hardware error 0x{code:02X}"),
            Self::Malformed => write!(f, "malformed packet"),
            Self::PoolExhausted => write!(f, "packet pool exhausted"),
            Self::Busy => write!(f, "command already outstanding"),
            Self::Link(e) => write!(f, "link: {e}"),
        }
    }
}

impl From<HciError> for Error {
    fn from(e: HciError) -> Self {
        Self::Hci(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

// ── Tests ─────────────────────────────────────────────────────
