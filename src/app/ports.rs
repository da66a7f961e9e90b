//! Port traits: the boundary between the link state machines and the platform.
//!
//! ```text
//!   Platform adapter ──▶ Port trait ──▶ transports / BLE adapters
//! ```
//!
//! The platform implements these traits (SPI to the controller, USB
//! endpoint, tick source, serial number). The adapters consume them via
//! generics, so the protocol core never touches hardware directly.
//!
//! ## Re-entrancy
//!
//! Blocking operations (chunk transmit, correlated HCI requests) pump
//! [`Dispatcher::dispatch_one_event`] while they wait. Anything delivered
//! during that wait is handed to an [`AsyncEventHandler`] before the
//! blocking call returns.

use crate::config::LinkConfig;
use crate::error::TxError;
use crate::hci::EventPacket;

// ───────────────────────────────────────────────────────────────
// Event source (driven adapter: platform → core)
// ───────────────────────────────────────────────────────────────

/// One unit of work delivered by the platform event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent<'a> {
    /// A raw HCI packet from the BLE controller (type byte included).
    Hci(&'a [u8]),
    /// The periodic platform tick (100 ms on the reference hardware).
    Tick,
    /// A raw USB HID output report.
    UsbReport(&'a [u8]),
    /// Anything the link layer does not consume (button, display, ...).
    Other,
}

/// Pumps the platform event loop once.
pub trait Dispatcher {
    /// Block until the next event and return it. `None` means the platform
    /// has nothing more to deliver (shutdown, or a scripted test ran dry).
    fn dispatch_one_event(&mut self) -> Option<PlatformEvent<'_>>;
}

// ───────────────────────────────────────────────────────────────
// Transmit primitives (driven adapter: core → platform)
// ───────────────────────────────────────────────────────────────

/// Writes one framed HCI command to the controller.
pub trait HciTransport {
    fn send_command(&mut self, frame: &[u8]) -> Result<(), TxError>;
}

/// Transmits one wire chunk (a BLE notification payload or a USB report).
pub trait ChunkSink {
    fn transmit(&mut self, chunk: &[u8]) -> Result<(), TxError>;
}

/// Radio supply switch of the BLE controller. Powering on leaves the
/// controller in its reset state.
pub trait RadioPower {
    fn set_radio_power(&mut self, on: bool);
}

// ───────────────────────────────────────────────────────────────
// Async event handler (core → adapter callback)
// ───────────────────────────────────────────────────────────────

/// Receives everything a correlated wait did not consume.
pub trait AsyncEventHandler {
    /// An HCI event that is not the reply to the outstanding request.
    fn on_async_event(&mut self, pkt: &EventPacket);

    /// A platform tick observed while waiting.
    fn on_tick(&mut self) {}

    /// A non-HCI event observed while waiting.
    fn on_unrouted(&mut self, _event: PlatformEvent<'_>) {}
}

// ───────────────────────────────────────────────────────────────
// Device identity and randomness
// ───────────────────────────────────────────────────────────────

/// Source of the 8-byte device serial number.
pub trait SerialSource {
    fn serial(&self) -> [u8; 8];

    /// Whether radio advertising is disabled by the user (plane mode).
    fn plane_mode(&self) -> bool {
        false
    }
}

/// Random source for pairing codes.
pub trait RandomSource {
    fn next_u32(&mut self) -> u32;
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: core ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists link configuration.
///
/// Implementations MUST call [`LinkConfig::validate`] before persisting
/// and reject invalid values instead of clamping them.
pub trait ConfigPort {
    /// Load configuration from persistent storage.
    /// Returns [`LinkConfig::default()`] if no stored config exists.
    fn load(&self) -> Result<LinkConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&mut self, config: &LinkConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored config failed deserialization.
    Corrupted,
    /// A config field failed range validation.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}
