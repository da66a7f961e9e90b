//! HCI packet model and command correlation.
//!
//! ```text
//!   send_request ──▶ [0x01 | opcode LE | plen | params] ──▶ controller
//!                                                              │
//!   Correlator ◀── PacketPool.intake ◀── dispatch_one_event ◀──┘
//!      │  reply queue (≤1)   async queue (FIFO)
//!      ▼                          ▼
//!   caller's reply buffer     AsyncEventHandler
//! ```

pub mod correlator;
pub mod pool;

use embassy_time::Duration;
use heapless::Vec;

use crate::error::HciError;

pub use correlator::Correlator;
pub use pool::{PacketPool, POOL_SIZE};

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

pub const COMMAND_PACKET: u8 = 0x01;
pub const EVENT_PACKET: u8 = 0x04;

/// Type byte + event code + parameter length.
pub const EVENT_HEADER_LEN: usize = 3;
/// Largest event packet: header plus 255 parameter bytes.
pub const MAX_EVENT_LEN: usize = EVENT_HEADER_LEN + 255;
/// Largest command frame: type, opcode, length plus 255 parameter bytes.
pub const MAX_COMMAND_LEN: usize = 4 + 255;

pub mod event {
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const LE_META: u8 = 0x3E;
    pub const VENDOR: u8 = 0xFF;
}

pub mod le_subevent {
    pub const CONNECTION_COMPLETE: u8 = 0x01;
    pub const CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
    pub const DATA_LENGTH_CHANGE: u8 = 0x07;
    pub const ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;
    pub const PHY_UPDATE_COMPLETE: u8 = 0x0C;
}

/// Vendor event codes (first two parameter bytes, little-endian).
pub mod vendor {
    pub const L2CAP_CONNECTION_UPDATE_RESP: u16 = 0x0800;
    pub const PAIRING_COMPLETE: u16 = 0x0401;
    pub const PASS_KEY_REQUEST: u16 = 0x0402;
    pub const NUMERIC_COMPARISON: u16 = 0x0409;
    pub const ATTRIBUTE_MODIFIED: u16 = 0x0C01;
    pub const PROCEDURE_TIMEOUT: u16 = 0x0C02;
    pub const EXCHANGE_MTU_RESP: u16 = 0x0C03;
    pub const INDICATION: u16 = 0x0C0E;
    pub const PROCEDURE_COMPLETE: u16 = 0x0C10;
    pub const WRITE_PERMIT_REQ: u16 = 0x0C13;
    pub const TX_POOL_AVAILABLE: u16 = 0x0C16;
}

/// Packed opcodes (`ogf << 10 | ocf`) used by the BLE adapters.
pub mod opcode {
    pub const DISCONNECT: u16 = 0x0406;
    pub const RESET: u16 = 0x0C03;
    pub const LE_SET_SCAN_RESPONSE_DATA: u16 = 0x2009;

    pub const HAL_WRITE_CONFIG_DATA: u16 = 0xFC0C;
    pub const HAL_SET_TX_POWER_LEVEL: u16 = 0xFC0F;
    pub const GAP_SET_NON_DISCOVERABLE: u16 = 0xFC81;
    pub const GAP_SET_DISCOVERABLE: u16 = 0xFC83;
    pub const GAP_SET_IO_CAPABILITY: u16 = 0xFC85;
    pub const GAP_SET_AUTH_REQUIREMENT: u16 = 0xFC86;
    pub const GAP_PASS_KEY_RESP: u16 = 0xFC88;
    pub const GAP_INIT: u16 = 0xFC8A;
    pub const GAP_UPDATE_ADV_DATA: u16 = 0xFC8E;
    pub const GAP_CLEAR_SECURITY_DB: u16 = 0xFC94;
    pub const GAP_NUMERIC_COMPARISON_VALUE_CONFIRM: u16 = 0xFCA5;
    pub const GATT_INIT: u16 = 0xFD01;
    pub const GATT_ADD_SERVICE: u16 = 0xFD02;
    pub const GATT_ADD_CHAR: u16 = 0xFD04;
    pub const GATT_UPDATE_CHAR_VALUE: u16 = 0xFD06;
    pub const GATT_EXCHANGE_CONFIG: u16 = 0xFD0B;
    pub const GATT_CONFIRM_INDICATION: u16 = 0xFD25;
    pub const GATT_WRITE_RESP: u16 = 0xFD26;
    pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQ: u16 = 0xFD81;

    /// Wildcard used by the init step machine.
    pub const ANY: u16 = 0xFFFF;
}

/// Controller status: no free TX buffer for a notification.
pub const STATUS_INSUFFICIENT_RESOURCES: u8 = 0x64;

/// Pack an OGF/OCF pair into an opcode.
pub const fn pack_opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03FF)
}

// ---------------------------------------------------------------------------
// Event packets
// ---------------------------------------------------------------------------

/// Classification used by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CommandComplete,
    CommandStatus,
    LeMeta(u8),
    HardwareError,
    Asynchronous,
}

/// A verified HCI event packet, stored with its type byte.
#[derive(Debug, Clone, Default)]
pub struct EventPacket {
    raw: Vec<u8, MAX_EVENT_LEN>,
}

impl EventPacket {
    pub const fn empty() -> Self {
        Self { raw: Vec::new() }
    }

    /// Verify and copy a raw packet.
    ///
    /// The type byte must be [`EVENT_PACKET`] and the declared parameter
    /// length must match the bytes actually received.
    pub fn parse(raw: &[u8]) -> Result<Self, HciError> {
        if raw.len() < EVENT_HEADER_LEN || raw[0] != EVENT_PACKET {
            return Err(HciError::Malformed);
        }
        if usize::from(raw[2]) != raw.len() - EVENT_HEADER_LEN {
            return Err(HciError::Malformed);
        }
        let raw = Vec::from_slice(raw).map_err(|()| HciError::Malformed)?;
        Ok(Self { raw })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn code(&self) -> u8 {
        self.raw.get(1).copied().unwrap_or(0)
    }

    /// Event parameters (after the 3-byte header).
    pub fn params(&self) -> &[u8] {
        self.raw.get(EVENT_HEADER_LEN..).unwrap_or(&[])
    }

    pub fn kind(&self) -> EventKind {
        match self.code() {
            event::COMMAND_COMPLETE => EventKind::CommandComplete,
            event::COMMAND_STATUS => EventKind::CommandStatus,
            event::HARDWARE_ERROR => EventKind::HardwareError,
            event::LE_META => EventKind::LeMeta(self.params().first().copied().unwrap_or(0)),
            _ => EventKind::Asynchronous,
        }
    }

    /// Opcode of a command-complete or command-status event.
    pub fn opcode(&self) -> Option<u16> {
        let p = self.params();
        let at = match self.kind() {
            EventKind::CommandComplete => 1,
            EventKind::CommandStatus => 2,
            _ => return None,
        };
        Some(u16::from_le_bytes([*p.get(at)?, *p.get(at + 1)?]))
    }

    /// Number of commands the controller can accept.
    pub fn ncmd(&self) -> Option<u8> {
        match self.kind() {
            EventKind::CommandComplete => self.params().first().copied(),
            EventKind::CommandStatus => self.params().get(1).copied(),
            _ => None,
        }
    }

    /// Status byte of a command-status event, or first return parameter of
    /// a command-complete.
    pub fn status(&self) -> Option<u8> {
        match self.kind() {
            EventKind::CommandStatus => self.params().first().copied(),
            EventKind::CommandComplete => self.return_params().first().copied(),
            _ => None,
        }
    }

    /// The bytes a correlated caller receives.
    pub fn return_params(&self) -> &[u8] {
        let p = self.params();
        match self.kind() {
            EventKind::CommandComplete => p.get(3..).unwrap_or(&[]),
            EventKind::LeMeta(_) => p.get(1..).unwrap_or(&[]),
            _ => p,
        }
    }

    /// Vendor event code for `0xFF` events.
    pub fn vendor_code(&self) -> Option<u16> {
        if self.code() != event::VENDOR {
            return None;
        }
        let p = self.params();
        Some(u16::from_le_bytes([*p.first()?, *p.get(1)?]))
    }

    /// Vendor payload after the 2-byte vendor code.
    pub fn vendor_data(&self) -> &[u8] {
        self.params().get(2..).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Command requests
// ---------------------------------------------------------------------------

/// Which event finishes a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    CommandComplete,
    CommandStatus,
    LeMeta(u8),
}

/// A caller-owned request for one correlated command.
#[derive(Debug)]
pub struct CommandRequest<'a> {
    pub ogf: u8,
    pub ocf: u16,
    pub params: &'a [u8],
    pub expect: Expect,
    /// Filled with at most `reply.len()` bytes.
    pub reply: &'a mut [u8],
    pub timeout: Duration,
}

impl<'a> CommandRequest<'a> {
    /// A command-complete request for a packed opcode.
    pub fn complete(opcode: u16, params: &'a [u8], reply: &'a mut [u8], timeout: Duration) -> Self {
        Self {
            ogf: (opcode >> 10) as u8,
            ocf: opcode & 0x03FF,
            params,
            expect: Expect::CommandComplete,
            reply,
            timeout,
        }
    }

    pub fn opcode(&self) -> u16 {
        pack_opcode(self.ogf, self.ocf)
    }
}

/// Frame a command: `[0x01, opcode LE, plen, params]`.
pub fn frame_command(opcode: u16, params: &[u8]) -> Result<Vec<u8, MAX_COMMAND_LEN>, HciError> {
    let plen = u8::try_from(params.len()).map_err(|_| HciError::Malformed)?;
    let mut frame = Vec::new();
    let [lo, hi] = opcode.to_le_bytes();
    frame
        .extend_from_slice(&[COMMAND_PACKET, lo, hi, plen])
        .map_err(|()| HciError::Malformed)?;
    frame
        .extend_from_slice(params)
        .map_err(|()| HciError::Malformed)?;
    Ok(frame)
}

// ── Tests ─────────────────────────────────────────────────────
