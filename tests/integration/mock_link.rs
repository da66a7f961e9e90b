//! Mock controller link for integration tests.
//!
//! Records every command frame, answers each one with a command-complete
//! (unless told otherwise) and replays scripted HCI events, ticks and USB
//! reports through the [`Dispatcher`] port.

use std::collections::VecDeque;

use apdu_link::app::ports::{
    ChunkSink, Dispatcher, HciTransport, PlatformEvent, RadioPower, RandomSource, SerialSource,
};
use apdu_link::error::TxError;
use apdu_link::hci::opcode;
use embedded_hal::delay::DelayNs;

// ── Scripted events ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Hci(Vec<u8>),
    Tick,
    Usb(Vec<u8>),
}

/// One-shot override for the next reply to an opcode.
struct Override {
    opcode: u16,
    status: u8,
    before: Vec<Vec<u8>>,
    after: Vec<Vec<u8>>,
}

// ── MockLink ──────────────────────────────────────────────────

pub struct MockLink {
    pub sent: Vec<Vec<u8>>,
    pub events: VecDeque<MockEvent>,
    pub radio: Vec<bool>,
    /// Answer commands with a command-complete.
    pub auto_reply: bool,
    /// Opcodes never answered, even with `auto_reply`.
    pub silent: Vec<u16>,
    /// Refuse this many writes with insufficient resources.
    pub refuse: usize,
    pub refused: usize,
    overrides: VecDeque<Override>,
    next_handle: u16,
    current: Vec<u8>,
}

#[allow(dead_code)]
impl MockLink {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            events: VecDeque::new(),
            radio: Vec::new(),
            auto_reply: true,
            silent: Vec::new(),
            refuse: 0,
            refused: 0,
            overrides: VecDeque::new(),
            next_handle: 0,
            current: Vec::new(),
        }
    }

    pub fn push_hci(&mut self, raw: Vec<u8>) {
        self.events.push_back(MockEvent::Hci(raw));
    }

    pub fn push_ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.events.push_back(MockEvent::Tick);
        }
    }

    /// Answer the next `times` commands with `op` using `status`.
    pub fn fail(&mut self, op: u16, status: u8, times: usize) {
        for _ in 0..times {
            self.overrides.push_back(Override {
                opcode: op,
                status,
                before: Vec::new(),
                after: Vec::new(),
            });
        }
    }

    /// Deliver `raw` before the command-complete of the next `op`.
    pub fn before_reply(&mut self, op: u16, raw: Vec<u8>) {
        self.overrides.push_back(Override {
            opcode: op,
            status: 0,
            before: vec![raw],
            after: Vec::new(),
        });
    }

    /// Reply to the next `op` with `status`, then deliver `raw`.
    pub fn reply_then(&mut self, op: u16, status: u8, raw: Vec<u8>) {
        self.overrides.push_back(Override {
            opcode: op,
            status,
            before: Vec::new(),
            after: vec![raw],
        });
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.sent.iter().map(|f| u16::from_le_bytes([f[1], f[2]])).collect()
    }

    /// Parameters of every frame sent with `op`.
    pub fn params_of(&self, op: u16) -> Vec<Vec<u8>> {
        self.sent
            .iter()
            .filter(|f| u16::from_le_bytes([f[1], f[2]]) == op)
            .map(|f| f[4..].to_vec())
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    fn handle(&mut self) -> [u8; 2] {
        self.next_handle += 0x10;
        self.next_handle.to_le_bytes()
    }

    fn return_params(&mut self, op: u16, status: u8) -> Vec<u8> {
        let mut ret = vec![status];
        if status != 0 {
            return ret;
        }
        match op {
            opcode::GAP_INIT => {
                for _ in 0..3 {
                    let h = self.handle();
                    ret.extend_from_slice(&h);
                }
            }
            opcode::GATT_ADD_SERVICE | opcode::GATT_ADD_CHAR => {
                let h = self.handle();
                ret.extend_from_slice(&h);
            }
            _ => {}
        }
        ret
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl HciTransport for MockLink {
    fn send_command(&mut self, frame: &[u8]) -> Result<(), TxError> {
        if self.refuse > 0 {
            self.refuse -= 1;
            self.refused += 1;
            return Err(TxError::InsufficientResources);
        }
        self.sent.push(frame.to_vec());
        let op = u16::from_le_bytes([frame[1], frame[2]]);
        if op == opcode::RESET {
            self.next_handle = 0;
        }

        let over = self
            .overrides
            .iter()
            .position(|o| o.opcode == op)
            .and_then(|i| self.overrides.remove(i));
        let (status, before, after) = match over {
            Some(o) => (o.status, o.before, o.after),
            None => (0, Vec::new(), Vec::new()),
        };

        for raw in before {
            self.push_hci(raw);
        }
        if self.auto_reply && !self.silent.contains(&op) {
            let ret = self.return_params(op, status);
            self.push_hci(cc(op, &ret));
        }
        for raw in after {
            self.push_hci(raw);
        }
        Ok(())
    }
}

impl Dispatcher for MockLink {
    fn dispatch_one_event(&mut self) -> Option<PlatformEvent<'_>> {
        match self.events.pop_front()? {
            MockEvent::Tick => Some(PlatformEvent::Tick),
            MockEvent::Hci(raw) => {
                self.current = raw;
                Some(PlatformEvent::Hci(&self.current))
            }
            MockEvent::Usb(raw) => {
                self.current = raw;
                Some(PlatformEvent::UsbReport(&self.current))
            }
        }
    }
}

impl RadioPower for MockLink {
    fn set_radio_power(&mut self, on: bool) {
        self.radio.push(on);
    }
}

// ── Identity, randomness, delay, host endpoint ────────────────

pub struct MockSerial {
    pub serial: [u8; 8],
    pub plane_mode: bool,
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            serial: [0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0xFF],
            plane_mode: false,
        }
    }
}

impl SerialSource for MockSerial {
    fn serial(&self) -> [u8; 8] {
        self.serial
    }

    fn plane_mode(&self) -> bool {
        self.plane_mode
    }
}

/// Returns `start`, `start + 1`, ...
pub struct Counter(pub u32);

impl RandomSource for Counter {
    fn next_u32(&mut self) -> u32 {
        let v = self.0;
        self.0 = self.0.wrapping_add(1);
        v
    }
}

/// Records the total requested delay instead of sleeping.
#[derive(Default)]
pub struct RecordingDelay {
    pub total_ns: u64,
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
    }
}

#[derive(Default)]
pub struct HostEndpoint {
    pub reports: Vec<Vec<u8>>,
}

impl ChunkSink for HostEndpoint {
    fn transmit(&mut self, chunk: &[u8]) -> Result<(), TxError> {
        self.reports.push(chunk.to_vec());
        Ok(())
    }
}

// ── Event builders ────────────────────────────────────────────

pub fn cc(op: u16, ret: &[u8]) -> Vec<u8> {
    let [lo, hi] = op.to_le_bytes();
    let mut v = vec![0x04, 0x0E, (3 + ret.len()) as u8, 0x01, lo, hi];
    v.extend_from_slice(ret);
    v
}

pub fn vendor(code: u16, data: &[u8]) -> Vec<u8> {
    let [lo, hi] = code.to_le_bytes();
    let mut v = vec![0x04, 0xFF, (2 + data.len()) as u8, lo, hi];
    v.extend_from_slice(data);
    v
}

pub fn connection_complete(handle: u16, interval: u16) -> Vec<u8> {
    let [h0, h1] = handle.to_le_bytes();
    let [i0, i1] = interval.to_le_bytes();
    vec![
        0x04, 0x3E, 19, 0x01, 0x00, h0, h1, 0x01, 0x00, 1, 2, 3, 4, 5, 6, i0, i1, 0x00, 0x00,
        0xF4, 0x01, 0x00,
    ]
}

pub fn encryption_change(handle: u16, on: bool) -> Vec<u8> {
    let [h0, h1] = handle.to_le_bytes();
    vec![0x04, 0x08, 0x04, 0x00, h0, h1, u8::from(on)]
}

pub fn disconnect(handle: u16, reason: u8) -> Vec<u8> {
    let [h0, h1] = handle.to_le_bytes();
    vec![0x04, 0x05, 0x04, 0x00, h0, h1, reason]
}

/// Write request on the characteristic value handle `attr`.
pub fn write_permit(conn: u16, attr: u16, value: &[u8]) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&conn.to_le_bytes());
    d.extend_from_slice(&attr.to_le_bytes());
    d.push(value.len() as u8);
    d.extend_from_slice(value);
    vendor(0x0C13, &d)
}

/// Newer controller layout: `[conn][attr][offset][len LE][value]`.
pub fn attribute_modified(conn: u16, attr: u16, value: &[u8]) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&conn.to_le_bytes());
    d.extend_from_slice(&attr.to_le_bytes());
    d.extend_from_slice(&[0x00, 0x00]);
    d.extend_from_slice(&(value.len() as u16).to_le_bytes());
    d.extend_from_slice(value);
    vendor(0x0C01, &d)
}

/// Legacy controller layout: `[conn][attr][len][offset LE][value]`.
pub fn legacy_attribute_modified(conn: u16, attr: u16, value: &[u8]) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&conn.to_le_bytes());
    d.extend_from_slice(&attr.to_le_bytes());
    d.push(value.len() as u8);
    d.extend_from_slice(&[0x00, 0x00]);
    d.extend_from_slice(value);
    vendor(0x0C01, &d)
}

/// The 38-byte APDU `E0 FF 12 13 .. 35`.
pub fn sample_apdu() -> Vec<u8> {
    let mut v = vec![0xE0, 0xFF];
    v.extend(0x12..=0x35u8);
    v
}
