//! Newer BLE controller adapter.
//!
//! Unlike the legacy link, nothing here blocks. Commands are framed into
//! an outbox and written by [`BleController`] after each event; their
//! command-complete events drive two step machines:
//!
//! ```text
//!   init:  Idle → Reset → StaticAddress → GattInit → GapInit → IoCapability
//!               → AuthRequirements → AddService → AddNotifyChar → AddWriteChar
//!               → AddWriteCmdChar → TxPower → ConfigureAdvertising → End
//!
//!   adv:   Idle → SetAdvData → SetScanResponse → SetGapDeviceName → Start → End
//!                                                   (Start skipped in plane mode)
//! ```
//!
//! Each step records the opcode it waits for; a command-complete with any
//! other opcode is ignored. [`opcode::ANY`] accepts the first one.
//!
//! Outgoing APDUs are notified one chunk at a time: the command-complete
//! of `ACI_GATT_UPDATE_CHAR_VALUE` releases the next chunk.

use embassy_time::Duration;
use embedded_hal::delay::DelayNs;
use heapless::{Deque, String, Vec};
use log::{debug, info, warn};

use super::gatt::{self, prop, Uuid128};
use super::pairing::{PairingBridge, PairingReply, PairingStatus, PairingUxEvent, UxResponse};
use crate::apdu::layout::tag;
use crate::apdu::{Chunk, ChunkedApduTransport, NegotiatedBle, RxEvent, APDU_CAPACITY};
use crate::app::ports::{
    AsyncEventHandler, Dispatcher, HciTransport, PlatformEvent, RandomSource, SerialSource,
};
use crate::config::{LinkConfig, RetryPolicy};
use crate::deadline::{Deadline, DeadlineState};
use crate::error::{SendError, TxError};
use crate::hci::{
    event, frame_command, le_subevent, opcode, vendor, Correlator, EventKind, EventPacket,
    MAX_COMMAND_LEN,
};

// ── Constants ────────────────────────────────────────────────

pub const NO_CONNECTION: u16 = 0xFFFF;

/// Longest device name; also the GAP device-name characteristic size.
pub const DEVICE_NAME_MAX: usize = 20;
pub type DeviceName = String<DEVICE_NAME_MAX>;

const CONFIG_RANDOM_ADDRESS_OFFSET: u8 = 0x2E;
const GAP_PERIPHERAL_ROLE: u8 = 0x01;
const IO_CAP_DISPLAY_YES_NO: u8 = 0x01;
const SERVICE_RECORDS: u8 = 9;
const MIN_KEY_SIZE: u8 = 8;
const RANDOM_ADDR: u8 = 0x01;
const ADV_IND: u8 = 0x00;
const NO_WHITE_LIST_USE: u8 = 0x00;

/// Disconnect reason "instant passed": the stack needs a full re-init.
const REASON_INSTANT_PASSED: u8 = 0x28;

const OUTBOX_DEPTH: usize = 8;

type Command = Vec<u8, MAX_COMMAND_LEN>;

// ───────────────────────────────────────────────────────────────
// Step machines
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Initializing,
    ConfigureAdvertising,
    Ready,
    /// A step command could not be written; `init` starts over.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitStep {
    Idle,
    Reset,
    StaticAddress,
    GattInit,
    GapInit,
    IoCapability,
    AuthRequirements,
    AddService,
    AddNotifyChar,
    AddWriteChar,
    AddWriteCmdChar,
    TxPower,
    ConfigureAdvertising,
    End,
}

impl InitStep {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::Reset,
            Self::Reset => Self::StaticAddress,
            Self::StaticAddress => Self::GattInit,
            Self::GattInit => Self::GapInit,
            Self::GapInit => Self::IoCapability,
            Self::IoCapability => Self::AuthRequirements,
            Self::AuthRequirements => Self::AddService,
            Self::AddService => Self::AddNotifyChar,
            Self::AddNotifyChar => Self::AddWriteChar,
            Self::AddWriteChar => Self::AddWriteCmdChar,
            Self::AddWriteCmdChar => Self::TxPower,
            Self::TxPower => Self::ConfigureAdvertising,
            Self::ConfigureAdvertising | Self::End => Self::End,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvStep {
    Idle,
    SetAdvData,
    SetScanResponse,
    SetGapDeviceName,
    Start,
    End,
}

impl AdvStep {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::SetAdvData,
            Self::SetAdvData => Self::SetScanResponse,
            Self::SetScanResponse => Self::SetGapDeviceName,
            Self::SetGapDeviceName => Self::Start,
            Self::Start | Self::End => Self::End,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Link records
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerHandles {
    pub gap_service: u16,
    pub gap_dev_name: u16,
    pub gap_appearance: u16,
    pub service: u16,
    pub notify: u16,
    pub write: u16,
    pub write_cmd: u16,
}

/// Parameters of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub handle: u16,
    /// 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units.
    pub supervision_timeout: u16,
    pub encrypted: bool,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
    pub tx_phy: u8,
    pub rx_phy: u8,
}

impl Connection {
    const fn none() -> Self {
        Self {
            handle: NO_CONNECTION,
            interval: 0,
            latency: 0,
            supervision_timeout: 0,
            encrypted: false,
            max_tx_octets: 0,
            max_tx_time: 0,
            max_rx_octets: 0,
            max_rx_time: 0,
            tx_phy: 0,
            rx_phy: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle != NO_CONNECTION
    }
}

/// A notification waiting for the write-response acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingNotify {
    chunk: Chunk,
    apdu: bool,
}

fn le16(b: &[u8], at: usize) -> u16 {
    match (b.get(at), b.get(at + 1)) {
        (Some(&lo), Some(&hi)) => u16::from_le_bytes([lo, hi]),
        _ => 0,
    }
}

// ───────────────────────────────────────────────────────────────
// Controller core (event side)
// ───────────────────────────────────────────────────────────────

pub struct ControllerCore<R> {
    config: LinkConfig,
    tick: Duration,
    state: ControllerState,
    init_step: InitStep,
    adv_step: AdvStep,
    expected_opcode: u16,
    ready: bool,

    name: DeviceName,
    name_changed: bool,
    address: [u8; 6],
    plane_mode: bool,
    adv_enable: bool,
    adv_request: Option<bool>,
    advertising_enabled: bool,

    handles: ControllerHandles,
    connection: Connection,
    connection_updated: bool,
    notifications_enabled: bool,
    clear_pairing: bool,
    pairing: PairingBridge<R>,

    transport: ChunkedApduTransport<NegotiatedBle>,
    tx_data: Vec<u8, APDU_CAPACITY>,
    chunk_in_flight: bool,
    wait_write_resp_ack: bool,
    pending: Option<PendingNotify>,
    xfer_timeout: Deadline,

    outbox: Deque<Command, OUTBOX_DEPTH>,
}

impl<R: RandomSource> ControllerCore<R> {
    pub fn new(config: LinkConfig, rng: R, name: &str, address: [u8; 6], plane_mode: bool) -> Self {
        let layout = NegotiatedBle::new(config.default_chunk_len(), config.max_mtu);
        Self {
            tick: Duration::from_millis(u64::from(config.tick_ms)),
            state: ControllerState::Idle,
            init_step: InitStep::Idle,
            adv_step: AdvStep::Idle,
            expected_opcode: opcode::ANY,
            ready: false,
            name: clip_name(name),
            name_changed: false,
            address,
            plane_mode,
            adv_enable: !plane_mode,
            adv_request: None,
            advertising_enabled: false,
            handles: ControllerHandles::default(),
            connection: Connection::none(),
            connection_updated: false,
            notifications_enabled: false,
            clear_pairing: false,
            pairing: PairingBridge::new(rng),
            transport: ChunkedApduTransport::new(layout),
            tx_data: Vec::new(),
            chunk_in_flight: false,
            wait_write_resp_ack: false,
            pending: None,
            xfer_timeout: Deadline::new(),
            outbox: Deque::new(),
            config,
        }
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn init_step(&self) -> InitStep {
        self.init_step
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn handles(&self) -> ControllerHandles {
        self.handles
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled
    }

    pub fn advertising_enabled(&self) -> bool {
        self.advertising_enabled
    }

    pub fn transport(&self) -> &ChunkedApduTransport<NegotiatedBle> {
        &self.transport
    }

    pub fn pairing(&self) -> &PairingBridge<R> {
        &self.pairing
    }

    pub fn next_command(&mut self) -> Option<Command> {
        self.outbox.pop_front()
    }

    /// The platform gave up writing `op`. A step machine waiting on it
    /// would never advance, so bring-up stops in [`ControllerState::Failed`].
    pub fn command_dropped(&mut self, op: u16) {
        match self.state {
            ControllerState::Initializing | ControllerState::ConfigureAdvertising => {
                warn!("BLE: bring-up stalled on opcode 0x{:04X}", op);
                self.state = ControllerState::Failed;
                self.ready = false;
                self.outbox.clear();
            }
            // A lost notification is covered by the transfer timeout.
            _ => {}
        }
    }

    // ── Commands ──────────────────────────────────────────────

    fn send(&mut self, op: u16, params: &[u8]) {
        match frame_command(op, params) {
            Ok(frame) => {
                if self.outbox.push_back(frame).is_err() {
                    warn!("HCI: outbox full, dropping opcode 0x{:04X}", op);
                }
            }
            Err(e) => warn!("HCI: cannot frame opcode 0x{:04X} ({})", op, e),
        }
    }

    /// Issue `op` as the command the current step waits for.
    fn send_step(&mut self, op: u16, params: &[u8]) {
        self.expected_opcode = op;
        self.send(op, params);
    }

    fn update_char_value(&mut self, service: u16, handle: u16, value: &[u8]) {
        let mut p: Vec<u8, { 6 + APDU_CAPACITY }> = Vec::new();
        let _ = p.extend_from_slice(&service.to_le_bytes());
        let _ = p.extend_from_slice(&handle.to_le_bytes());
        let _ = p.extend_from_slice(&[0x00, value.len() as u8]);
        let _ = p.extend_from_slice(value);
        self.send(opcode::GATT_UPDATE_CHAR_VALUE, &p);
    }

    fn add_char(&mut self, uuid: &Uuid128, props: u8, mask: u8) {
        let mut p: Vec<u8, 26> = Vec::new();
        let _ = p.extend_from_slice(&self.handles.service.to_le_bytes());
        let _ = p.push(gatt::UUID_TYPE_128);
        let _ = p.extend_from_slice(uuid);
        let _ = p.extend_from_slice(&u16::from(self.config.max_mtu).to_le_bytes());
        let _ = p.extend_from_slice(&[
            props,
            gatt::perm::AUTHEN_WRITE,
            mask,
            gatt::ENCRYPTION_KEY_SIZE,
            gatt::VALUE_LEN_VARIABLE,
        ]);
        self.send_step(opcode::GATT_ADD_CHAR, &p);
    }

    fn advertising_enable(&mut self, enable: bool) {
        if enable {
            let name = gatt::local_name_field(&self.name);
            let mut p: Vec<u8, 48> = Vec::new();
            let _ = p.push(ADV_IND);
            let _ = p.extend_from_slice(&self.config.adv_interval_min.to_le_bytes());
            let _ = p.extend_from_slice(&self.config.adv_interval_max.to_le_bytes());
            let _ = p.extend_from_slice(&[RANDOM_ADDR, NO_WHITE_LIST_USE, name.len() as u8]);
            let _ = p.extend_from_slice(&name);
            let _ = p.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
            self.send(opcode::GAP_SET_DISCOVERABLE, &p);
        } else {
            self.send(opcode::GAP_SET_NON_DISCOVERABLE, &[]);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Restart the controller from `RESET`. A pending clear-pairing request
    /// survives and is honoured at the end of init.
    pub fn begin_init(&mut self) {
        info!("BLE: init start");
        self.ready = false;
        self.state = ControllerState::Initializing;
        self.init_step = InitStep::Idle;
        self.adv_step = AdvStep::Idle;
        self.expected_opcode = opcode::ANY;
        self.adv_request = None;
        self.advertising_enabled = false;
        self.handles = ControllerHandles::default();
        self.connection = Connection::none();
        self.connection_updated = false;
        self.notifications_enabled = false;
        self.reset_transfer();
        self.transport.layout_mut().reset_mtu(self.config.default_chunk_len());
        self.outbox.clear();
        self.init_step_machine(opcode::ANY, &[]);
    }

    fn init_step_machine(&mut self, op: u16, ret: &[u8]) {
        if self.expected_opcode != opcode::ANY && op != self.expected_opcode {
            debug!("BLE: init ignores opcode 0x{:04X}", op);
            return;
        }

        match self.init_step {
            InitStep::GapInit if ret.len() >= 7 => {
                self.handles.gap_service = le16(ret, 1);
                self.handles.gap_dev_name = le16(ret, 3);
                self.handles.gap_appearance = le16(ret, 5);
            }
            InitStep::AddService if ret.len() >= 3 => self.handles.service = le16(ret, 1),
            InitStep::AddNotifyChar if ret.len() >= 3 => self.handles.notify = le16(ret, 1),
            InitStep::AddWriteChar if ret.len() >= 3 => self.handles.write = le16(ret, 1),
            InitStep::AddWriteCmdChar if ret.len() >= 3 => self.handles.write_cmd = le16(ret, 1),
            InitStep::ConfigureAdvertising => {
                self.adv_enable = !self.plane_mode;
                self.adv_step_machine(op);
                if self.adv_step != AdvStep::End {
                    return;
                }
            }
            _ => {}
        }

        self.init_step = self.init_step.next();
        match self.init_step {
            InitStep::Reset => self.send_step(opcode::RESET, &[]),
            InitStep::StaticAddress => {
                let mut p = [0u8; 8];
                p[0] = CONFIG_RANDOM_ADDRESS_OFFSET;
                p[1] = 6;
                p[2..].copy_from_slice(&self.address);
                self.send_step(opcode::HAL_WRITE_CONFIG_DATA, &p);
            }
            InitStep::GattInit => self.send_step(opcode::GATT_INIT, &[]),
            InitStep::GapInit => {
                self.send_step(opcode::GAP_INIT, &[GAP_PERIPHERAL_ROLE, 0x00, DEVICE_NAME_MAX as u8]);
            }
            InitStep::IoCapability => {
                self.send_step(opcode::GAP_SET_IO_CAPABILITY, &[IO_CAP_DISPLAY_YES_NO]);
            }
            InitStep::AuthRequirements => {
                // Bonding, MITM, secure connections optional, no keypress,
                // no fixed pin, static random identity address.
                let mut p = [0u8; 12];
                p[..7].copy_from_slice(&[0x01, 0x01, 0x01, 0x00, MIN_KEY_SIZE, gatt::ENCRYPTION_KEY_SIZE, 0x01]);
                p[11] = RANDOM_ADDR;
                self.send_step(opcode::GAP_SET_AUTH_REQUIREMENT, &p);
            }
            InitStep::AddService => {
                let mut p = [0u8; 19];
                p[0] = gatt::UUID_TYPE_128;
                p[1..17].copy_from_slice(&gatt::SERVICE_UUID);
                p[17] = gatt::PRIMARY_SERVICE;
                p[18] = SERVICE_RECORDS;
                self.send_step(opcode::GATT_ADD_SERVICE, &p);
            }
            InitStep::AddNotifyChar => {
                self.add_char(&gatt::NOTIFY_CHAR_UUID, prop::NOTIFY, gatt::notify_mask::NONE);
            }
            InitStep::AddWriteChar => {
                self.add_char(&gatt::WRITE_CHAR_UUID, prop::WRITE, gatt::notify_mask::WRITE_REQ_AND_WAIT);
            }
            InitStep::AddWriteCmdChar => self.add_char(
                &gatt::WRITE_CMD_CHAR_UUID,
                prop::WRITE_WITHOUT_RESP,
                gatt::notify_mask::ATTRIBUTE_WRITE,
            ),
            InitStep::TxPower => {
                self.send_step(opcode::HAL_SET_TX_POWER_LEVEL, &[0x01, self.config.tx_power_level]);
            }
            InitStep::ConfigureAdvertising => {
                self.expected_opcode = opcode::ANY;
                self.adv_step = AdvStep::Idle;
                self.adv_enable = !self.plane_mode;
                self.adv_step_machine(opcode::ANY);
            }
            InitStep::End => {
                info!("BLE: init end");
                if self.clear_pairing {
                    self.clear_pairing = false;
                    self.send(opcode::GAP_CLEAR_SECURITY_DB, &[]);
                }
                self.ready = true;
                self.state = ControllerState::Ready;
            }
            InitStep::Idle => {}
        }
    }

    fn adv_step_machine(&mut self, op: u16) {
        if self.expected_opcode != opcode::ANY && op != self.expected_opcode {
            debug!("BLE: advertising ignores opcode 0x{:04X}", op);
            return;
        }

        match self.adv_step {
            AdvStep::Idle => {
                self.connection.handle = NO_CONNECTION;
                self.advertising_enabled = false;
                debug!("BLE: configure advertising");
            }
            AdvStep::Start => self.advertising_enabled = true,
            _ => {}
        }

        self.adv_step = self.adv_step.next();
        if self.adv_step == AdvStep::Start && !self.adv_enable {
            self.adv_step = AdvStep::End;
        }

        match self.adv_step {
            AdvStep::SetAdvData => {
                let data = gatt::adv_data(&self.name);
                let mut p: Vec<u8, 32> = Vec::new();
                let _ = p.push(data.len() as u8);
                let _ = p.extend_from_slice(&data);
                self.send_step(opcode::GAP_UPDATE_ADV_DATA, &p);
            }
            AdvStep::SetScanResponse => {
                let data = gatt::scan_response(
                    &gatt::SERVICE_UUID,
                    self.config.conn_interval_min,
                    self.config.conn_interval_max,
                );
                let mut p = [0u8; 32];
                p[0] = data.len() as u8;
                p[1..=data.len()].copy_from_slice(&data);
                self.send_step(opcode::LE_SET_SCAN_RESPONSE_DATA, &p);
            }
            AdvStep::SetGapDeviceName => {
                self.expected_opcode = opcode::GATT_UPDATE_CHAR_VALUE;
                let (svc, h) = (self.handles.gap_service, self.handles.gap_dev_name);
                let name = self.name.clone();
                self.update_char_value(svc, h, name.as_bytes());
            }
            AdvStep::Start => {
                self.expected_opcode = opcode::GAP_SET_DISCOVERABLE;
                self.advertising_enable(true);
            }
            AdvStep::End => {
                debug!("BLE: advertising configured");
                if self.state == ControllerState::ConfigureAdvertising {
                    self.state = ControllerState::Ready;
                }
            }
            AdvStep::Idle => {}
        }
    }

    /// Re-arm advertising after a disconnect. A renamed device rebuilds
    /// its payloads; otherwise only discoverability is restarted.
    fn start_advertising(&mut self) {
        self.state = ControllerState::ConfigureAdvertising;
        self.adv_step = if self.name_changed {
            self.name_changed = false;
            AdvStep::Idle
        } else {
            AdvStep::SetGapDeviceName
        };
        self.expected_opcode = opcode::ANY;
        self.adv_enable = !self.plane_mode;
        self.adv_step_machine(opcode::ANY);
    }

    pub fn enable_advertising(&mut self, enable: bool) {
        if !self.ready {
            return;
        }
        if self.name_changed && !enable && self.connection.is_connected() {
            self.name_changed = false;
            return;
        }
        self.adv_request = Some(enable);
        self.advertising_enable(enable);
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.name = clip_name(name);
        self.name_changed = true;
    }

    pub fn set_plane_mode(&mut self, on: bool) {
        self.plane_mode = on;
    }

    /// Forget every bonded host. While connected the controller is
    /// re-initialised first and the database is cleared at the end of init.
    pub fn reset_pairings(&mut self) {
        if !self.ready {
            return;
        }
        if self.connection.is_connected() {
            self.clear_pairing = true;
            self.begin_init();
        } else {
            self.send(opcode::GAP_CLEAR_SECURITY_DB, &[]);
        }
    }

    pub fn pairing_response(&mut self, resp: UxResponse) {
        let conn = self.connection.handle.to_le_bytes();
        match self.pairing.respond(resp) {
            Some(PairingReply::Passkey(code)) => {
                let mut p = [0u8; 6];
                p[..2].copy_from_slice(&conn);
                p[2..].copy_from_slice(&code.to_le_bytes());
                self.send(opcode::GAP_PASS_KEY_RESP, &p);
            }
            Some(PairingReply::Confirm(yes)) => {
                self.send(opcode::GAP_NUMERIC_COMPARISON_VALUE_CONFIRM, &[conn[0], conn[1], u8::from(yes)]);
            }
            None => debug!("BLE: UX response without pairing request"),
        }
    }

    pub fn next_pairing_event(&self) -> Option<PairingUxEvent> {
        self.pairing.next_event()
    }

    // ── APDU ──────────────────────────────────────────────────

    pub fn apdu_poll(&mut self) -> Option<usize> {
        self.transport.take_complete()
    }

    pub fn apdu(&self) -> &[u8] {
        self.transport.apdu()
    }

    /// Queue `resp` for notification. Chunks after the first go out as the
    /// controller acknowledges each one.
    pub fn apdu_send(&mut self, resp: &[u8]) -> Result<(), SendError> {
        if !self.connection.is_connected() {
            return Err(SendError::Link(TxError::NotConnected));
        }
        self.transport.begin_send(resp.len())?;
        self.tx_data.clear();
        if self.tx_data.extend_from_slice(resp).is_err() {
            self.transport.finish_send();
            return Err(SendError::TooLong { len: resp.len() });
        }
        if let Some(first) = self.transport.next_chunk(&self.tx_data) {
            self.queue_notify(first, true);
        }
        Ok(())
    }

    fn queue_notify(&mut self, chunk: Chunk, apdu: bool) {
        if self.wait_write_resp_ack {
            self.pending = Some(PendingNotify { chunk, apdu });
        } else {
            self.notify(&chunk, apdu);
        }
    }

    fn notify(&mut self, chunk: &[u8], apdu: bool) {
        if apdu {
            self.chunk_in_flight = true;
            self.xfer_timeout.arm(Duration::from_millis(u64::from(self.config.xfer_timeout_ms)));
        }
        let (svc, h) = (self.handles.service, self.handles.notify);
        self.update_char_value(svc, h, chunk);
    }

    /// `ACI_GATT_UPDATE_CHAR_VALUE` completed.
    fn on_notify_complete(&mut self) {
        if !self.chunk_in_flight {
            return;
        }
        self.chunk_in_flight = false;

        if self.transport.is_sending() {
            if let Some(next) = self.transport.next_chunk(&self.tx_data) {
                self.notify(&next, true);
                return;
            }
        }

        let aborted = !self.transport.is_sending();
        self.transport.finish_send();
        self.tx_data.clear();
        self.xfer_timeout.cancel();
        if aborted {
            debug!("APDU: send abandoned by host");
            return;
        }
        debug!("APDU: response sent");

        let interval_min = self.config.conn_interval_min;
        if !self.connection_updated && self.connection.interval > interval_min {
            self.connection_updated = true;
            let mut p = [0u8; 10];
            p[..2].copy_from_slice(&self.connection.handle.to_le_bytes());
            p[2..4].copy_from_slice(&interval_min.to_le_bytes());
            p[4..6].copy_from_slice(&interval_min.to_le_bytes());
            p[6..8].copy_from_slice(&self.connection.latency.to_le_bytes());
            // Supervision timeout in 10 ms units.
            let supervision = u16::try_from(self.config.conn_param_timeout_ms / 10).unwrap_or(u16::MAX);
            p[8..].copy_from_slice(&supervision.to_le_bytes());
            self.send(opcode::L2CAP_CONNECTION_PARAMETER_UPDATE_REQ, &p);
        }
    }

    fn reset_transfer(&mut self) {
        self.transport.reset();
        self.transport.finish_send();
        self.tx_data.clear();
        self.chunk_in_flight = false;
        self.wait_write_resp_ack = false;
        self.pending = None;
        self.xfer_timeout.clear();
    }

    /// Run one host chunk through the transport.
    fn feed(&mut self, chunk: &[u8]) {
        match self.transport.receive(chunk) {
            Ok(RxEvent::Reply(reply)) => self.queue_notify(reply, false),
            Ok(RxEvent::ChannelRequest { channel }) => {
                let reply = self.transport.control_header(channel, tag::ALLOCATE_CHANNEL);
                self.queue_notify(reply, false);
            }
            Ok(RxEvent::Complete(len)) => debug!("BLE: APDU complete ({} bytes)", len),
            Ok(RxEvent::Reset) => {
                debug!("BLE: host abort");
                if !self.chunk_in_flight {
                    self.transport.finish_send();
                    self.tx_data.clear();
                    self.xfer_timeout.cancel();
                }
            }
            Ok(_) => {}
            Err(e) => debug!("BLE: chunk dropped ({})", e),
        }
    }

    // ── Event handlers ────────────────────────────────────────

    fn on_command_complete(&mut self, pkt: &EventPacket) {
        let Some(op) = pkt.opcode() else {
            return;
        };
        match self.state {
            ControllerState::Initializing => self.init_step_machine(op, pkt.return_params()),
            ControllerState::ConfigureAdvertising => self.adv_step_machine(op),
            ControllerState::Failed => {}
            ControllerState::Idle | ControllerState::Ready => match op {
                opcode::GATT_WRITE_RESP => {
                    if self.wait_write_resp_ack {
                        self.wait_write_resp_ack = false;
                        if let Some(p) = self.pending.take() {
                            self.notify(&p.chunk, p.apdu);
                        }
                    }
                }
                opcode::GATT_UPDATE_CHAR_VALUE => self.on_notify_complete(),
                opcode::GAP_SET_NON_DISCOVERABLE | opcode::GAP_SET_DISCOVERABLE => {
                    self.on_advertising_toggled();
                }
                other => debug!("BLE: command complete 0x{:04X}", other),
            },
        }
    }

    fn on_advertising_toggled(&mut self) {
        let disabling = self.adv_request.take() == Some(false);
        if self.connection.is_connected() {
            if disabling {
                // Disabling BLE while connected drops the link.
                self.pairing.end(PairingStatus::Failed);
                self.begin_init();
            }
        } else if disabling {
            self.advertising_enabled = false;
            if self.name_changed {
                self.start_advertising();
            }
        } else {
            self.advertising_enabled = true;
        }
    }

    fn on_le_meta(&mut self, pkt: &EventPacket) {
        let p = pkt.params();
        let Some(&sub) = p.first() else {
            return;
        };
        match sub {
            le_subevent::CONNECTION_COMPLETE | le_subevent::ENHANCED_CONNECTION_COMPLETE => {
                if p.get(1).copied().unwrap_or(0xFF) != 0 {
                    return;
                }
                // Enhanced form carries two resolvable addresses first.
                let base = if sub == le_subevent::CONNECTION_COMPLETE { 12 } else { 24 };
                self.connection = Connection {
                    handle: le16(p, 2),
                    interval: le16(p, base),
                    latency: le16(p, base + 2),
                    supervision_timeout: le16(p, base + 4),
                    ..Connection::none()
                };
                info!(
                    "BLE: client connected (handle=0x{:04X}, interval={})",
                    self.connection.handle, self.connection.interval
                );
                self.transport.layout_mut().reset_mtu(self.config.default_chunk_len());
                self.reset_transfer();
                self.notifications_enabled = false;
                self.advertising_enabled = false;
                self.connection_updated = false;
            }
            le_subevent::CONNECTION_UPDATE_COMPLETE => {
                self.connection.handle = le16(p, 2);
                self.connection.interval = le16(p, 4);
                self.connection.latency = le16(p, 6);
                self.connection.supervision_timeout = le16(p, 8);
                debug!("BLE: connection update (interval={})", self.connection.interval);
            }
            le_subevent::DATA_LENGTH_CHANGE if le16(p, 1) == self.connection.handle => {
                self.connection.max_tx_octets = le16(p, 3);
                self.connection.max_tx_time = le16(p, 5);
                self.connection.max_rx_octets = le16(p, 7);
                self.connection.max_rx_time = le16(p, 9);
            }
            le_subevent::PHY_UPDATE_COMPLETE if le16(p, 2) == self.connection.handle => {
                self.connection.tx_phy = p.get(4).copied().unwrap_or(0);
                self.connection.rx_phy = p.get(5).copied().unwrap_or(0);
            }
            other => debug!("BLE: LE meta 0x{:02X}", other),
        }
    }

    fn on_disconnect(&mut self, p: &[u8]) {
        let reason = p.get(3).copied().unwrap_or(0);
        info!("BLE: client disconnected (reason=0x{:02X})", reason);
        self.connection = Connection::none();
        self.advertising_enabled = false;
        self.notifications_enabled = false;
        self.reset_transfer();
        self.pairing.end(PairingStatus::Failed);
        if reason == REASON_INSTANT_PASSED {
            self.begin_init();
        } else {
            self.start_advertising();
        }
    }

    fn on_encryption_change(&mut self, p: &[u8]) {
        if le16(p, 1) != self.connection.handle {
            return;
        }
        self.connection.encrypted = p.get(3).copied().unwrap_or(0) != 0;
        debug!("BLE: link encrypted: {}", self.connection.encrypted);
    }

    fn on_vendor(&mut self, pkt: &EventPacket) {
        let Some(code) = pkt.vendor_code() else {
            return;
        };
        let data = pkt.vendor_data();
        if data.len() < 2 || le16(data, 0) != self.connection.handle {
            return;
        }
        match code {
            vendor::PAIRING_COMPLETE => {
                let status = data.get(2).copied().unwrap_or(0xFF);
                let reason = data.get(3).copied().unwrap_or(0);
                self.pairing.pairing_complete(status, reason);
            }
            vendor::PASS_KEY_REQUEST => self.pairing.passkey_request(),
            vendor::NUMERIC_COMPARISON => {
                let value = u32::from(le16(data, 2)) | (u32::from(le16(data, 4)) << 16);
                self.pairing.numeric_comparison(value);
            }
            vendor::ATTRIBUTE_MODIFIED => self.on_attribute_modified(data),
            vendor::EXCHANGE_MTU_RESP => {
                let att_mtu = le16(data, 2);
                self.transport.layout_mut().set_att_mtu(att_mtu);
                info!("BLE: MTU {} (chunk {})", att_mtu, self.transport.chunk_len());
            }
            vendor::WRITE_PERMIT_REQ => self.on_write_permit(data),
            vendor::INDICATION => {
                let conn = self.connection.handle.to_le_bytes();
                self.send(opcode::GATT_CONFIRM_INDICATION, &conn);
            }
            vendor::PROCEDURE_TIMEOUT => {
                warn!("BLE: GATT procedure timeout");
                self.pairing.end(PairingStatus::Failed);
                self.begin_init();
            }
            vendor::L2CAP_CONNECTION_UPDATE_RESP => {
                debug!("BLE: connection update response {}", data.get(2).copied().unwrap_or(0));
            }
            other => debug!("BLE: vendor event 0x{:04X}", other),
        }
    }

    /// `[conn LE][attr LE][offset LE][len LE][value]`
    fn on_attribute_modified(&mut self, data: &[u8]) {
        if data.len() < 8 {
            return;
        }
        let attr = le16(data, 2);
        let offset = le16(data, 4);
        let len = usize::from(le16(data, 6));
        let value = data.get(8..8 + len).unwrap_or(&data[8..]);

        if attr == self.handles.notify.wrapping_add(2) && len == 2 && offset == 0 {
            if le16(value, 0) != 0 {
                info!("BLE: notifications enabled");
                self.notifications_enabled = true;
                if !self.transport.layout().is_negotiated() {
                    let conn = self.connection.handle.to_le_bytes();
                    self.send(opcode::GATT_EXCHANGE_CONFIG, &conn);
                }
            } else {
                info!("BLE: notifications disabled");
                self.notifications_enabled = false;
            }
        } else if attr == self.handles.write_cmd.wrapping_add(1) && self.accepts_writes() && !value.is_empty() {
            self.feed(value);
        } else {
            debug!("BLE: attribute 0x{:04X} modified ({} bytes)", attr, len);
        }
    }

    /// `[conn LE][attr LE][len][value]`
    fn on_write_permit(&mut self, data: &[u8]) {
        if data.len() < 5 {
            return;
        }
        let conn = le16(data, 0);
        let attr = le16(data, 2);
        let len = usize::from(data[4]);
        let value = data.get(5..5 + len).unwrap_or(&data[5..]);

        // Replies produced by this write go out after the write response.
        self.wait_write_resp_ack = true;
        if attr == self.handles.write.wrapping_add(1) && self.accepts_writes() && !value.is_empty() {
            self.feed(value);
        } else {
            debug!("BLE: write to 0x{:04X} ({} bytes)", attr, value.len());
        }

        let mut p: Vec<u8, { 7 + APDU_CAPACITY }> = Vec::new();
        let _ = p.extend_from_slice(&conn.to_le_bytes());
        let _ = p.extend_from_slice(&attr.to_le_bytes());
        let _ = p.extend_from_slice(&[0x00, 0x00, value.len() as u8]);
        let _ = p.extend_from_slice(value);
        self.send(opcode::GATT_WRITE_RESP, &p);
    }

    fn accepts_writes(&self) -> bool {
        self.notifications_enabled && self.connection.encrypted
    }
}

impl<R: RandomSource> AsyncEventHandler for ControllerCore<R> {
    fn on_async_event(&mut self, pkt: &EventPacket) {
        match pkt.kind() {
            EventKind::CommandComplete => self.on_command_complete(pkt),
            EventKind::CommandStatus => debug!("BLE: command status {:?}", pkt.status()),
            EventKind::LeMeta(_) => self.on_le_meta(pkt),
            EventKind::HardwareError => {
                warn!("BLE: controller hardware error, re-initialising");
                self.begin_init();
            }
            EventKind::Asynchronous => match pkt.code() {
                event::DISCONNECTION_COMPLETE => self.on_disconnect(pkt.params()),
                event::ENCRYPTION_CHANGE => self.on_encryption_change(pkt.params()),
                event::VENDOR => self.on_vendor(pkt),
                other => debug!("BLE: event 0x{:02X}", other),
            },
        }
    }

    fn on_tick(&mut self) {
        if self.xfer_timeout.tick(self.tick) == DeadlineState::Expired {
            warn!("APDU: notification not acknowledged, resetting transport");
            self.reset_transfer();
        }
    }
}

fn clip_name(name: &str) -> DeviceName {
    let mut out = DeviceName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────
// Controller adapter
// ───────────────────────────────────────────────────────────────

/// Newer controller link: step-machine init, acknowledged notifications.
pub struct BleController<P, R, D> {
    port: P,
    delay: D,
    correlator: Correlator,
    core: ControllerCore<R>,
}

impl<P, R, D> BleController<P, R, D>
where
    P: HciTransport + Dispatcher,
    R: RandomSource,
    D: DelayNs,
{
    pub fn new<S: SerialSource>(port: P, rng: R, delay: D, serial: &S, name: &str, config: LinkConfig) -> Self {
        let address = gatt::random_static_address(&serial.serial());
        let tick = Duration::from_millis(u64::from(config.tick_ms));
        Self {
            port,
            delay,
            correlator: Correlator::new(tick),
            core: ControllerCore::new(config, rng, name, address, serial.plane_mode()),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    pub fn core(&self) -> &ControllerCore<R> {
        &self.core
    }

    pub fn state(&self) -> ControllerState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Start (or restart) the init step machine.
    pub fn init(&mut self) {
        self.core.begin_init();
        self.flush();
    }

    /// Pump one platform event. Returns `false` once the dispatcher has
    /// nothing more.
    pub fn process_event(&mut self) -> bool {
        match self.port.dispatch_one_event() {
            None => return false,
            Some(PlatformEvent::Hci(raw)) => {
                if let Err(e) = self.correlator.on_packet(raw, &mut self.core) {
                    warn!("BLE: dropped HCI packet ({})", e);
                }
            }
            Some(PlatformEvent::Tick) => self.core.on_tick(),
            Some(other) => self.core.on_unrouted(other),
        }
        self.flush();
        true
    }

    /// Deliver one HCI packet received outside the dispatcher.
    pub fn handle_packet(&mut self, raw: &[u8]) {
        if let Err(e) = self.correlator.on_packet(raw, &mut self.core) {
            warn!("BLE: dropped HCI packet ({})", e);
        }
        self.flush();
    }

    pub fn tick(&mut self) {
        self.core.on_tick();
        self.flush();
    }

    pub fn apdu_send(&mut self, resp: &[u8]) -> Result<(), SendError> {
        let result = self.core.apdu_send(resp);
        self.flush();
        result
    }

    pub fn apdu_poll(&mut self) -> Option<usize> {
        self.core.apdu_poll()
    }

    pub fn apdu(&self) -> &[u8] {
        self.core.apdu()
    }

    pub fn enable_advertising(&mut self, enable: bool) {
        self.core.enable_advertising(enable);
        self.flush();
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.core.set_device_name(name);
    }

    pub fn set_plane_mode(&mut self, on: bool) {
        self.core.set_plane_mode(on);
    }

    pub fn reset_pairings(&mut self) {
        self.core.reset_pairings();
        self.flush();
    }

    pub fn pairing_response(&mut self, resp: UxResponse) {
        self.core.pairing_response(resp);
        self.flush();
    }

    pub fn next_pairing_event(&self) -> Option<PairingUxEvent> {
        self.core.next_pairing_event()
    }

    fn flush(&mut self) {
        while let Some(frame) = self.core.next_command() {
            if let Err(e) = self.write_command(&frame) {
                let op = u16::from_le_bytes([frame[1], frame[2]]);
                warn!("HCI: opcode 0x{:04X} not written ({})", op, e);
                self.core.command_dropped(op);
            }
        }
    }

    /// Write one frame, backing off while the controller is out of buffers.
    fn write_command(&mut self, frame: &[u8]) -> Result<(), TxError> {
        let policy = self.core.config.controller_retry;
        let mut attempt = 0u16;
        loop {
            match self.port.send_command(frame) {
                Err(TxError::InsufficientResources) if policy.allows(attempt.saturating_add(1)) => {
                    attempt = attempt.saturating_add(1);
                    if let RetryPolicy::Bounded { backoff_us, .. } = policy {
                        self.delay.delay_us(backoff_us);
                    }
                }
                other => return other,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────
