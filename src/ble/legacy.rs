//! Legacy BLE controller adapter.
//!
//! Every controller command is a blocking, correlated HCI request. Link
//! events that arrive while a request is outstanding are handled by
//! [`LegacyCore`] (the [`AsyncEventHandler`]) and anything that needs a
//! command of its own (notifications, write responses, power-cycles) is
//! queued as an [`Action`] and run once the wait unwinds.
//!
//! ```text
//!   host write ──▶ WRITE_PERMIT_REQ ──▶ transport.receive ──▶ Reply ──▶ Action::Notify
//!                        │                                 └─▶ Complete ──▶ apdu_poll()
//!                        └──────────────────────────────────────────────▶ Action::WriteResponse
//!
//!   apdu_send ──▶ next_chunk ──▶ seal ──▶ UPDATE_CHAR_VALUE ──▶ unseal ──▶ flush deferred
//!                                              │ 0x64
//!                                              └─▶ wait TX_POOL_AVAILABLE (RetryPolicy)
//! ```

use embassy_time::Duration;
use embedded_hal::delay::DelayNs;
use heapless::{Deque, Vec};
use log::{debug, info, warn};

use super::gatt::{self, prop, LegacyName, Uuid128};
use crate::apdu::{Chunk, ChunkedApduTransport, LegacyBle, RxEvent, MAX_CHUNK_LEN};
use crate::app::ports::{
    AsyncEventHandler, Dispatcher, HciTransport, PlatformEvent, RadioPower, SerialSource,
};
use crate::config::{LinkConfig, RetryPolicy};
use crate::deadline::{Deadline, DeadlineState};
use crate::error::{HciError, SendError, TxError};
use crate::hci::{
    event, le_subevent, opcode, vendor, CommandRequest, Correlator, EventPacket,
    STATUS_INSUFFICIENT_RESOURCES,
};

// ── Constants ────────────────────────────────────────────────

/// Name written to the GAP device-name characteristic.
const GAP_DEVICE_NAME: &str = "Ledger";
const GAP_PERIPHERAL_ROLE: u8 = 0x01;
/// Longest GAP device name the controller reserves room for.
const GAP_NAME_MAX: u8 = 7;

const FIXED_PIN: u32 = 1337;
const MIN_KEY_SIZE: u8 = 7;
const USE_FIXED_PIN: u8 = 0x00;

const CONFIG_PUBADDR_OFFSET: u8 = 0x00;
const SERVICE_RECORDS: u8 = 7;

// Low-power advertising: 312 .. 1875 units of 0.625 ms (195 ms .. 1171.875 ms).
const ADV_INTERVAL_MIN: u16 = (500u32 * 625 / 1000) as u16;
const ADV_INTERVAL_MAX: u16 = (3000u32 * 625 / 1000) as u16;
// Connection: 7 .. 62 units of 1.25 ms.
const CONN_INTERVAL_MIN: u16 = (6u32 * 1250 / 1000) as u16;
const CONN_INTERVAL_MAX: u16 = (50u32 * 1250 / 1000) as u16;
const ADV_IND: u8 = 0x00;
const PUBLIC_ADDR: u8 = 0x00;
const NO_WHITE_LIST_USE: u8 = 0x00;

/// CCCD value enabling notifications.
const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];

const ACTION_DEPTH: usize = 4;

// ───────────────────────────────────────────────────────────────
// Link state
// ───────────────────────────────────────────────────────────────

/// Attribute handles returned by the controller during setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyHandles {
    pub gap_service: u16,
    pub gap_dev_name: u16,
    pub gap_appearance: u16,
    pub service: u16,
    pub tx: u16,
    pub rx: u16,
}

/// Work produced by an event handler that needs a command of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Notify(Chunk),
    WriteResponse { conn: u16, attr: u16, data: Chunk },
    PowerCycle,
}

/// Event-side state of the legacy link.
pub struct LegacyCore {
    transport: ChunkedApduTransport<LegacyBle>,
    handles: LegacyHandles,
    connection: Option<u16>,
    link_established: bool,
    tx_pool_available: bool,
    connect_timeout: Deadline,
    connect_limit: Duration,
    tick: Duration,
    actions: Deque<Action, ACTION_DEPTH>,
}

impl LegacyCore {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            transport: ChunkedApduTransport::new(LegacyBle::new(config.legacy_chunk_len)),
            handles: LegacyHandles::default(),
            connection: None,
            link_established: false,
            tx_pool_available: false,
            connect_timeout: Deadline::new(),
            connect_limit: Duration::from_millis(u64::from(config.connection_timeout_ms)),
            tick: Duration::from_millis(u64::from(config.tick_ms)),
            actions: Deque::new(),
        }
    }

    pub fn transport(&self) -> &ChunkedApduTransport<LegacyBle> {
        &self.transport
    }

    pub fn handles(&self) -> LegacyHandles {
        self.handles
    }

    pub fn set_handles(&mut self, handles: LegacyHandles) {
        self.handles = handles;
    }

    pub fn connection(&self) -> Option<u16> {
        self.connection
    }

    pub fn is_link_established(&self) -> bool {
        self.link_established
    }

    pub fn connect_timeout(&self) -> &Deadline {
        &self.connect_timeout
    }

    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Forget the connection and every in-flight exchange.
    pub fn reset_link(&mut self) {
        self.connection = None;
        self.link_established = false;
        self.tx_pool_available = false;
        self.connect_timeout.clear();
        self.transport.reset();
        self.actions.clear();
    }

    fn push(&mut self, action: Action) {
        if self.actions.push_back(action).is_err() {
            warn!("BLE: action queue full, dropping");
        }
    }

    fn on_le_meta(&mut self, pkt: &EventPacket) {
        let p = pkt.params();
        if p.first() != Some(&le_subevent::CONNECTION_COMPLETE) || p.len() < 4 {
            return;
        }
        if p[1] != 0 {
            warn!("BLE: connection failed (0x{:02X})", p[1]);
            return;
        }
        let handle = u16::from_le_bytes([p[2], p[3]]);
        info!("BLE: client connected (handle=0x{:04X})", handle);
        self.connection = Some(handle);
        self.link_established = false;
        self.connect_timeout.arm(self.connect_limit);
    }

    fn on_vendor(&mut self, pkt: &EventPacket) {
        let Some(code) = pkt.vendor_code() else {
            return;
        };
        let data = pkt.vendor_data();
        match code {
            vendor::ATTRIBUTE_MODIFIED => self.on_attribute_modified(data),
            vendor::WRITE_PERMIT_REQ => self.on_write_permit(data),
            vendor::TX_POOL_AVAILABLE => self.tx_pool_available = true,
            other => debug!("BLE: vendor event 0x{:04X}", other),
        }
    }

    /// `[conn LE][attr LE][len][offset LE][value]`
    fn on_attribute_modified(&mut self, data: &[u8]) {
        if data.len() < 7 {
            return;
        }
        let attr = u16::from_le_bytes([data[2], data[3]]);
        let len = usize::from(data[4]);
        let value = data.get(7..7 + len).unwrap_or(&data[7..]);
        if attr == self.handles.tx.wrapping_add(2) && value == CCCD_NOTIFY {
            info!("BLE: client subscribed");
            self.link_established = true;
        }
    }

    /// `[conn LE][attr LE][len][value]`
    fn on_write_permit(&mut self, data: &[u8]) {
        if data.len() < 5 {
            return;
        }
        let conn = u16::from_le_bytes([data[0], data[1]]);
        let attr = u16::from_le_bytes([data[2], data[3]]);
        let len = usize::from(data[4]);
        let value = data.get(5..5 + len).unwrap_or(&data[5..]);

        if attr == self.handles.rx.wrapping_add(1) && self.link_established {
            self.feed(value);
        }
        let n = value.len().min(MAX_CHUNK_LEN);
        let data = Chunk::from_slice(&value[..n]).unwrap_or_default();
        self.push(Action::WriteResponse { conn, attr, data });
    }

    /// Run one host chunk through the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        match self.transport.receive(chunk) {
            Ok(RxEvent::Reply(reply)) => self.push(Action::Notify(reply)),
            Ok(RxEvent::Complete(len)) => {
                debug!("BLE: APDU complete ({} bytes)", len);
                self.connect_timeout.cancel();
            }
            Ok(_) => {}
            Err(e) => {
                let reply = self
                    .transport
                    .error_reply(e)
                    .and_then(|r| self.transport.queue_reply(r));
                if let Some(reply) = reply {
                    self.push(Action::Notify(reply));
                }
            }
        }
    }
}

impl AsyncEventHandler for LegacyCore {
    fn on_async_event(&mut self, pkt: &EventPacket) {
        match pkt.code() {
            event::DISCONNECTION_COMPLETE => {
                info!("BLE: client disconnected");
                self.reset_link();
                self.push(Action::PowerCycle);
            }
            event::LE_META => self.on_le_meta(pkt),
            event::VENDOR => self.on_vendor(pkt),
            other => debug!("BLE: ignored event 0x{:02X}", other),
        }
    }

    fn on_tick(&mut self) {
        if self.connect_timeout.tick(self.tick) == DeadlineState::Expired {
            warn!("BLE: no APDU within connection timeout, resetting link");
            self.reset_link();
            self.push(Action::PowerCycle);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Link adapter
// ───────────────────────────────────────────────────────────────

/// Legacy controller link: blocking setup, blocking chunk transmit.
pub struct LegacyBleLink<P, D> {
    port: P,
    delay: D,
    correlator: Correlator,
    core: LegacyCore,
    config: LinkConfig,
    name: LegacyName,
    address: [u8; 6],
}

impl<P, D> LegacyBleLink<P, D>
where
    P: HciTransport + Dispatcher + RadioPower,
    D: DelayNs,
{
    pub fn new<S: SerialSource>(port: P, delay: D, serial: &S, config: LinkConfig) -> Self {
        let uid = gatt::legacy_uid(&serial.serial());
        Self {
            port,
            delay,
            correlator: Correlator::new(Duration::from_millis(u64::from(config.tick_ms))),
            core: LegacyCore::new(&config),
            name: gatt::legacy_name(uid),
            address: gatt::legacy_address(uid),
            config,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn core(&self) -> &LegacyCore {
        &self.core
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> [u8; 6] {
        self.address
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Switch the radio. Powering on runs the full setup.
    pub fn power(&mut self, on: bool) -> Result<(), HciError> {
        debug!("BLE: power {}", if on { "on" } else { "off" });
        self.port.set_radio_power(on);
        self.core.reset_link();
        if on { self.setup() } else { Ok(()) }
    }

    /// Define the GATT service and start advertising.
    pub fn setup(&mut self) -> Result<(), HciError> {
        info!("BLE: setup as {}", self.name.as_str());
        self.core.reset_link();

        let mut addr = [0u8; 8];
        addr[0] = CONFIG_PUBADDR_OFFSET;
        addr[1] = 6;
        addr[2..].copy_from_slice(&self.address);
        self.command(opcode::HAL_WRITE_CONFIG_DATA, &addr)?;
        self.command(opcode::GATT_INIT, &[])?;

        let mut gap = [0u8; 7];
        let n = self.request(opcode::GAP_INIT, &[GAP_PERIPHERAL_ROLE, 0, GAP_NAME_MAX], &mut gap)?;
        check_status(&gap[..n])?;
        if n < 7 {
            return Err(HciError::Malformed);
        }
        let mut handles = LegacyHandles {
            gap_service: u16::from_le_bytes([gap[1], gap[2]]),
            gap_dev_name: u16::from_le_bytes([gap[3], gap[4]]),
            gap_appearance: u16::from_le_bytes([gap[5], gap[6]]),
            ..LegacyHandles::default()
        };

        let mut auth: Vec<u8, 26> = Vec::new();
        let _ = auth.extend_from_slice(&[0x00, 0x00]); // no MITM, no OOB
        let _ = auth.extend_from_slice(&[0u8; 16]);
        let _ = auth.extend_from_slice(&[MIN_KEY_SIZE, gatt::ENCRYPTION_KEY_SIZE, USE_FIXED_PIN]);
        let _ = auth.extend_from_slice(&FIXED_PIN.to_le_bytes());
        let _ = auth.push(0x00); // no bonding
        self.command(opcode::GAP_SET_AUTH_REQUIREMENT, &auth)?;

        let mut svc: Vec<u8, 19> = Vec::new();
        let _ = svc.push(gatt::UUID_TYPE_128);
        let _ = svc.extend_from_slice(&gatt::LEGACY_SERVICE_UUID);
        let _ = svc.extend_from_slice(&[gatt::PRIMARY_SERVICE, SERVICE_RECORDS]);
        handles.service = self.handle_request(opcode::GATT_ADD_SERVICE, &svc)?;

        handles.tx = self.add_char(
            handles.service,
            &gatt::LEGACY_TX_CHAR_UUID,
            prop::NOTIFY,
            gatt::notify_mask::NONE,
        )?;
        handles.rx = self.add_char(
            handles.service,
            &gatt::LEGACY_RX_CHAR_UUID,
            prop::WRITE,
            gatt::notify_mask::WRITE_REQ_AND_WAIT,
        )?;
        self.core.set_handles(handles);
        debug!(
            "BLE: service 0x{:04X} tx 0x{:04X} rx 0x{:04X}",
            handles.service, handles.tx, handles.rx
        );

        self.command(opcode::HAL_SET_TX_POWER_LEVEL, &[0x01, self.config.tx_power_level])?;
        self.make_discoverable()
    }

    /// Empty scan response, GAP name and appearance, then `ADV_IND`.
    pub fn make_discoverable(&mut self) -> Result<(), HciError> {
        self.command(opcode::LE_SET_SCAN_RESPONSE_DATA, &[0u8; 32])?;

        let h = self.core.handles;
        if let Err(e) = self.update_char_value(h.gap_service, h.gap_dev_name, GAP_DEVICE_NAME.as_bytes()) {
            warn!("BLE: device name update failed ({})", e);
        }
        let appearance = self.config.appearance.to_le_bytes();
        if let Err(e) = self.update_char_value(h.gap_service, h.gap_appearance, &appearance) {
            warn!("BLE: appearance update failed ({})", e);
        }

        let name = gatt::local_name_field(&self.name);
        let mut p: Vec<u8, 48> = Vec::new();
        let _ = p.push(ADV_IND);
        let _ = p.extend_from_slice(&ADV_INTERVAL_MIN.to_le_bytes());
        let _ = p.extend_from_slice(&ADV_INTERVAL_MAX.to_le_bytes());
        let _ = p.extend_from_slice(&[PUBLIC_ADDR, NO_WHITE_LIST_USE, name.len() as u8]);
        let _ = p.extend_from_slice(&name);
        let _ = p.push(0x00); // no service UUID list
        let _ = p.extend_from_slice(&CONN_INTERVAL_MIN.to_le_bytes());
        let _ = p.extend_from_slice(&CONN_INTERVAL_MAX.to_le_bytes());
        self.command(opcode::GAP_SET_DISCOVERABLE, &p)?;
        info!("BLE: advertising as {}", self.name.as_str());
        Ok(())
    }

    // ── Event loop ────────────────────────────────────────────

    /// Pump one platform event and run the work it queued.
    /// Returns `false` once the dispatcher has nothing more.
    pub fn process_event(&mut self) -> bool {
        if !self.pump() {
            return false;
        }
        self.run_actions();
        true
    }

    fn pump(&mut self) -> bool {
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
        true
    }

    fn run_actions(&mut self) {
        while let Some(action) = self.core.next_action() {
            match action {
                Action::Notify(chunk) => {
                    if let Err(e) = self.notify(&chunk) {
                        warn!("BLE: reply notification failed ({})", e);
                    }
                }
                Action::WriteResponse { conn, attr, data } => {
                    if let Err(e) = self.write_response(conn, attr, &data) {
                        warn!("BLE: write response failed ({})", e);
                    }
                }
                Action::PowerCycle => {
                    let _ = self.power(false);
                    if let Err(e) = self.power(true) {
                        warn!("BLE: setup after power-cycle failed ({})", e);
                    }
                }
            }
        }
    }

    // ── APDU ──────────────────────────────────────────────────

    /// Length of a freshly received APDU, once.
    pub fn apdu_poll(&mut self) -> Option<usize> {
        self.core.transport.take_complete()
    }

    pub fn apdu(&self) -> &[u8] {
        self.core.transport.apdu()
    }

    /// Fragment `resp` into notifications. Blocks until every chunk is
    /// accepted by the controller.
    pub fn apdu_send(&mut self, resp: &[u8]) -> Result<(), SendError> {
        self.core.transport.begin_send(resp.len())?;
        let result = self.send_chunks(resp);
        self.core.transport.finish_send();
        self.flush_deferred();
        self.run_actions();
        match result {
            Ok(()) => debug!("APDU: sent {} bytes", resp.len()),
            Err(e) => warn!("APDU: send failed ({})", e),
        }
        result
    }

    fn send_chunks(&mut self, resp: &[u8]) -> Result<(), SendError> {
        while let Some(chunk) = self.core.transport.next_chunk(resp) {
            self.core.transport.seal()?;
            let sent = self.notify(&chunk);
            self.core.transport.unseal();
            self.flush_deferred();
            self.run_actions();
            sent?;
        }
        Ok(())
    }

    fn flush_deferred(&mut self) {
        if let Some(reply) = self.core.transport.take_deferred() {
            if let Err(e) = self.notify(&reply) {
                warn!("BLE: deferred reply lost ({})", e);
            }
        }
    }

    // ── Controller commands ───────────────────────────────────

    fn notify(&mut self, chunk: &[u8]) -> Result<(), TxError> {
        let h = self.core.handles;
        self.update_char_value(h.service, h.tx, chunk)
    }

    /// `ACI_GATT_UPDATE_CHAR_VALUE`, retried on insufficient resources
    /// under the legacy retry policy.
    fn update_char_value(&mut self, service: u16, handle: u16, value: &[u8]) -> Result<(), TxError> {
        let mut params: Vec<u8, { 6 + MAX_CHUNK_LEN }> = Vec::new();
        let _ = params.extend_from_slice(&service.to_le_bytes());
        let _ = params.extend_from_slice(&handle.to_le_bytes());
        let _ = params.extend_from_slice(&[0x00, value.len() as u8]);
        params.extend_from_slice(value).map_err(|()| TxError::Io)?;

        let policy = self.config.legacy_retry;
        let mut attempt: u16 = 0;
        loop {
            // Consume the pool flag first so a late event is not missed.
            self.core.tx_pool_available = false;
            let mut status = [0u8; 1];
            let n = self
                .request(opcode::GATT_UPDATE_CHAR_VALUE, &params, &mut status)
                .map_err(link_error)?;
            match status[0] {
                _ if n == 0 => return Ok(()),
                0 => return Ok(()),
                STATUS_INSUFFICIENT_RESOURCES => {
                    attempt = attempt.saturating_add(1);
                    if !policy.allows(attempt) {
                        return Err(TxError::RetriesExhausted);
                    }
                    self.wait_tx_pool(policy)?;
                }
                s => return Err(TxError::Status(s)),
            }
        }
    }

    fn wait_tx_pool(&mut self, policy: RetryPolicy) -> Result<(), TxError> {
        match policy {
            RetryPolicy::Unbounded => {
                while !self.core.tx_pool_available {
                    if self.core.connection.is_none() {
                        return Err(TxError::NotConnected);
                    }
                    if !self.pump() {
                        return Err(TxError::Io);
                    }
                }
                Ok(())
            }
            RetryPolicy::Bounded { backoff_us, .. } => {
                self.delay.delay_us(backoff_us);
                Ok(())
            }
        }
    }

    fn write_response(&mut self, conn: u16, attr: u16, data: &[u8]) -> Result<(), HciError> {
        let mut p: Vec<u8, { 7 + MAX_CHUNK_LEN }> = Vec::new();
        let _ = p.extend_from_slice(&conn.to_le_bytes());
        let _ = p.extend_from_slice(&attr.to_le_bytes());
        let _ = p.extend_from_slice(&[0x00, 0x00, data.len() as u8]);
        let _ = p.extend_from_slice(data);
        self.command(opcode::GATT_WRITE_RESP, &p)
    }

    fn add_char(&mut self, service: u16, uuid: &Uuid128, props: u8, mask: u8) -> Result<u16, HciError> {
        let mut p: Vec<u8, 25> = Vec::new();
        let _ = p.extend_from_slice(&service.to_le_bytes());
        let _ = p.push(gatt::UUID_TYPE_128);
        let _ = p.extend_from_slice(uuid);
        let _ = p.extend_from_slice(&[
            self.config.legacy_chunk_len,
            props,
            gatt::perm::NONE,
            mask,
            gatt::ENCRYPTION_KEY_SIZE,
            gatt::VALUE_LEN_VARIABLE,
        ]);
        self.handle_request(opcode::GATT_ADD_CHAR, &p)
    }

    /// A command whose reply is `[status, handle LE]`.
    fn handle_request(&mut self, op: u16, params: &[u8]) -> Result<u16, HciError> {
        let mut reply = [0u8; 3];
        let n = self.request(op, params, &mut reply)?;
        check_status(&reply[..n])?;
        if n < 3 {
            return Err(HciError::Malformed);
        }
        Ok(u16::from_le_bytes([reply[1], reply[2]]))
    }

    fn command(&mut self, op: u16, params: &[u8]) -> Result<(), HciError> {
        let mut status = [0u8; 1];
        let n = self.request(op, params, &mut status)?;
        check_status(&status[..n])
    }

    fn request(&mut self, op: u16, params: &[u8], reply: &mut [u8]) -> Result<usize, HciError> {
        let timeout = Duration::from_millis(u64::from(self.config.hci_timeout_ms));
        let mut req = CommandRequest::complete(op, params, reply, timeout);
        self.correlator.send_request(&mut self.port, &mut self.core, &mut req)
    }
}

fn check_status(reply: &[u8]) -> Result<(), HciError> {
    match reply.first() {
        Some(&s) if s != 0 => Err(HciError::Controller(s)),
        _ => Ok(()),
    }
}

fn link_error(e: HciError) -> TxError {
    match e {
        HciError::Link(tx) => tx,
        _ => TxError::Io,
    }
}

// ── Tests ─────────────────────────────────────────────────────
