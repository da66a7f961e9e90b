//! apdu-link simulator: runs the link layers against in-process mocks.
//!
//! ```text
//! ┌──────────────┐  64-byte reports  ┌─────────────────┐
//! │  host stack  │ ────────────────▶ │ UsbHidTransport │──▶ echo app
//! │ (fragmenter) │ ◀──────────────── │                 │◀──  + 9000
//! └──────────────┘                   └─────────────────┘
//!
//! ┌────────────────┐  HCI commands   ┌───────────────┐
//! │ BleController  │ ──────────────▶ │ FakeController │  auto-acks every
//! │ (step machine) │ ◀────────────── │               │  command complete
//! └────────────────┘  CC events      └───────────────┘
//! ```
//!
//! Usage: `apdu-link-sim [config-path]`. Log level via `RUST_LOG`.
#![deny(unused_must_use)]

// ── Imports ───────────────────────────────────────────────────
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use embedded_hal::delay::DelayNs;
use log::{info, warn};

use apdu_link::apdu::{ChunkedApduTransport, RxEvent, UsbHid};
use apdu_link::app::ports::{
    ChunkSink, ConfigError, ConfigPort, Dispatcher, HciTransport, PlatformEvent, RandomSource,
    SerialSource,
};
use apdu_link::ble::{BleController, ControllerState};
use apdu_link::config::LinkConfig;
use apdu_link::error::{Error, TxError};
use apdu_link::hci::opcode;
use apdu_link::usb::{HidStatus, UsbHidTransport};

// ── Platform mocks ────────────────────────────────────────────

/// `LinkConfig` persisted as postcard bytes in a file.
struct FileConfig {
    path: PathBuf,
}

impl ConfigPort for FileConfig {
    fn load(&self) -> Result<LinkConfig, ConfigError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => LinkConfig::decode(&bytes).map_err(|_| ConfigError::Corrupted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LinkConfig::default()),
            Err(_) => Err(ConfigError::IoError),
        }
    }

    fn save(&mut self, config: &LinkConfig) -> Result<(), ConfigError> {
        config.validate().map_err(|e| match e {
            Error::Config(msg) => ConfigError::ValidationFailed(msg),
            _ => ConfigError::IoError,
        })?;
        let bytes = config.encode().map_err(|_| ConfigError::IoError)?;
        std::fs::write(&self.path, bytes).map_err(|_| ConfigError::IoError)
    }
}

/// xorshift32; good enough for channel ids and passkeys in a simulator.
struct XorShift(u32);

impl RandomSource for XorShift {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

struct SimSerial;

impl SerialSource for SimSerial {
    fn serial(&self) -> [u8; 8] {
        [0x31, 0x41, 0x59, 0x26, 0x53, 0x58, 0x97, 0x93]
    }
}

/// Blocking delay on the host thread.
struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

#[derive(Default)]
struct Wire(Vec<Vec<u8>>);

impl ChunkSink for Wire {
    fn transmit(&mut self, chunk: &[u8]) -> Result<(), TxError> {
        self.0.push(chunk.to_vec());
        Ok(())
    }
}

/// Answers every command with a successful command-complete.
#[derive(Default)]
struct FakeController {
    events: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    commands: usize,
    next_handle: u16,
}

impl FakeController {
    fn handle(&mut self) -> [u8; 2] {
        self.next_handle += 1;
        self.next_handle.to_le_bytes()
    }
}

impl HciTransport for FakeController {
    fn send_command(&mut self, frame: &[u8]) -> Result<(), TxError> {
        if frame.len() < 4 {
            return Err(TxError::Io);
        }
        self.commands += 1;
        let op = u16::from_le_bytes([frame[1], frame[2]]);
        let mut ret = vec![0x00];
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
        let [lo, hi] = op.to_le_bytes();
        let mut evt = vec![0x04, 0x0E, (3 + ret.len()) as u8, 0x01, lo, hi];
        evt.extend_from_slice(&ret);
        self.events.push_back(evt);
        Ok(())
    }
}

impl Dispatcher for FakeController {
    fn dispatch_one_event(&mut self) -> Option<PlatformEvent<'_>> {
        self.current = self.events.pop_front()?;
        Some(PlatformEvent::Hci(&self.current))
    }
}

// ── Scenarios ─────────────────────────────────────────────────

/// One command/response exchange through the USB HID transport.
fn usb_loopback(config: &LinkConfig, command: &[u8]) -> Result<Vec<u8>> {
    let mut host = ChunkedApduTransport::new(UsbHid::new(config.hid_report_len));
    host.session_mut().channel = 0x0101;
    let mut device = UsbHidTransport::new(config, XorShift(0x2545_F491));

    let mut to_device = Wire::default();
    host.send_all(command, &mut to_device)
        .map_err(|e| anyhow!("host fragmenting: {e}"))?;
    info!("SIM: host sent {} reports", to_device.0.len());

    let mut to_host = Wire::default();
    for report in &to_device.0 {
        match device.receive(report, &mut to_host) {
            HidStatus::MoreData => {}
            HidStatus::Reset => bail!("device reset the exchange"),
            HidStatus::Received(len) => {
                info!("SIM: device got {} byte APDU", len);
                let mut response = device.apdu().to_vec();
                response.extend_from_slice(&[0x90, 0x00]);
                device
                    .send(&response, &mut to_host)
                    .map_err(|e| anyhow!("device response: {e}"))?;
            }
        }
    }

    for report in &to_host.0 {
        match host.receive(report) {
            Ok(RxEvent::Complete(_)) => return Ok(host.apdu().to_vec()),
            Ok(_) => {}
            Err(e) => bail!("host reassembly: {e}"),
        }
    }
    bail!("no response from device")
}

/// Drive the newer controller's init and advertising step machines.
fn ble_bring_up(config: &LinkConfig) -> Result<usize> {
    let mut ctrl = BleController::new(
        FakeController::default(),
        XorShift(0x9E37_79B9),
        StdDelay,
        &SimSerial,
        "Nano X SIM",
        config.clone(),
    );
    ctrl.init();
    while ctrl.process_event() {}

    if ctrl.state() != ControllerState::Ready {
        bail!("controller stuck in {:?}", ctrl.state());
    }
    Ok(ctrl.port().commands)
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let path = std::env::args()
        .nth(1)
        .map_or_else(|| std::env::temp_dir().join("apdu-link.cfg"), PathBuf::from);
    let mut store = FileConfig { path: path.clone() };
    let config = store
        .load()
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("loading {}", path.display()))?;
    if let Err(e) = store.save(&config) {
        warn!("SIM: config not persisted ({})", e);
    }

    let command = [0xE0, 0x01, 0x00, 0x00, 0x00];
    let response = usb_loopback(&config, &command).context("USB loopback")?;
    info!("SIM: USB response {:02X?}", response);

    let commands = ble_bring_up(&config).context("BLE bring-up")?;
    info!("SIM: controller ready after {} commands", commands);
    Ok(())
}
