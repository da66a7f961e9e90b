//! APDU GATT service definition and device identity.
//!
//! The service exposes one notify characteristic (device → host) and one
//! or two write characteristics (host → device). UUIDs are stored in the
//! little-endian byte order the controllers expect on the wire.
//!
//! | Controller | Service / characteristics                     |
//! |------------|-----------------------------------------------|
//! | Legacy     | `d973f2e0-…`, TX `d973f2e1-…`, RX `d973f2e2-…` |
//! | Newer      | `13d63400-…`, notify `…0001…`, write `…0002…`, write-cmd `…0003…` |

use core::fmt::Write;

use crc::{Crc, CRC_16_IBM_3740};
use heapless::{String, Vec};

// ───────────────────────────────────────────────────────────────
// UUIDs
// ───────────────────────────────────────────────────────────────

pub type Uuid128 = [u8; 16];

pub const LEGACY_SERVICE_UUID: Uuid128 = [
    0x66, 0x9a, 0x0c, 0x20, 0x00, 0x08, 0x96, 0x9e, 0xe2, 0x11, 0x9e, 0xb1, 0xe0, 0xf2, 0x73, 0xd9,
];
pub const LEGACY_TX_CHAR_UUID: Uuid128 = [
    0x66, 0x9a, 0x0c, 0x20, 0x00, 0x08, 0x96, 0x9e, 0xe2, 0x11, 0x9e, 0xb1, 0xe1, 0xf2, 0x73, 0xd9,
];
pub const LEGACY_RX_CHAR_UUID: Uuid128 = [
    0x66, 0x9a, 0x0c, 0x20, 0x00, 0x08, 0x96, 0x9e, 0xe2, 0x11, 0x9e, 0xb1, 0xe2, 0xf2, 0x73, 0xd9,
];

pub const SERVICE_UUID: Uuid128 = [
    0x72, 0x65, 0x67, 0x64, 0x65, 0x4c, 0x00, 0x00, 0x04, 0x00, 0x97, 0x2c, 0x00, 0x34, 0xd6, 0x13,
];
pub const NOTIFY_CHAR_UUID: Uuid128 = [
    0x72, 0x65, 0x67, 0x64, 0x65, 0x4c, 0x01, 0x00, 0x04, 0x00, 0x97, 0x2c, 0x00, 0x34, 0xd6, 0x13,
];
pub const WRITE_CHAR_UUID: Uuid128 = [
    0x72, 0x65, 0x67, 0x64, 0x65, 0x4c, 0x02, 0x00, 0x04, 0x00, 0x97, 0x2c, 0x00, 0x34, 0xd6, 0x13,
];
pub const WRITE_CMD_CHAR_UUID: Uuid128 = [
    0x72, 0x65, 0x67, 0x64, 0x65, 0x4c, 0x03, 0x00, 0x04, 0x00, 0x97, 0x2c, 0x00, 0x34, 0xd6, 0x13,
];

// ───────────────────────────────────────────────────────────────
// GATT / GAP constants
// ───────────────────────────────────────────────────────────────

pub const UUID_TYPE_128: u8 = 0x02;
pub const PRIMARY_SERVICE: u8 = 0x01;

pub mod prop {
    pub const WRITE_WITHOUT_RESP: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
}

pub mod perm {
    pub const NONE: u8 = 0x00;
    pub const AUTHEN_WRITE: u8 = 0x08;
}

pub mod notify_mask {
    pub const NONE: u8 = 0x00;
    pub const ATTRIBUTE_WRITE: u8 = 0x01;
    pub const WRITE_REQ_AND_WAIT: u8 = 0x02;
}

pub const ENCRYPTION_KEY_SIZE: u8 = 16;
pub const VALUE_LEN_VARIABLE: u8 = 0x01;

pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_128_SERVICE_UUIDS: u8 = 0x06;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const SLAVE_CONN_INTERVAL: u8 = 0x12;
}

/// LE general discoverable, BR/EDR not supported.
pub const ADV_FLAGS: u8 = 0x06;

/// Longest advertising or scan response payload.
pub const ADV_PAYLOAD_LEN: usize = 31;

pub type AdvPayload = Vec<u8, ADV_PAYLOAD_LEN>;

// ───────────────────────────────────────────────────────────────
// Device identity
// ───────────────────────────────────────────────────────────────

/// `"Ledger(XXXXXXXX)"` plus room for nothing else.
pub type LegacyName = String<16>;

/// Public address template of the legacy controller; the first four bytes
/// are replaced by the device uid.
const LEGACY_ADDRESS_TEMPLATE: [u8; 6] = [0x02, 0x00, 0x00, 0xe7, 0x11, 0x3a];

/// Per-device uid: both serial halves XORed as little-endian words.
pub fn legacy_uid(serial: &[u8; 8]) -> u32 {
    let lo = u32::from_le_bytes([serial[0], serial[1], serial[2], serial[3]]);
    let hi = u32::from_le_bytes([serial[4], serial[5], serial[6], serial[7]]);
    lo ^ hi
}

/// Advertised name of the legacy controller.
pub fn legacy_name(uid: u32) -> LegacyName {
    let mut name = LegacyName::new();
    let _ = write!(name, "Ledger({:08X})", uid);
    name
}

pub fn legacy_address(uid: u32) -> [u8; 6] {
    let mut addr = LEGACY_ADDRESS_TEMPLATE;
    addr[..4].copy_from_slice(&uid.to_le_bytes());
    addr
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Random static address of the newer controller. The two top bits of the
/// last byte are set as static addresses require.
pub fn random_static_address(serial: &[u8; 8]) -> [u8; 6] {
    let a = CRC16.checksum(&serial[..4]).to_le_bytes();
    let b = CRC16.checksum(&serial[4..]).to_le_bytes();
    [a[0], a[1], b[0], b[1], 0xf1, 0xde]
}

// ───────────────────────────────────────────────────────────────
// Advertising payloads
// ───────────────────────────────────────────────────────────────

/// Flags followed by the complete local name.
pub fn adv_data(name: &str) -> AdvPayload {
    let mut p = AdvPayload::new();
    let _ = p.extend_from_slice(&[2, ad_type::FLAGS, ADV_FLAGS]);
    let n = name.len().min(ADV_PAYLOAD_LEN - p.len() - 2);
    let _ = p.extend_from_slice(&[n as u8 + 1, ad_type::COMPLETE_LOCAL_NAME]);
    let _ = p.extend_from_slice(&name.as_bytes()[..n]);
    p
}

/// Service UUID followed by the preferred connection interval range.
pub fn scan_response(service: &Uuid128, interval_min: u16, interval_max: u16) -> AdvPayload {
    let mut p = AdvPayload::new();
    let _ = p.extend_from_slice(&[service.len() as u8 + 1, ad_type::INCOMPLETE_128_SERVICE_UUIDS]);
    let _ = p.extend_from_slice(service);
    let [min_lo, min_hi] = interval_min.to_le_bytes();
    let [max_lo, max_hi] = interval_max.to_le_bytes();
    let _ = p.extend_from_slice(&[5, ad_type::SLAVE_CONN_INTERVAL, min_lo, min_hi, max_lo, max_hi]);
    p
}

/// `COMPLETE_LOCAL_NAME` type byte followed by the name, as the
/// set-discoverable command takes it.
pub fn local_name_field(name: &str) -> AdvPayload {
    let mut p = AdvPayload::new();
    let _ = p.push(ad_type::COMPLETE_LOCAL_NAME);
    let n = name.len().min(ADV_PAYLOAD_LEN - 1);
    let _ = p.extend_from_slice(&name.as_bytes()[..n]);
    p
}
