//! Chunked APDU transport for secure-element firmware.
//!
//! Exposes the link layers between the host and the APDU dispatcher:
//!
//! | Module         | Purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | [`apdu`]       | Chunk layouts, session, fragmentation and reassembly     |
//! | [`hci`]        | HCI framing, packet pool, command/event correlator       |
//! | [`ble`]        | Legacy and newer BLE controller adapters, pairing bridge |
//! | [`usb`]        | USB HID transport                                        |
//! | [`app::ports`] | Platform traits consumed by all of the above             |
//!
//! Everything runs on one logical thread; blocking primitives pump the
//! platform dispatcher, so receive paths may run in the middle of a send.

#![deny(unused_must_use)]

pub mod apdu;
pub mod app;
pub mod ble;
pub mod config;
pub mod deadline;
pub mod error;
pub mod hci;
pub mod usb;

pub use error::{Error, Result};
