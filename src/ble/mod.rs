//! BLE link adapters.
//!
//! | Module         | Purpose                                                   |
//! |----------------|-----------------------------------------------------------|
//! | [`gatt`]       | Service UUIDs, device identity, advertising payloads      |
//! | [`legacy`]     | Legacy controller: blocking setup, fixed 20-byte chunks   |
//! | [`controller`] | Newer controller: step-machine init, negotiated MTU       |
//! | [`pairing`]    | Passkey / numeric-comparison bridge to the device UX      |
//!
//! Both adapters own one [`ChunkedApduTransport`](crate::apdu::ChunkedApduTransport)
//! and reset it on every connect, disconnect and power-cycle.

pub mod controller;
pub mod gatt;
pub mod legacy;
pub mod pairing;

pub use controller::{BleController, ControllerCore, ControllerState};
pub use legacy::{LegacyBleLink, LegacyCore};
pub use pairing::{PairingBridge, PairingPrompt, PairingStatus, PairingUxEvent, UxResponse};
