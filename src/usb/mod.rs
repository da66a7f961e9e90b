//! USB HID APDU transport.

pub mod hid;

pub use hid::{HidStatus, UsbHidTransport};
