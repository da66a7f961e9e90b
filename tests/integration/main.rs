//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that drives one link layer against
//! the mock controller in `mock_link`. All tests run on the host with no
//! real hardware required.

mod ble_controller_tests;
mod hci_tests;
mod mock_link;
mod usb_tests;
