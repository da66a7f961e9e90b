//! Platform boundary.
//!
//! The link state machines never touch hardware. Everything they need
//! from the platform (event dispatch, controller writes, report transmit,
//! radio power, identity, randomness, persisted config) comes through the
//! **port traits** in [`ports`], so the whole crate runs against mocks on
//! the host.

pub mod ports;
