//! Link configuration parameters
//!
//! All tunable parameters for the APDU transports and the BLE controllers.
//! Platforms can persist an override with [`LinkConfig::encode`] and load it
//! back with [`LinkConfig::decode`].

extern crate alloc;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::apdu::MAX_CHUNK_LEN;
use crate::error::{Error, Result};

/// How the transmit primitive reacts to a transient "insufficient
/// resources" status from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Keep pumping events until the controller frees a TX buffer.
    Unbounded,
    /// Give up after `attempts` retries, waiting `backoff_us` between them.
    Bounded { attempts: u16, backoff_us: u32 },
}

impl RetryPolicy {
    /// Whether retry number `attempt` (1-based) is still allowed.
    pub const fn allows(self, attempt: u16) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded { attempts, .. } => attempt <= attempts,
        }
    }
}

/// Core link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    // --- Chunking ---
    /// Fixed chunk length on the legacy BLE controller
    pub legacy_chunk_len: u8,
    /// Upper bound for the negotiated chunk length (ATT_MTU - 3)
    pub max_mtu: u8,
    /// ATT_MTU before any exchange has happened
    pub default_att_mtu: u8,
    /// USB HID report length
    pub hid_report_len: u8,

    // --- Timing ---
    /// Platform tick period (milliseconds)
    pub tick_ms: u32,
    /// General HCI request ceiling (milliseconds)
    pub hci_timeout_ms: u32,
    /// Ceiling for connection-parameter requests (milliseconds)
    pub conn_param_timeout_ms: u32,
    /// Legacy link: time allowed between connect and first APDU (milliseconds)
    pub connection_timeout_ms: u32,
    /// Newer controller: time allowed per notified chunk (milliseconds)
    pub xfer_timeout_ms: u32,

    // --- Advertising / connection ---
    /// Advertising interval bounds (0.625 ms units)
    pub adv_interval_min: u16,
    pub adv_interval_max: u16,
    /// Requested connection interval bounds (1.25 ms units)
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    /// GAP appearance value
    pub appearance: u16,
    /// Controller TX power level (high power mode)
    pub tx_power_level: u8,

    // --- Retry ---
    pub legacy_retry: RetryPolicy,
    pub controller_retry: RetryPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            // Chunking
            legacy_chunk_len: 20,
            max_mtu: 156,
            default_att_mtu: 23,
            hid_report_len: 64,

            // Timing
            tick_ms: 100,
            hci_timeout_ms: 33_000,
            conn_param_timeout_ms: 5_000,
            connection_timeout_ms: 5_000,
            xfer_timeout_ms: 2_000,

            // Advertising / connection
            adv_interval_min: 48, // 30 ms
            adv_interval_max: 96, // 60 ms
            conn_interval_min: 12, // 15 ms
            conn_interval_max: 24, // 30 ms
            appearance: 576,
            tx_power_level: 7,

            // Retry
            legacy_retry: RetryPolicy::Unbounded,
            controller_retry: RetryPolicy::Bounded {
                attempts: 10,
                backoff_us: 1_000,
            },
        }
    }
}

impl LinkConfig {
    /// Reject combinations the transports cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.legacy_chunk_len < 6 || usize::from(self.legacy_chunk_len) > MAX_CHUNK_LEN {
            return Err(Error::Config("legacy_chunk_len out of range"));
        }
        if self.max_mtu < 6 || usize::from(self.max_mtu) > MAX_CHUNK_LEN {
            return Err(Error::Config("max_mtu out of range"));
        }
        if self.default_att_mtu < 23 {
            return Err(Error::Config("default_att_mtu below BLE minimum"));
        }
        if self.hid_report_len < 8 || usize::from(self.hid_report_len) > MAX_CHUNK_LEN {
            return Err(Error::Config("hid_report_len out of range"));
        }
        if self.tick_ms == 0 {
            return Err(Error::Config("tick_ms must be nonzero"));
        }
        if self.hci_timeout_ms < self.tick_ms || self.conn_param_timeout_ms < self.tick_ms {
            return Err(Error::Config("HCI timeout shorter than one tick"));
        }
        if self.adv_interval_min > self.adv_interval_max {
            return Err(Error::Config("advertising interval bounds inverted"));
        }
        if self.conn_interval_min > self.conn_interval_max {
            return Err(Error::Config("connection interval bounds inverted"));
        }
        // Command writes on the newer controller have no event to wait on.
        if self.controller_retry == RetryPolicy::Unbounded {
            return Err(Error::Config("controller_retry must be bounded"));
        }
        Ok(())
    }

    /// Chunk length before any MTU exchange (ATT_MTU - 3).
    pub fn default_chunk_len(&self) -> u8 {
        (self.default_att_mtu - 3).min(self.max_mtu)
    }

    /// Serialize to postcard for persistence.
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Config("encode failed"))
    }

    /// Deserialize and validate a persisted config.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let cfg: Self = postcard::from_bytes(bytes).map_err(|_| Error::Config("decode failed"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
