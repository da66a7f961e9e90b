//! Pairing bridge between the controller's security events and the
//! device UX.
//!
//! The controller asks for a passkey or a numeric comparison; the bridge
//! posts a [`PairingUxEvent`] on a bounded `embassy-sync` channel and
//! remembers what it asked. When the UX answers through
//! [`PairingBridge::respond`], the bridge returns the [`PairingReply`] the
//! controller adapter must send.
//!
//! ```text
//! ┌────────────┐ PASS_KEY_REQ / NUMERIC_COMPARISON ┌──────────┐ Request ┌─────┐
//! │ controller │──────────────────────────────────▶│  bridge  │────────▶│ UX  │
//! │            │◀──────────────────────────────────│          │◀────────│     │
//! └────────────┘   PASS_KEY_RESP / CONFIRM_YESNO    └──────────┘ respond └─────┘
//! ```

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, info, warn};

use crate::app::ports::RandomSource;

/// Passkeys are six decimal digits.
const PASSKEY_MODULUS: u32 = 1_000_000;

/// SMP pairing-complete status codes.
const SMP_SUCCESS: u8 = 0x00;
const SMP_TIMEOUT: u8 = 0x01;
const SMP_FAILED: u8 = 0x02;
/// SMP failure reason "unspecified": the host cancelled.
const SMP_REASON_UNSPECIFIED: u8 = 0x08;

const UX_DEPTH: usize = 4;

/// What the UX is asked to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPrompt {
    /// Display this passkey for the host user to type.
    Passkey(u32),
    /// Display this value and ask whether it matches the host.
    NumericComparison(u32),
}

impl PairingPrompt {
    /// The 6-digit value to display.
    pub fn code(self) -> u32 {
        match self {
            Self::Passkey(c) | Self::NumericComparison(c) => c,
        }
    }
}

/// Answer from the UX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UxResponse {
    Ok,
    Ignore,
    Reject,
}

/// Reason a pairing UX is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Success,
    Timeout,
    CancelledFromRemote,
    Failed,
    AcceptPasskey,
    CancelPasskey,
    ConfirmCodeYes,
    ConfirmCodeNo,
}

/// Message posted to the UX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingUxEvent {
    Request(PairingPrompt),
    End(PairingStatus),
}

/// Command the adapter sends back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingReply {
    Passkey(u32),
    Confirm(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Passkey,
    NumericComparison,
}

pub struct PairingBridge<R> {
    rng: R,
    code: u32,
    pending: Option<Pending>,
    in_progress: bool,
    ux: Channel<NoopRawMutex, PairingUxEvent, UX_DEPTH>,
}

impl<R: RandomSource> PairingBridge<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            code: 0,
            pending: None,
            in_progress: false,
            ux: Channel::new(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Passkey currently offered to the controller.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Next message for the UX, if any.
    pub fn next_event(&self) -> Option<PairingUxEvent> {
        self.ux.try_receive().ok()
    }

    /// Controller asked for a passkey: draw one and show it.
    pub fn passkey_request(&mut self) {
        self.code = self.fresh_code();
        self.pending = Some(Pending::Passkey);
        self.in_progress = true;
        debug!("BLE: passkey request");
        self.post(PairingUxEvent::Request(PairingPrompt::Passkey(self.code)));
    }

    /// Controller asked the user to compare `value` with the host.
    pub fn numeric_comparison(&mut self, value: u32) {
        self.pending = Some(Pending::NumericComparison);
        self.in_progress = true;
        debug!("BLE: numeric comparison {:06}", value % PASSKEY_MODULUS);
        self.post(PairingUxEvent::Request(PairingPrompt::NumericComparison(
            value % PASSKEY_MODULUS,
        )));
    }

    /// Apply the UX answer to the outstanding request.
    ///
    /// Returns `None` when nothing was asked.
    pub fn respond(&mut self, resp: UxResponse) -> Option<PairingReply> {
        match self.pending.take()? {
            Pending::Passkey => {
                if resp == UxResponse::Ok {
                    self.end(PairingStatus::AcceptPasskey);
                } else {
                    // A declined passkey is replaced so the host cannot pair.
                    self.end(PairingStatus::CancelPasskey);
                    self.code = self.fresh_code();
                }
                Some(PairingReply::Passkey(self.code))
            }
            Pending::NumericComparison => match resp {
                UxResponse::Ok => {
                    self.end(PairingStatus::ConfirmCodeYes);
                    Some(PairingReply::Confirm(true))
                }
                UxResponse::Ignore => {
                    self.in_progress = false;
                    Some(PairingReply::Confirm(false))
                }
                UxResponse::Reject => {
                    self.end(PairingStatus::ConfirmCodeNo);
                    Some(PairingReply::Confirm(false))
                }
            },
        }
    }

    /// Pairing-complete event from the controller.
    pub fn pairing_complete(&mut self, status: u8, reason: u8) {
        let outcome = match (status, reason) {
            (SMP_SUCCESS, _) => PairingStatus::Success,
            (SMP_TIMEOUT, _) => PairingStatus::Timeout,
            (SMP_FAILED, SMP_REASON_UNSPECIFIED) => PairingStatus::CancelledFromRemote,
            _ => PairingStatus::Failed,
        };
        info!("BLE: pairing complete ({:?})", outcome);
        self.end(outcome);
        self.in_progress = false;
        self.pending = None;
    }

    /// Close the UX, if one is open.
    pub fn end(&mut self, status: PairingStatus) {
        if self.in_progress {
            self.post(PairingUxEvent::End(status));
        }
    }

    fn fresh_code(&mut self) -> u32 {
        self.rng.next_u32() % PASSKEY_MODULUS
    }

    fn post(&self, event: PairingUxEvent) {
        if self.ux.try_send(event).is_err() {
            warn!("BLE: pairing UX queue full, dropping {:?}", event);
        }
    }
}
