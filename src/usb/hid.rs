//! APDU exchange over 64-byte USB HID reports.
//!
//! ```text
//!   ┌─────────┬─────┬─────────┬────────────────────┬──────────────┐
//!   │ channel │ tag │ seq BE  │ total BE (seq 0)   │ payload … 00 │
//!   │  2 (BE) │  1  │    2    │        2           │              │
//!   └─────────┴─────┴─────────┴────────────────────┴──────────────┘
//! ```
//!
//! Every reply carries the channel of the request. Any framing problem
//! drops the whole exchange: the host must start again from sequence 0.

use log::{debug, warn};

use crate::apdu::layout::tag;
use crate::apdu::{ChunkedApduTransport, RxEvent, Session, UsbHid};
use crate::app::ports::{ChunkSink, RandomSource};
use crate::config::LinkConfig;
use crate::error::SendError;

/// Outcome of one output report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidStatus {
    /// The exchange was dropped; the session is idle again.
    Reset,
    /// Nothing for the application yet.
    MoreData,
    /// A complete APDU of this length is available.
    Received(usize),
}

pub struct UsbHidTransport<R> {
    transport: ChunkedApduTransport<UsbHid>,
    rng: R,
}

impl<R: RandomSource> UsbHidTransport<R> {
    pub fn new(config: &LinkConfig, rng: R) -> Self {
        Self {
            transport: ChunkedApduTransport::new(UsbHid::new(config.hid_report_len)),
            rng,
        }
    }

    pub fn session(&self) -> &Session {
        self.transport.session()
    }

    pub fn report_len(&self) -> usize {
        self.transport.chunk_len()
    }

    /// The last APDU reported as [`HidStatus::Received`].
    pub fn apdu(&self) -> &[u8] {
        self.transport.apdu()
    }

    /// Handle one output report. Control replies go straight out
    /// through `sink`.
    pub fn receive<S: ChunkSink>(&mut self, report: &[u8], sink: &mut S) -> HidStatus {
        let event = match self.transport.receive(report) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("USB: exchange reset ({})", e);
                return HidStatus::Reset;
            }
        };

        match event {
            RxEvent::Complete(len) => {
                self.transport.take_complete();
                HidStatus::Received(len)
            }
            RxEvent::Reply(reply) => {
                if let Err(e) = sink.transmit(&reply) {
                    warn!("USB: reply lost ({})", e);
                }
                HidStatus::MoreData
            }
            RxEvent::ChannelRequest { channel } => {
                let mut reply = self.transport.control_header(channel, tag::ALLOCATE_CHANNEL);
                let _ = reply.extend_from_slice(&self.rng.next_u32().to_be_bytes());
                if let Some(reply) = self.transport.queue_reply(reply) {
                    if let Err(e) = sink.transmit(&reply) {
                        warn!("USB: channel reply lost ({})", e);
                    }
                }
                HidStatus::MoreData
            }
            RxEvent::Reset => HidStatus::Reset,
            RxEvent::NeedMore
            | RxEvent::Deferred
            | RxEvent::Dropped
            | RxEvent::Ignored => HidStatus::MoreData,
        }
    }

    /// Fragment `apdu` into reports on the current channel. The session is
    /// idle again afterwards.
    pub fn send<S: ChunkSink>(&mut self, apdu: &[u8], sink: &mut S) -> Result<(), SendError> {
        let result = self.transport.send_all(apdu, sink);
        self.transport.session_mut().reset_rx();
        if let Err(e) = result {
            warn!("USB: send failed ({})", e);
        }
        result
    }
}
