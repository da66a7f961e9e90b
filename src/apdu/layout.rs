//! Wire layouts of the three chunked transports.
//!
//! | Layout          | Prefix     | Chunk length         | Errors            | Unknown tag |
//! |-----------------|------------|----------------------|-------------------|-------------|
//! | [`LegacyBle`]   | none       | fixed (20)           | `0E code 00 00 00` | error       |
//! | [`NegotiatedBle`] | none     | ATT_MTU − 3, ≤ 156   | silent reset      | ignored     |
//! | [`UsbHid`]      | channel BE | report (64), padded  | `Reset`           | `Reset`     |

use heapless::Vec;

use super::MAX_CHUNK_LEN;
use crate::error::FrameError;

/// One wire chunk.
pub type Chunk = Vec<u8, MAX_CHUNK_LEN>;

/// Tag bytes. `INIT` and `ALLOCATE_CHANNEL` share a value; the layout
/// decides which meaning applies.
pub mod tag {
    pub const VERSION: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const ALLOCATE_CHANNEL: u8 = 0x01;
    pub const ECHO: u8 = 0x02;
    pub const ABORT: u8 = 0x03;
    pub const APDU: u8 = 0x05;
    pub const MTU: u8 = 0x08;
    pub const ERROR: u8 = 0x0E;
}

/// Meaning of a tag under a given layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Version,
    Init,
    AllocateChannel,
    Echo,
    Abort,
    Apdu,
    Mtu,
}

pub trait ChunkLayout {
    /// Channel bytes in front of the tag.
    const PREFIX_LEN: usize;
    /// Control tags must carry sequence 0.
    const STRICT_CONTROL_SEQ: bool;
    /// Unknown tags are ignored instead of rejected.
    const IGNORE_UNKNOWN: bool;
    /// Outgoing chunks are zero-padded to `chunk_len`.
    const PAD: bool;
    /// Tag of the error reply chunk, if the layout has one.
    const ERROR_TAG: Option<u8>;

    /// Wire length of one chunk.
    fn chunk_len(&self) -> usize;

    fn classify(&self, tag: u8) -> Option<Tag>;

    /// Bytes following the tag in a VERSION reply.
    fn version_body(&self) -> &'static [u8];

    /// Header bytes of an APDU chunk, without the prefix.
    fn header_len(seq: u16) -> usize {
        if seq == 0 { 5 } else { 3 }
    }

    /// Error reply for `err`, when the layout reports errors on the wire.
    fn error_reply(&self, err: FrameError) -> Option<Chunk> {
        let t = Self::ERROR_TAG?;
        Vec::from_slice(&[t, err.wire_code(), 0, 0, 0]).ok()
    }
}

// ───────────────────────────────────────────────────────────────
// Legacy BLE controller
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyBle {
    chunk_len: usize,
}

impl LegacyBle {
    pub fn new(chunk_len: u8) -> Self {
        Self {
            chunk_len: usize::from(chunk_len).min(MAX_CHUNK_LEN),
        }
    }
}

impl ChunkLayout for LegacyBle {
    const PREFIX_LEN: usize = 0;
    const STRICT_CONTROL_SEQ: bool = true;
    const IGNORE_UNKNOWN: bool = false;
    const PAD: bool = false;
    const ERROR_TAG: Option<u8> = Some(tag::ERROR);

    fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    fn classify(&self, t: u8) -> Option<Tag> {
        match t {
            tag::VERSION => Some(Tag::Version),
            tag::INIT => Some(Tag::Init),
            tag::ECHO => Some(Tag::Echo),
            tag::APDU => Some(Tag::Apdu),
            _ => None,
        }
    }

    /// seq 0, length 4, version 0.
    fn version_body(&self) -> &'static [u8] {
        &[0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
    }
}

// ───────────────────────────────────────────────────────────────
// Newer BLE controller (MTU negotiated)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedBle {
    chunk_len: usize,
    max: usize,
    negotiated: bool,
}

impl NegotiatedBle {
    pub fn new(default_chunk_len: u8, max: u8) -> Self {
        let max = usize::from(max).min(MAX_CHUNK_LEN);
        Self {
            chunk_len: usize::from(default_chunk_len).min(max),
            max,
            negotiated: false,
        }
    }

    /// Apply the ATT_MTU from an exchange response.
    pub fn set_att_mtu(&mut self, att_mtu: u16) {
        self.chunk_len = usize::from(att_mtu.saturating_sub(3)).clamp(6, self.max);
        self.negotiated = true;
    }

    /// Back to the pre-exchange chunk length (new connection).
    pub fn reset_mtu(&mut self, default_chunk_len: u8) {
        self.chunk_len = usize::from(default_chunk_len).min(self.max);
        self.negotiated = false;
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }
}

impl ChunkLayout for NegotiatedBle {
    const PREFIX_LEN: usize = 0;
    const STRICT_CONTROL_SEQ: bool = false;
    const IGNORE_UNKNOWN: bool = true;
    const PAD: bool = false;
    const ERROR_TAG: Option<u8> = None;

    fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    fn classify(&self, t: u8) -> Option<Tag> {
        match t {
            tag::VERSION => Some(Tag::Version),
            tag::ALLOCATE_CHANNEL => Some(Tag::AllocateChannel),
            tag::ECHO => Some(Tag::Echo),
            tag::ABORT => Some(Tag::Abort),
            tag::APDU => Some(Tag::Apdu),
            tag::MTU => Some(Tag::Mtu),
            _ => None,
        }
    }

    fn version_body(&self) -> &'static [u8] {
        &[0x00, 0x00, 0x00, 0x00]
    }
}

// ───────────────────────────────────────────────────────────────
// USB HID
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbHid {
    report_len: usize,
}

impl UsbHid {
    pub fn new(report_len: u8) -> Self {
        Self {
            report_len: usize::from(report_len).min(MAX_CHUNK_LEN),
        }
    }
}

impl ChunkLayout for UsbHid {
    const PREFIX_LEN: usize = 2;
    const STRICT_CONTROL_SEQ: bool = false;
    const IGNORE_UNKNOWN: bool = false;
    const PAD: bool = true;
    const ERROR_TAG: Option<u8> = None;

    fn chunk_len(&self) -> usize {
        self.report_len
    }

    fn classify(&self, t: u8) -> Option<Tag> {
        match t {
            tag::VERSION => Some(Tag::Version),
            tag::ALLOCATE_CHANNEL => Some(Tag::AllocateChannel),
            tag::ECHO => Some(Tag::Echo),
            tag::APDU => Some(Tag::Apdu),
            _ => None,
        }
    }

    fn version_body(&self) -> &'static [u8] {
        &[0x00, 0x00, 0x00, 0x00]
    }
}

// ── Tests ─────────────────────────────────────────────────────
