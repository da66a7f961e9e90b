//! Generic chunked APDU transport.
//!
//! [`ChunkedApduTransport`] owns the APDU buffer and the link's
//! [`Session`]. Receive is a single `match` over the tag producing
//! `Result<RxEvent, FrameError>`; any error resets the session in one
//! place. Send is exposed both as a one-shot [`send_all`] over a
//! [`ChunkSink`] and as the step-wise `begin_send` / `next_chunk` /
//! `finish_send` used by adapters whose transmit pumps events.
//!
//! [`send_all`]: ChunkedApduTransport::send_all

use log::{debug, warn};

use super::layout::{tag, Chunk, ChunkLayout, Tag};
use super::session::{SendCursor, Session};
use super::APDU_CAPACITY;
use crate::app::ports::ChunkSink;
use crate::error::{FrameError, SendError};

/// Result of feeding one chunk to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// Partial APDU stored; waiting for the next sequence.
    NeedMore,
    /// A whole APDU of this length is in the buffer.
    Complete(usize),
    /// Control reply to transmit now.
    Reply(Chunk),
    /// Control reply held until the current transmit unwinds.
    Deferred,
    /// Host asked for a channel; the adapter builds the reply.
    ChannelRequest { channel: u16 },
    /// Host aborted the exchange.
    Reset,
    /// APDU chunk dropped because a send is in progress.
    Dropped,
    /// Unknown tag on a lenient layout.
    Ignored,
}

pub struct ChunkedApduTransport<L: ChunkLayout> {
    layout: L,
    session: Session,
    buffer: [u8; APDU_CAPACITY],
    apdu_len: usize,
    ready: bool,
    send: SendCursor,
    deferred: Option<Chunk>,
}

impl<L: ChunkLayout> ChunkedApduTransport<L> {
    pub fn new(layout: L) -> Self {
        Self {
            layout,
            session: Session::new(),
            buffer: [0; APDU_CAPACITY],
            apdu_len: 0,
            ready: false,
            send: SendCursor::default(),
            deferred: None,
        }
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut L {
        &mut self.layout
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn chunk_len(&self) -> usize {
        self.layout.chunk_len()
    }

    /// Drop all reception state and any held reply, and abort a send in
    /// flight. Used on disconnect and power-cycle.
    pub fn reset(&mut self) {
        self.session.reset();
        self.ready = false;
        self.deferred = None;
    }

    // ── Receive ───────────────────────────────────────────────

    /// Feed one wire chunk.
    pub fn receive(&mut self, chunk: &[u8]) -> Result<RxEvent, FrameError> {
        let result = self.dispatch(chunk);
        if let Err(e) = result {
            debug!("APDU: reception reset ({})", e);
            self.session.reset();
            self.ready = false;
        }
        result
    }

    fn dispatch(&mut self, chunk: &[u8]) -> Result<RxEvent, FrameError> {
        let prefix = L::PREFIX_LEN;
        if chunk.len() <= prefix {
            return Err(FrameError::TooShort { len: chunk.len() });
        }
        let channel = read_channel::<L>(chunk);
        let body = &chunk[prefix..];
        let tag_byte = body[0];

        let Some(kind) = self.layout.classify(tag_byte) else {
            if L::IGNORE_UNKNOWN {
                return Ok(RxEvent::Ignored);
            }
            return Err(FrameError::UnknownTag(tag_byte));
        };

        match kind {
            Tag::Apdu => {
                if self.session.lock.is_sending() {
                    return Ok(RxEvent::Dropped);
                }
                self.receive_apdu(channel, body)
            }
            Tag::Init => {
                check_control_seq::<L>(body)?;
                self.session.reset();
                self.ready = false;
                let echo = self.echo(chunk);
                Ok(self.reply_event(echo))
            }
            Tag::Abort => {
                self.session.reset();
                self.ready = false;
                Ok(RxEvent::Reset)
            }
            Tag::Version => {
                check_control_seq::<L>(body)?;
                let mut reply = self.control_header(channel, tag::VERSION);
                let _ = reply.extend_from_slice(self.layout.version_body());
                let reply = self.pad(reply);
                Ok(self.reply_event(reply))
            }
            Tag::Echo => {
                check_control_seq::<L>(body)?;
                let echo = self.echo(chunk);
                Ok(self.reply_event(echo))
            }
            Tag::Mtu => {
                let mut reply = self.control_header(channel, tag::MTU);
                let _ = reply.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, self.chunk_len() as u8]);
                Ok(self.reply_event(reply))
            }
            Tag::AllocateChannel => Ok(RxEvent::ChannelRequest { channel }),
        }
    }

    fn receive_apdu(&mut self, channel: u16, body: &[u8]) -> Result<RxEvent, FrameError> {
        if body.len() < 3 {
            return Err(FrameError::TooShort { len: body.len() });
        }
        let seq = u16::from_be_bytes([body[1], body[2]]);
        let expected = self.session.expected_seq;
        if seq != expected {
            return Err(FrameError::SequenceMismatch { expected, got: seq });
        }

        let payload = if seq == 0 {
            if body.len() < 5 {
                return Err(FrameError::TooShort { len: body.len() });
            }
            let total = u16::from_be_bytes([body[3], body[4]]);
            if usize::from(total) > APDU_CAPACITY {
                return Err(FrameError::Overflow {
                    declared: total,
                    capacity: APDU_CAPACITY as u16,
                });
            }
            if total > 0 && body.len() < 6 {
                return Err(FrameError::TooShort { len: body.len() });
            }
            self.session.begin(total, channel);
            self.ready = false;
            &body[5..]
        } else {
            if L::PREFIX_LEN > 0 && channel != self.session.channel {
                return Err(FrameError::ChannelMismatch {
                    expected: self.session.channel,
                    got: channel,
                });
            }
            if body.len() < 4 {
                return Err(FrameError::TooShort { len: body.len() });
            }
            &body[3..]
        };

        let n = payload.len().min(usize::from(self.session.remaining));
        let start = self.session.cursor;
        self.buffer[start..start + n].copy_from_slice(&payload[..n]);

        if self.session.advance(n as u16) {
            self.apdu_len = usize::from(self.session.total);
            self.ready = true;
            debug!("APDU: received {} bytes", self.apdu_len);
            Ok(RxEvent::Complete(self.apdu_len))
        } else {
            Ok(RxEvent::NeedMore)
        }
    }

    /// The most recently completed APDU.
    pub fn apdu(&self) -> &[u8] {
        &self.buffer[..self.apdu_len]
    }

    /// Length of a completed APDU not yet handed to the application.
    /// Returns it once.
    pub fn take_complete(&mut self) -> Option<usize> {
        if self.ready {
            self.ready = false;
            Some(self.apdu_len)
        } else {
            None
        }
    }

    // ── Replies ───────────────────────────────────────────────

    /// `[channel BE]` (when the layout has one) followed by `tag`.
    pub fn control_header(&self, channel: u16, t: u8) -> Chunk {
        let mut c = Chunk::new();
        if L::PREFIX_LEN == 2 {
            let _ = c.extend_from_slice(&channel.to_be_bytes());
        }
        let _ = c.push(t);
        c
    }

    /// Error reply chunk for `err`, when the layout reports errors.
    pub fn error_reply(&self, err: FrameError) -> Option<Chunk> {
        self.layout.error_reply(err)
    }

    /// Hand a reply back if it can go out now, or hold it while a
    /// transmit is on the stack.
    pub fn queue_reply(&mut self, reply: Chunk) -> Option<Chunk> {
        let reply = self.pad(reply);
        if self.session.lock.is_sealed() {
            self.deferred = Some(reply);
            None
        } else {
            Some(reply)
        }
    }

    /// A held reply, once no transmit is on the stack.
    pub fn take_deferred(&mut self) -> Option<Chunk> {
        if self.session.lock.is_sealed() {
            return None;
        }
        self.deferred.take()
    }

    fn reply_event(&mut self, reply: Chunk) -> RxEvent {
        match self.queue_reply(reply) {
            Some(r) => RxEvent::Reply(r),
            None => RxEvent::Deferred,
        }
    }

    fn echo(&self, chunk: &[u8]) -> Chunk {
        let n = chunk.len().min(self.chunk_len());
        Chunk::from_slice(&chunk[..n]).unwrap_or_default()
    }

    fn pad(&self, mut c: Chunk) -> Chunk {
        if L::PAD && c.len() < self.chunk_len() {
            let _ = c.resize(self.chunk_len(), 0);
        }
        c
    }

    // ── Send ──────────────────────────────────────────────────

    pub fn is_sending(&self) -> bool {
        self.session.lock.is_sending()
    }

    /// Take the send lock for an APDU of `len` bytes.
    ///
    /// The received APDU counts as consumed from here on.
    pub fn begin_send(&mut self, len: usize) -> Result<(), SendError> {
        if len > usize::from(u16::MAX) {
            return Err(SendError::TooLong { len });
        }
        self.session.lock.try_acquire()?;
        self.send = SendCursor::start(len);
        self.ready = false;
        Ok(())
    }

    /// Build the next chunk of `data`, or `None` when all bytes are out.
    ///
    /// An empty APDU still yields one header-only first chunk.
    pub fn next_chunk(&mut self, data: &[u8]) -> Option<Chunk> {
        if !self.send.active {
            return None;
        }
        let seq = self.send.seq;
        let mut c = self.control_header(self.session.channel, tag::APDU);
        let _ = c.extend_from_slice(&seq.to_be_bytes());
        if seq == 0 {
            let _ = c.extend_from_slice(&(self.send.len as u16).to_be_bytes());
        }

        let room = self.chunk_len().saturating_sub(c.len());
        let n = room.min(self.send.remaining());
        if n == 0 && self.send.remaining() > 0 {
            warn!("APDU: chunk length {} leaves no room for payload", self.chunk_len());
            self.send.active = false;
            return None;
        }
        let from = self.send.offset;
        let part = data.get(from..from + n)?;
        let _ = c.extend_from_slice(part);

        self.send.offset += n;
        self.send.seq = seq.wrapping_add(1);
        if self.send.remaining() == 0 {
            self.send.active = false;
        }
        Some(self.pad(c))
    }

    /// Enter a transmit; fails with `Aborted` if the host cancelled the send.
    pub fn seal(&mut self) -> Result<(), SendError> {
        self.session.lock.seal()
    }

    pub fn unseal(&mut self) {
        self.session.lock.unseal();
    }

    /// Release the send lock.
    pub fn finish_send(&mut self) {
        self.session.lock.release();
        self.send = SendCursor::default();
    }

    /// Fragment `data` and transmit every chunk through `sink`.
    ///
    /// Replies produced by re-entrant receives during a transmit are sent
    /// right after it.
    pub fn send_all<S: ChunkSink>(&mut self, data: &[u8], sink: &mut S) -> Result<(), SendError> {
        self.begin_send(data.len())?;
        let result = self.transmit_chunks(data, sink);
        self.finish_send();
        self.flush_deferred(sink);
        result
    }

    fn transmit_chunks<S: ChunkSink>(&mut self, data: &[u8], sink: &mut S) -> Result<(), SendError> {
        while let Some(chunk) = self.next_chunk(data) {
            self.seal()?;
            let sent = sink.transmit(&chunk);
            self.unseal();
            self.flush_deferred(sink);
            sent?;
        }
        Ok(())
    }

    fn flush_deferred<S: ChunkSink>(&mut self, sink: &mut S) {
        if let Some(reply) = self.take_deferred() {
            if let Err(e) = sink.transmit(&reply) {
                warn!("APDU: deferred reply lost ({})", e);
            }
        }
    }
}

fn read_channel<L: ChunkLayout>(chunk: &[u8]) -> u16 {
    if L::PREFIX_LEN == 2 {
        u16::from_be_bytes([chunk[0], chunk[1]])
    } else {
        0
    }
}

fn check_control_seq<L: ChunkLayout>(body: &[u8]) -> Result<(), FrameError> {
    if !L::STRICT_CONTROL_SEQ {
        return Ok(());
    }
    if body.len() < 3 {
        return Err(FrameError::TooShort { len: body.len() });
    }
    if body[1] != 0 || body[2] != 0 {
        return Err(FrameError::UnexpectedSequence { tag: body[0] });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────
