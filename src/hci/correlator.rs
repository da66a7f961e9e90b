//! Command/event correlator.
//!
//! Sends one HCI command and pumps the platform dispatcher until the
//! matching reply arrives, the controller reports an error, or the tick
//! deadline expires. Every other event seen meanwhile is queued on the
//! async queue and handed to the caller's [`AsyncEventHandler`] in the
//! same iteration, so link events are never held back by a pending
//! command.

use embassy_time::Duration;
use log::{debug, warn};

use super::pool::{PacketPool, Queue, SlotId, POOL_SIZE};
use super::{frame_command, CommandRequest, EventKind, EventPacket, Expect};
use crate::app::ports::{AsyncEventHandler, Dispatcher, HciTransport, PlatformEvent};
use crate::deadline::{Deadline, DeadlineState};
use crate::error::HciError;

/// What one pump of the dispatcher produced.
enum Step {
    Drained,
    Tick,
    Packet(Result<SlotId, HciError>),
    Other,
}

/// Outcome of a packet routed to the reply queue.
enum Verdict {
    Done(usize),
    Failed(HciError),
    KeepWaiting,
}

pub struct Correlator<const N: usize = POOL_SIZE> {
    pool: PacketPool<N>,
    busy: bool,
    deadline: Deadline,
    tick: Duration,
}

impl<const N: usize> Correlator<N> {
    pub fn new(tick: Duration) -> Self {
        Self {
            pool: PacketPool::new(),
            busy: false,
            deadline: Deadline::new(),
            tick,
        }
    }

    /// Whether a command is outstanding.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn pool(&self) -> &PacketPool<N> {
        &self.pool
    }

    /// Issue `req` and wait for its reply.
    ///
    /// Returns the number of bytes copied into `req.reply`.
    pub fn send_request<P, H>(
        &mut self,
        port: &mut P,
        handler: &mut H,
        req: &mut CommandRequest<'_>,
    ) -> Result<usize, HciError>
    where
        P: HciTransport + Dispatcher,
        H: AsyncEventHandler,
    {
        if self.busy {
            return Err(HciError::Busy);
        }
        let opcode = req.opcode();
        let frame = frame_command(opcode, req.params)?;
        port.send_command(&frame).map_err(HciError::Link)?;

        self.busy = true;
        self.deadline.arm(req.timeout);
        debug!("HCI: sent opcode 0x{:04X} ({} param bytes)", opcode, req.params.len());

        let result = self.wait_reply(port, handler, req, opcode);
        self.busy = false;
        self.deadline.clear();
        if let Err(e) = result {
            warn!("HCI: opcode 0x{:04X} failed: {}", opcode, e);
        }
        result
    }

    fn wait_reply<P, H>(
        &mut self,
        port: &mut P,
        handler: &mut H,
        req: &mut CommandRequest<'_>,
        opcode: u16,
    ) -> Result<usize, HciError>
    where
        P: Dispatcher,
        H: AsyncEventHandler,
    {
        loop {
            let step = match port.dispatch_one_event() {
                None => Step::Drained,
                Some(PlatformEvent::Tick) => Step::Tick,
                Some(PlatformEvent::Hci(raw)) => Step::Packet(self.pool.intake(raw)),
                Some(other) => {
                    handler.on_unrouted(other);
                    Step::Other
                }
            };

            match step {
                Step::Drained => {
                    warn!("HCI: dispatcher drained while awaiting 0x{:04X}", opcode);
                    return Err(HciError::Timeout);
                }
                Step::Tick => {
                    handler.on_tick();
                    if self.deadline.tick(self.tick) == DeadlineState::Expired {
                        return Err(HciError::Timeout);
                    }
                }
                Step::Other => {}
                Step::Packet(Err(e)) => {
                    warn!("HCI: dropped packet ({})", e);
                }
                Step::Packet(Ok(slot)) => {
                    let matches = Self::is_reply(self.pool.packet(slot), opcode, req.expect);
                    let queue = if matches { Queue::Reply } else { Queue::Async };
                    if let Err(e) = self.pool.enqueue(queue, slot) {
                        warn!("HCI: queue full ({}), dropping packet", e);
                        self.pool.release(slot);
                    }
                    self.drain_async(handler);

                    if let Some(reply) = self.pool.dequeue_head(Queue::Reply) {
                        let pkt = self.pool.packet(reply);
                        // A free command slot ends command-busy; the request
                        // deadline runs until the request itself finishes.
                        if pkt.kind() == EventKind::CommandStatus && pkt.ncmd().unwrap_or(0) > 0 {
                            self.busy = false;
                        }
                        let verdict = Self::judge(pkt, req);
                        self.pool.release(reply);
                        match verdict {
                            Verdict::Done(n) => return Ok(n),
                            Verdict::Failed(e) => return Err(e),
                            Verdict::KeepWaiting => {}
                        }
                    }
                }
            }
        }
    }

    /// Deliver a packet that arrived outside any request.
    pub fn on_packet<H: AsyncEventHandler>(&mut self, raw: &[u8], handler: &mut H) -> Result<(), HciError> {
        let slot = self.pool.intake(raw)?;
        if let Err(e) = self.pool.enqueue(Queue::Async, slot) {
            self.pool.release(slot);
            return Err(e);
        }
        self.drain_async(handler);
        Ok(())
    }

    fn drain_async<H: AsyncEventHandler>(&mut self, handler: &mut H) {
        while let Some(slot) = self.pool.dequeue_head(Queue::Async) {
            handler.on_async_event(self.pool.packet(slot));
            self.pool.release(slot);
        }
    }

    fn is_reply(pkt: &EventPacket, opcode: u16, expect: Expect) -> bool {
        match pkt.kind() {
            EventKind::CommandComplete | EventKind::CommandStatus => pkt.opcode() == Some(opcode),
            EventKind::LeMeta(sub) => expect == Expect::LeMeta(sub),
            EventKind::HardwareError => true,
            EventKind::Asynchronous => false,
        }
    }

    fn judge(pkt: &EventPacket, req: &mut CommandRequest<'_>) -> Verdict {
        match pkt.kind() {
            EventKind::CommandStatus => {
                let status = pkt.status().unwrap_or(0);
                let slot_free = pkt.ncmd().unwrap_or(0) > 0;
                match req.expect {
                    Expect::CommandStatus => Verdict::Done(copy_truncated(req.reply, pkt.params())),
                    _ if status != 0 => Verdict::Failed(HciError::Controller(status)),
                    // No command-complete follows a status the controller
                    // acknowledged with a free slot.
                    Expect::CommandComplete if slot_free => {
                        Verdict::Done(copy_truncated(req.reply, &[status]))
                    }
                    _ => Verdict::KeepWaiting,
                }
            }
            EventKind::CommandComplete | EventKind::LeMeta(_) => {
                Verdict::Done(copy_truncated(req.reply, pkt.return_params()))
            }
            EventKind::HardwareError => {
                Verdict::Failed(HciError::Hardware(pkt.params().first().copied().unwrap_or(0)))
            }
            EventKind::Asynchronous => Verdict::KeepWaiting,
        }
    }
}

/// Copy as much of `src` as fits; never more than `dst` holds.
fn copy_truncated(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

// ── Tests ─────────────────────────────────────────────────────
