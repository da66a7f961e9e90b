//! Preallocated HCI event packet pool.
//!
//! Every slot is, at any time, in exactly one of three places: the free
//! list, the reply queue (holds at most one packet) or the async queue.
//! When intake finds the free list empty it fails with `PoolExhausted`
//! and stores nothing; the platform keeps the packet and re-delivers it
//! once a slot has been released.

use heapless::Deque;
use log::warn;

use super::EventPacket;
use crate::error::HciError;

/// Default number of packet slots.
pub const POOL_SIZE: usize = 8;

/// Index of a slot in the pool.
pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Reply,
    Async,
}

pub struct PacketPool<const N: usize = POOL_SIZE> {
    slots: [EventPacket; N],
    free: Deque<SlotId, N>,
    reply: Option<SlotId>,
    pending: Deque<SlotId, N>,
}

impl<const N: usize> PacketPool<N> {
    pub fn new() -> Self {
        let mut free = Deque::new();
        for id in 0..N {
            let _ = free.push_back(id);
        }
        Self {
            slots: core::array::from_fn(|_| EventPacket::empty()),
            free,
            reply: None,
            pending: Deque::new(),
        }
    }

    /// Take a slot off the free list.
    pub fn take_free(&mut self) -> Option<SlotId> {
        self.free.pop_front()
    }

    /// Verify `raw` and store it in a free slot. The slot is not queued yet.
    pub fn intake(&mut self, raw: &[u8]) -> Result<SlotId, HciError> {
        let slot = self.take_free().ok_or(HciError::PoolExhausted)?;
        match EventPacket::parse(raw) {
            Ok(pkt) => {
                self.slots[slot] = pkt;
                Ok(slot)
            }
            Err(e) => {
                self.release(slot);
                Err(e)
            }
        }
    }

    pub fn packet(&self, slot: SlotId) -> &EventPacket {
        &self.slots[slot]
    }

    /// Queue a slot taken with [`take_free`](Self::take_free) or
    /// [`intake`](Self::intake). Fails with `Busy` if the reply queue is
    /// already occupied; the slot is left with the caller.
    pub fn enqueue(&mut self, queue: Queue, slot: SlotId) -> Result<(), HciError> {
        match queue {
            Queue::Reply => {
                if self.reply.is_some() {
                    return Err(HciError::Busy);
                }
                self.reply = Some(slot);
                Ok(())
            }
            Queue::Async => self.pending.push_back(slot).map_err(|_| HciError::PoolExhausted),
        }
    }

    pub fn dequeue_head(&mut self, queue: Queue) -> Option<SlotId> {
        match queue {
            Queue::Reply => self.reply.take(),
            Queue::Async => self.pending.pop_front(),
        }
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: SlotId) {
        if slot >= N || self.free.iter().any(|&s| s == slot) {
            warn!("HCI: ignoring release of slot {} (not in use)", slot);
            return;
        }
        self.slots[slot] = EventPacket::empty();
        let _ = self.free.push_back(slot);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn async_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for PacketPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────
