//! Submission/completion queue state and preallocated request slots.
//!
//! A submission queue owns one request slot per queue entry. Slots move
//! free → in-flight when an SQE is consumed, leave the in-flight chain when
//! their completion is queued on the paired CQ, and return to the free chain
//! once the completion entry has been posted to guest memory. The two chains
//! are doubly-linked index lists embedded in the slot array, so every move is
//! O(1) and allocation-free.

use std::collections::VecDeque;

use crate::prp::PrpMapping;
use crate::regs::NVME_SUCCESS;

const NO_SLOT: u16 = u16::MAX;

#[derive(Debug, Default)]
pub struct Request {
    pub cid: u16,
    pub status: u16,
    /// CQE dword 0 (command-specific result).
    pub result: u32,
    pub mapping: Option<PrpMapping>,
    pub aio_token: Option<u64>,
    /// Set for reads so the completion path scatters engine data to the guest.
    pub is_read: bool,
    prev: u16,
    next: u16,
}

impl Request {
    fn new() -> Self {
        Self {
            prev: NO_SLOT,
            next: NO_SLOT,
            ..Default::default()
        }
    }

    pub fn reset(&mut self, cid: u16) {
        self.cid = cid;
        self.status = NVME_SUCCESS;
        self.result = 0;
        self.mapping = None;
        self.aio_token = None;
        self.is_read = false;
    }
}

/// Doubly-linked list threaded through `Request::prev`/`next`.
#[derive(Debug, Clone, Copy)]
struct SlotChain {
    head: u16,
    tail: u16,
    len: u16,
}

impl SlotChain {
    fn new() -> Self {
        Self {
            head: NO_SLOT,
            tail: NO_SLOT,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, slots: &mut [Request], idx: u16) {
        let i = idx as usize;
        slots[i].prev = self.tail;
        slots[i].next = NO_SLOT;
        if self.tail != NO_SLOT {
            slots[self.tail as usize].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    fn remove(&mut self, slots: &mut [Request], idx: u16) {
        let (prev, next) = {
            let r = &slots[idx as usize];
            (r.prev, r.next)
        };
        if prev != NO_SLOT {
            slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NO_SLOT {
            slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        slots[idx as usize].prev = NO_SLOT;
        slots[idx as usize].next = NO_SLOT;
        self.len -= 1;
    }

    fn pop_front(&mut self, slots: &mut [Request]) -> Option<u16> {
        if self.head == NO_SLOT {
            return None;
        }
        let idx = self.head;
        self.remove(slots, idx);
        Some(idx)
    }

    fn indices(&self, slots: &[Request]) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.len as usize);
        let mut cur = self.head;
        while cur != NO_SLOT {
            out.push(cur);
            cur = slots[cur as usize].next;
        }
        out
    }
}

pub struct SubQueue {
    pub sqid: u16,
    pub cqid: u16,
    pub dma_addr: u64,
    pub size: u16,
    pub head: u16,
    pub tail: u16,
    slots: Vec<Request>,
    free: SlotChain,
    in_flight: SlotChain,
}

impl SubQueue {
    pub fn new(sqid: u16, cqid: u16, dma_addr: u64, size: u32) -> Self {
        let size = size as usize;
        let mut slots: Vec<Request> = (0..size).map(|_| Request::new()).collect();
        let mut free = SlotChain::new();
        for idx in 0..size as u16 {
            free.push_back(&mut slots, idx);
        }
        Self {
            sqid,
            cqid,
            dma_addr,
            size: size as u16,
            head: 0,
            tail: 0,
            slots,
            free,
            in_flight: SlotChain::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn advance_head(&mut self) {
        self.head = (self.head + 1) % self.size;
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free.is_empty()
    }

    /// free → in-flight.
    pub fn take_free_slot(&mut self) -> Option<u16> {
        let idx = self.free.pop_front(&mut self.slots)?;
        self.in_flight.push_back(&mut self.slots, idx);
        Some(idx)
    }

    /// Detach from in-flight; the slot is now owned by a CQ pending entry.
    pub fn remove_in_flight(&mut self, idx: u16) {
        self.in_flight.remove(&mut self.slots, idx);
    }

    /// Return a detached slot to the free chain.
    pub fn release_slot(&mut self, idx: u16) {
        self.free.push_back(&mut self.slots, idx);
    }

    pub fn in_flight_slots(&self) -> Vec<u16> {
        self.in_flight.indices(&self.slots)
    }

    pub fn slot(&self, idx: u16) -> &Request {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u16) -> &mut Request {
        &mut self.slots[idx as usize]
    }
}

pub struct CompQueue {
    pub cqid: u16,
    pub vector: u16,
    pub irq_enabled: bool,
    pub dma_addr: u64,
    pub size: u16,
    pub head: u16,
    pub tail: u16,
    pub phase: bool,
    sq_ids: Vec<u16>,
    /// Completions waiting for a CQ slot, as (sqid, request slot).
    pub pending: VecDeque<(u16, u16)>,
}

impl CompQueue {
    pub fn new(cqid: u16, dma_addr: u64, vector: u16, size: u32, irq_enabled: bool) -> Self {
        Self {
            cqid,
            vector,
            irq_enabled,
            dma_addr,
            size: size as u16,
            head: 0,
            tail: 0,
            phase: true,
            sq_ids: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.size == self.head
    }

    pub fn advance_tail(&mut self) {
        self.tail += 1;
        if self.tail >= self.size {
            self.tail = 0;
            self.phase = !self.phase;
        }
    }

    pub fn attach_sq(&mut self, sqid: u16) {
        self.sq_ids.push(sqid);
    }

    pub fn detach_sq(&mut self, sqid: u16) {
        self.sq_ids.retain(|&id| id != sqid);
    }

    pub fn has_bound_sqs(&self) -> bool {
        !self.sq_ids.is_empty()
    }

    pub fn bound_sqs(&self) -> &[u16] {
        &self.sq_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_free_inflight_free() {
        let mut sq = SubQueue::new(1, 1, 0x1000, 4);
        assert!(sq.has_free_slot());

        let a = sq.take_free_slot().unwrap();
        let b = sq.take_free_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(sq.in_flight_slots(), vec![a, b]);

        // Complete b first; order of release must not corrupt the chains.
        sq.remove_in_flight(b);
        assert_eq!(sq.in_flight_slots(), vec![a]);
        sq.release_slot(b);
        sq.remove_in_flight(a);
        sq.release_slot(a);

        // All four slots are reusable.
        let mut taken = Vec::new();
        while let Some(i) = sq.take_free_slot() {
            taken.push(i);
        }
        assert_eq!(taken.len(), 4);
        assert!(!sq.has_free_slot());
    }

    #[test]
    fn take_exhausts_at_queue_size() {
        let mut sq = SubQueue::new(1, 1, 0, 2);
        assert!(sq.take_free_slot().is_some());
        assert!(sq.take_free_slot().is_some());
        assert!(sq.take_free_slot().is_none());
    }

    #[test]
    fn cq_full_and_phase_flip() {
        let mut cq = CompQueue::new(1, 0, 0, 4, true);
        assert!(cq.phase);
        assert!(!cq.is_full());

        // Fill: capacity is size - 1.
        cq.advance_tail();
        cq.advance_tail();
        cq.advance_tail();
        assert!(cq.is_full());
        assert!(cq.phase, "phase flips only on wrap");

        cq.advance_tail();
        assert_eq!(cq.tail, 0);
        assert!(!cq.phase);
    }

    #[test]
    fn sq_head_wraps() {
        let mut sq = SubQueue::new(0, 0, 0, 3);
        sq.tail = 2;
        sq.advance_head();
        sq.advance_head();
        assert!(sq.is_empty());
        sq.advance_head();
        assert_eq!(sq.head, 0);
    }
}
