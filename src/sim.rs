//! Simulated register file, shared memory and service core, for tests.
//!
//! Addresses below [`SHM_BASE`] map onto the register file at [`REG_BASE`],
//! the rest onto a shared memory region holding the outbound slots followed
//! directly by the inbound slots.  The far side helpers act as the service
//! core would: they consume outbound slots, complete them in place, and post
//! envelopes on the inbound ring.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::vec::Vec;

use crate::envelope::{Envelope, StatusMajor};
use crate::regfile::{
    Doorbell, REGFILE_SIZE, RX_HEAD, RX_TAIL, S2M_INT_STATE, SharedIo, TX_HEAD, TX_TAIL,
};
use crate::{Error, Result};

pub(crate) const REG_BASE: usize = 0x4000_0000;
pub(crate) const SHM_BASE: usize = 0x8000_0000;

pub(crate) struct SimIo {
    regs: Vec<AtomicU32>,
    shmem: Vec<AtomicU32>,
    frame_size: usize,
    outbound_capacity: u32,
    inbound_capacity: u32,
    writes: AtomicUsize,
    /// Register offset whose writes fail, `usize::MAX` for none
    failing_reg: AtomicUsize,
}

impl SimIo {
    pub(crate) fn new(frame_size: usize, outbound_capacity: u32, inbound_capacity: u32) -> Self {
        let shmem_words =
            (outbound_capacity + inbound_capacity) as usize * frame_size / 4;
        Self {
            regs: (0..REGFILE_SIZE / 4).map(|_| AtomicU32::new(0)).collect(),
            shmem: (0..shmem_words).map(|_| AtomicU32::new(0)).collect(),
            frame_size,
            outbound_capacity,
            inbound_capacity,
            writes: AtomicUsize::new(0),
            failing_reg: AtomicUsize::new(usize::MAX),
        }
    }

    pub(crate) fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4].load(Ordering::SeqCst)
    }

    pub(crate) fn set_reg(&self, offset: usize, value: u32) {
        self.regs[offset / 4].store(value, Ordering::SeqCst);
    }

    /// Make every write to the register at `offset` fail with
    /// [`Error::Io`], or none with `None`.
    pub(crate) fn fail_writes_to(&self, offset: Option<usize>) {
        self.failing_reg
            .store(offset.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Number of writes made through [`SharedIo`]
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn outbound_addr(&self, slot: u32) -> usize {
        SHM_BASE + slot as usize * self.frame_size
    }

    pub(crate) fn inbound_addr(&self, slot: u32) -> usize {
        SHM_BASE + (self.outbound_capacity + slot) as usize * self.frame_size
    }

    /// Number of outbound slots published but not yet consumed
    pub(crate) fn outbound_pending(&self) -> u32 {
        let head = self.reg(TX_HEAD);
        let tail = self.reg(TX_TAIL);
        (tail + self.outbound_capacity - head) % self.outbound_capacity
    }

    pub(crate) fn peek_outbound(&self, slot: u32) -> Envelope {
        Envelope::decode(&self.frame(self.outbound_addr(slot))).unwrap()
    }

    /// Consume the oldest published outbound slot, advancing TX_HEAD.
    pub(crate) fn take_outbound(&self) -> Option<(u32, Envelope)> {
        let head = self.reg(TX_HEAD);
        if head == self.reg(TX_TAIL) {
            return None;
        }
        let envelope = self.peek_outbound(head);
        self.set_reg(TX_HEAD, (head + 1) % self.outbound_capacity);
        Some((head, envelope))
    }

    /// Write a completion into the outbound slot itself.
    pub(crate) fn complete_in_place(&self, slot: u32, status: StatusMajor, minor: u8, payload: &[u8]) {
        let mut envelope = self.peek_outbound(slot);
        envelope.status_major = status;
        envelope.status_minor = minor;
        envelope.set_payload(payload).unwrap();
        self.store_frame(self.outbound_addr(slot), &envelope);
    }

    /// Overwrite an outbound slot, as a misbehaving service core might.
    pub(crate) fn write_outbound(&self, slot: u32, envelope: &Envelope) {
        self.store_frame(self.outbound_addr(slot), envelope);
    }

    /// Post an envelope on the inbound ring and raise the doorbell.
    pub(crate) fn post_inbound(&self, envelope: &Envelope) {
        let tail = self.reg(RX_TAIL);
        assert_ne!(
            (tail + 1) % self.inbound_capacity,
            self.reg(RX_HEAD),
            "simulated inbound ring full"
        );
        self.store_frame(self.inbound_addr(tail), envelope);
        self.set_reg(RX_TAIL, (tail + 1) % self.inbound_capacity);
        let state = self.reg(S2M_INT_STATE);
        self.set_reg(S2M_INT_STATE, state | Doorbell::RX_TAIL.bits());
    }

    /// Build the reply the service core would send for `request`.
    pub(crate) fn reply(request: &Envelope, status: StatusMajor, minor: u8, payload: &[u8]) -> Envelope {
        let mut reply = Envelope::with_payload(request.command_type, request.command_subid, payload).unwrap();
        reply.sequence = request.sequence;
        reply.status_major = status;
        reply.status_minor = minor;
        reply
    }

    fn frame(&self, addr: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.frame_size);
        for i in 0..self.frame_size / 4 {
            let word = self.shmem[(addr - SHM_BASE) / 4 + i].load(Ordering::SeqCst);
            frame.extend_from_slice(&word.to_le_bytes());
        }
        frame
    }

    /// The status word goes last, so a poller never sees a terminal status
    /// ahead of the payload.
    fn store_frame(&self, addr: usize, envelope: &Envelope) {
        let mut frame = std::vec![0u8; self.frame_size];
        envelope.encode(&mut frame).unwrap();
        let words: Vec<u32> = frame
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let base = (addr - SHM_BASE) / 4;
        for (i, word) in words.iter().enumerate().filter(|(i, _)| *i != 1) {
            self.shmem[base + i].store(*word, Ordering::SeqCst);
        }
        self.shmem[base + 1].store(words[1], Ordering::SeqCst);
    }

    fn word(&self, addr: usize) -> Result<&AtomicU32> {
        if addr % 4 != 0 {
            return Err(Error::NotAligned);
        }
        if (REG_BASE..REG_BASE + REGFILE_SIZE).contains(&addr) {
            Ok(&self.regs[(addr - REG_BASE) / 4])
        } else if addr >= SHM_BASE && (addr - SHM_BASE) / 4 < self.shmem.len() {
            Ok(&self.shmem[(addr - SHM_BASE) / 4])
        } else {
            Err(Error::Io)
        }
    }
}

impl SharedIo for SimIo {
    fn read_u32(&self, addr: usize) -> Result<u32> {
        Ok(self.word(addr)?.load(Ordering::SeqCst))
    }

    fn write_u32(&self, addr: usize, value: u32) -> Result<()> {
        if addr.checked_sub(REG_BASE) == Some(self.failing_reg.load(Ordering::SeqCst)) {
            return Err(Error::Io);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.word(addr)?.store(value, Ordering::SeqCst);
        Ok(())
    }
}
