//! Ring slot allocation for the outbound and inbound rings.
//!
//! Ring indices live in the register file.  The client owns the outbound
//! tail and the inbound head; the service core owns the other two.  A party
//! only ever writes slots it currently owns, as determined by the indices.
//!
//! On top of the indices, each outbound slot carries an ownership state:
//!
//! ```text
//! Free -> Reserved -> Published -> Free
//!                         |
//!                         +-> Abandoned -> Free   (far side acknowledged)
//! ```
//!
//! A slot whose call timed out stays `Abandoned`, and therefore
//! unreservable, until the far side is known to be done with it.
//!
//! The allocator never sleeps and may be used from interrupt context.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::sync::atomic::{AtomicU8, Ordering, fence};

use crate::regfile::{Direction, RegFile, SharedIo};
use crate::{Error, Result};

/// Largest ring capacity supported
pub const MAX_SLOTS: usize = 32;

/// Smallest ring capacity supported
pub const MIN_SLOTS: usize = 2;

/// Index of a slot within a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(u32);

impl Slot {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Ownership state of an outbound slot
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Reserved = 1,
    Published = 2,
    Abandoned = 3,
}

impl From<u8> for SlotState {
    fn from(value: u8) -> Self {
        match value {
            0 => SlotState::Free,
            1 => SlotState::Reserved,
            2 => SlotState::Published,
            _ => SlotState::Abandoned,
        }
    }
}

/// `(tail + 1) % capacity == head`
pub const fn is_full(head: u32, tail: u32, capacity: u32) -> bool {
    (tail + 1) % capacity == head
}

pub const fn is_empty(head: u32, tail: u32) -> bool {
    head == tail
}

/// Check a ring capacity is supported.
pub fn check_capacity(capacity: u32) -> Result<()> {
    if (MIN_SLOTS..=MAX_SLOTS).contains(&(capacity as usize)) {
        Ok(())
    } else {
        Err(Error::InvalidParameter)
    }
}

/// Slot allocator for one device instance's pair of rings.
pub struct SlotAllocator {
    outbound_capacity: u32,
    inbound_capacity: u32,
    states: [AtomicU8; MAX_SLOTS],
}

impl SlotAllocator {
    pub fn new(outbound_capacity: u32, inbound_capacity: u32) -> Result<Self> {
        check_capacity(outbound_capacity)?;
        check_capacity(inbound_capacity)?;

        Ok(Self {
            outbound_capacity,
            inbound_capacity,
            states: [const { AtomicU8::new(SlotState::Free as u8) }; MAX_SLOTS],
        })
    }

    pub const fn outbound_capacity(&self) -> u32 {
        self.outbound_capacity
    }

    pub const fn inbound_capacity(&self) -> u32 {
        self.inbound_capacity
    }

    /// Zero all ring indices and free every slot.
    ///
    /// This writes the far side's indices too, so is only valid while the
    /// service core is not using the rings (initialization and teardown).
    pub fn reset<I: SharedIo>(&self, regs: &RegFile<'_, I>) -> Result<()> {
        for state in self.states.iter() {
            state.store(SlotState::Free as u8, Ordering::Release);
        }
        regs.write_tail(Direction::Outbound, 0)?;
        regs.write_head(Direction::Outbound, 0)?;
        regs.write_head(Direction::Inbound, 0)?;
        regs.write_tail(Direction::Inbound, 0)
    }

    /// Reserve the slot at the current outbound tail.
    ///
    /// Does not advance the tail - [`Self::publish_outbound()`] does that once
    /// the envelope is fully written.  Returns [`Error::RingFull`] if there is
    /// no free slot, including when the tail slot is still abandoned.
    pub fn reserve_outbound<I: SharedIo>(&self, regs: &RegFile<'_, I>) -> Result<Slot> {
        let head = self.outbound_index(regs.read_head(Direction::Outbound)?)?;
        let tail = self.outbound_index(regs.read_tail(Direction::Outbound)?)?;

        if is_full(head, tail, self.outbound_capacity) {
            trace!("Outbound ring full head {head} tail {tail}");
            return Err(Error::RingFull);
        }

        match self.transition(tail, SlotState::Free, SlotState::Reserved) {
            Ok(()) => Ok(Slot(tail)),
            Err(SlotState::Abandoned) => {
                debug!("Outbound slot {tail} still abandoned");
                Err(Error::RingFull)
            }
            Err(state) => {
                error!("Outbound slot {tail} reserved twice, state {state:?}");
                Err(Error::Protocol)
            }
        }
    }

    /// Return a reserved slot that will not be published.
    ///
    /// Fails with [`Error::Protocol`] if the slot is not reserved, including
    /// when a failed [`Self::publish_outbound()`] already exposed it.
    pub fn unreserve(&self, slot: Slot) -> Result<()> {
        self.transition(slot.index(), SlotState::Reserved, SlotState::Free)
            .map_err(|state| {
                error!("Unreserving slot {} in state {state:?}", slot.index());
                Error::Protocol
            })
    }

    /// Expose a reserved slot to the far side: advance the outbound tail and
    /// ring the outbound doorbell.
    ///
    /// On failure the slot is left `Reserved` if the tail did not move, so
    /// can be unreserved.  If the tail moved but the doorbell could not be
    /// rung, the far side may still pick the slot up, so it is left
    /// `Abandoned`.
    pub fn publish_outbound<I: SharedIo>(&self, regs: &RegFile<'_, I>, slot: Slot) -> Result<()> {
        let tail = self.outbound_index(regs.read_tail(Direction::Outbound)?)?;
        if tail != slot.index() {
            error!("Publishing slot {} but tail is {tail}", slot.index());
            return Err(Error::Protocol);
        }
        let state = self.state(slot);
        if state != SlotState::Reserved {
            error!("Publishing slot {tail} in state {state:?}");
            return Err(Error::Protocol);
        }

        // Slot contents must land before the far side can see the new tail
        fence(Ordering::Release);
        regs.write_tail(Direction::Outbound, (tail + 1) % self.outbound_capacity)?;
        self.transition(tail, SlotState::Reserved, SlotState::Published)
            .map_err(|_| Error::Protocol)?;

        regs.ring_doorbell(Direction::Outbound).inspect_err(|e| {
            error!("Outbound slot {tail} published without doorbell: {e:?}");
            self.abandon(slot);
        })
    }

    /// Free a published slot whose terminal status has been observed.
    ///
    /// A slot that was never published cannot complete, so this is reported
    /// as [`Error::Protocol`].
    pub fn complete(&self, slot: Slot) -> Result<()> {
        self.transition(slot.index(), SlotState::Published, SlotState::Free)
            .map_err(|state| {
                error!("Completion for slot {} in state {state:?}", slot.index());
                Error::Protocol
            })
    }

    /// Mark a published slot as abandoned after its call timed out.
    pub fn abandon(&self, slot: Slot) {
        if self
            .transition(slot.index(), SlotState::Published, SlotState::Abandoned)
            .is_ok()
        {
            warn!("Outbound slot {} abandoned", slot.index());
        }
    }

    /// Free an abandoned slot once the far side is known to be done with it.
    pub fn reclaim(&self, slot: Slot) -> bool {
        let reclaimed = self
            .transition(slot.index(), SlotState::Abandoned, SlotState::Free)
            .is_ok();
        if reclaimed {
            debug!("Outbound slot {} reclaimed", slot.index());
        }
        reclaimed
    }

    pub fn state(&self, slot: Slot) -> SlotState {
        SlotState::from(self.states[slot.as_usize()].load(Ordering::Acquire))
    }

    /// Outbound slots currently abandoned
    pub fn abandoned(&self) -> impl Iterator<Item = Slot> + '_ {
        (0..self.outbound_capacity)
            .map(Slot)
            .filter(|slot| self.state(*slot) == SlotState::Abandoned)
    }

    /// The slot at the inbound head, if the far side has posted one.
    pub fn next_inbound<I: SharedIo>(&self, regs: &RegFile<'_, I>) -> Result<Option<Slot>> {
        let head = self.inbound_index(regs.read_head(Direction::Inbound)?)?;
        let tail = self.inbound_index(regs.read_tail(Direction::Inbound)?)?;

        if is_empty(head, tail) {
            Ok(None)
        } else {
            Ok(Some(Slot(head)))
        }
    }

    /// Hand the inbound slot back to the far side by advancing the head.
    pub fn advance_inbound<I: SharedIo>(&self, regs: &RegFile<'_, I>, slot: Slot) -> Result<()> {
        let head = self.inbound_index(slot.index())?;
        regs.write_head(Direction::Inbound, (head + 1) % self.inbound_capacity)
    }
}

// Internal functions
impl SlotAllocator {
    fn transition(&self, index: u32, from: SlotState, to: SlotState) -> core::result::Result<(), SlotState> {
        self.states[index as usize]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotState::from)
    }

    fn outbound_index(&self, index: u32) -> Result<u32> {
        check_index(Direction::Outbound, index, self.outbound_capacity)
    }

    fn inbound_index(&self, index: u32) -> Result<u32> {
        check_index(Direction::Inbound, index, self.inbound_capacity)
    }
}

fn check_index(direction: Direction, index: u32, capacity: u32) -> Result<u32> {
    if index < capacity {
        Ok(index)
    } else {
        error!("{direction:?} ring index {index} outside capacity {capacity}");
        Err(Error::Protocol)
    }
}
