//! Per-slot reply mailbox.
//!
//! Each outbound slot has one mailbox, tagged with the sequence of the call
//! occupying the slot.  The calling task arms it before publishing; the event
//! dispatcher fills it when a reply with a matching sequence arrives.
//!
//! The state and sequence share one atomic word so that a reply can only be
//! delivered to the call that sent the matching request, even if the mailbox
//! has since been abandoned and re-armed.
//!
//! Once a call is settled the mailbox stays `COMPLETED` with its sequence
//! until re-armed.  The service core may report a reply both in the slot and
//! on the inbound ring, and the second copy is recognised as a duplicate.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::envelope::{CommandType, Envelope};

const IDLE: u8 = 0;
const WAITING: u8 = 1;
const FILLING: u8 = 2;
const FILLED: u8 = 3;
const ABANDONED: u8 = 4;
const COMPLETED: u8 = 5;

const fn pack(state: u8, sequence: u8) -> u16 {
    ((state as u16) << 8) | sequence as u16
}

const fn state_of(tag: u16) -> u8 {
    (tag >> 8) as u8
}

const fn sequence_of(tag: u16) -> u8 {
    tag as u8
}

/// Result of offering a reply to a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// A waiting caller will pick the reply up.
    Filled,
    /// The caller gave up on this sequence; the slot may be reclaimed.
    Late,
    /// Another copy of a reply already handled.
    Duplicate,
    /// Not for this mailbox.
    Unmatched,
}

pub(crate) struct Mailbox {
    tag: AtomicU16,
    reply: UnsafeCell<Envelope>,
}

// SAFETY: `reply` is only written by the party that moved the tag from
// WAITING to FILLING, and only read after the tag has been observed FILLED.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub(crate) const fn new() -> Self {
        Self {
            tag: AtomicU16::new(pack(IDLE, 0)),
            reply: UnsafeCell::new(Envelope::new(CommandType::Report, 0)),
        }
    }

    /// Start waiting for a reply to `sequence`.
    pub(crate) fn arm(&self, sequence: u8) {
        self.tag.store(pack(WAITING, sequence), Ordering::Release);
    }

    /// Whether the mailbox is in use by a call with `sequence`, waiting,
    /// filled, abandoned or completed.  A held sequence must not be reused,
    /// or a duplicate of the old reply could reach the new call.
    pub(crate) fn holds(&self, sequence: u8) -> bool {
        let tag = self.tag.load(Ordering::Acquire);
        state_of(tag) != IDLE && sequence_of(tag) == sequence
    }

    /// Offer an inbound reply.  Called from the event dispatcher only.
    pub(crate) fn deliver(&self, reply: &Envelope) -> Delivery {
        let sequence = reply.sequence;
        match self.tag.compare_exchange(
            pack(WAITING, sequence),
            pack(FILLING, sequence),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: FILLING gives this side exclusive access to the cell
                unsafe { *self.reply.get() = *reply };
                self.tag.store(pack(FILLED, sequence), Ordering::Release);
                Delivery::Filled
            }
            Err(tag) if tag == pack(ABANDONED, sequence) => {
                if self.complete_abandoned(sequence) {
                    Delivery::Late
                } else {
                    self.deliver(reply)
                }
            }
            Err(tag) if tag == pack(COMPLETED, sequence) => Delivery::Duplicate,
            Err(_) => Delivery::Unmatched,
        }
    }

    /// Take a delivered reply, leaving the mailbox completed.
    pub(crate) fn take(&self) -> Option<Envelope> {
        let tag = self.tag.load(Ordering::Acquire);
        if state_of(tag) != FILLED {
            return None;
        }
        // SAFETY: FILLED is only left by this side, nothing writes the cell now
        let reply = unsafe { *self.reply.get() };
        self.tag
            .store(pack(COMPLETED, sequence_of(tag)), Ordering::Release);
        Some(reply)
    }

    /// Stop waiting for a call that was never published.  Returns a reply
    /// if one was delivered in the meantime.
    pub(crate) fn disarm(&self) -> Option<Envelope> {
        self.settle(IDLE)
    }

    /// The reply was read from the slot itself.  Any copy still to arrive
    /// inbound is a duplicate.  Returns the inbound copy if it won the race.
    pub(crate) fn complete(&self) -> Option<Envelope> {
        self.settle(COMPLETED)
    }

    /// Give up on the call after a timeout.  Returns a reply if one was
    /// delivered in the meantime, in which case the mailbox is left
    /// completed rather than abandoned.
    pub(crate) fn abandon(&self) -> Option<Envelope> {
        self.settle(ABANDONED)
    }

    /// Mark an abandoned call for `sequence` as settled by the far side.
    pub(crate) fn complete_abandoned(&self, sequence: u8) -> bool {
        self.tag
            .compare_exchange(
                pack(ABANDONED, sequence),
                pack(COMPLETED, sequence),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn sequence(&self) -> u8 {
        sequence_of(self.tag.load(Ordering::Acquire))
    }

    pub(crate) fn reset(&self) {
        self.tag.store(pack(IDLE, 0), Ordering::Release);
    }
}

// Internal functions
impl Mailbox {
    fn settle(&self, to: u8) -> Option<Envelope> {
        loop {
            let tag = self.tag.load(Ordering::Acquire);
            match state_of(tag) {
                WAITING => {
                    let next = if to == IDLE {
                        pack(IDLE, 0)
                    } else {
                        pack(to, sequence_of(tag))
                    };
                    if self
                        .tag
                        .compare_exchange(tag, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return None;
                    }
                }
                // The dispatcher is mid-copy, and never blocks
                FILLING => core::hint::spin_loop(),
                FILLED => return self.take(),
                _ => return None,
            }
        }
    }
}
