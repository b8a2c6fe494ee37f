//! Event Dispatcher: drains the inbound ring from the inbound doorbell
//! interrupt.
//!
//! Each inbound envelope is either:
//! - a `Report`, handed to the handler registered for its subid, or dropped
//!   if there is none
//! - a reply, delivered to the mailbox of the call with the matching
//!   sequence, after which the completion event is signalled
//!
//! Nothing here blocks or allocates.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::sync::atomic::{Ordering, fence};

use crate::envelope::{CommandType, Envelope};
use crate::port::{CompletionEvent, Delay};
use crate::regfile::{Direction, SharedIo};
use crate::ring::Slot;
use crate::{Error, Result};

use super::mailbox::Delivery;
use super::{Counters, Device};

impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    /// Service the inbound doorbell.  Call from the interrupt handler
    /// installed for the instance.
    ///
    /// Processes at most one ring's worth of envelopes per invocation.  Any
    /// protocol error takes the instance out of service.  A nested
    /// invocation returns immediately.
    pub fn handle_interrupt(&self) {
        if self.dispatching.swap(true, Ordering::Acquire) {
            trace!("Device {} dispatcher already running", self.config.instance_id);
            return;
        }
        self.service_doorbell();
        self.dispatching.store(false, Ordering::Release);
    }
}

// Internal functions
impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    fn service_doorbell(&self) {
        let id = self.config.instance_id;
        let regs = self.regs();

        let pending = match regs.doorbell_state(Direction::Inbound) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Device {id} failed to read doorbell: {e:?}");
                return;
            }
        };
        if pending.is_empty() {
            Counters::bump(&self.counters.spurious_interrupts);
            trace!("Device {id} spurious interrupt");
            return;
        }
        if let Err(e) = regs.ack_doorbell(Direction::Inbound, pending) {
            error!("Device {id} failed to acknowledge doorbell: {e:?}");
            return;
        }

        if !self.is_ready() {
            debug!("Device {id} not ready, ignoring doorbell {pending:?}");
            return;
        }

        match self.drain_inbound() {
            Ok(count) => trace!("Device {id} drained {count} inbound"),
            Err(Error::Protocol) => self.fail_protocol("inbound ring"),
            Err(e) => error!("Device {id} inbound drain failed: {e:?}"),
        }
    }

    /// Dispatch every envelope the far side has posted, up to the ring's
    /// capacity.  Returns how many were dispatched.
    fn drain_inbound(&self) -> Result<u32> {
        let regs = self.regs();
        let mut drained = 0;
        while drained < self.rings.inbound_capacity() {
            let Some(slot) = self.rings.next_inbound(&regs)? else {
                break;
            };
            fence(Ordering::Acquire);
            let envelope = self.read_inbound(slot)?;
            self.dispatch(&envelope)?;
            self.rings.advance_inbound(&regs, slot)?;
            drained += 1;
        }
        Ok(drained)
    }

    fn read_inbound(&self, slot: Slot) -> Result<Envelope> {
        self.read_frame(self.inbound_addr(slot)).map_err(|e| {
            error!(
                "Device {} undecodable envelope in inbound slot {}: {e:?}",
                self.config.instance_id,
                slot.index()
            );
            Error::Protocol
        })
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        match envelope.command_type {
            CommandType::Report => {
                self.dispatch_report(envelope);
                Ok(())
            }
            _ => self.dispatch_reply(envelope),
        }
    }

    fn dispatch_report(&self, envelope: &Envelope) {
        let subid = envelope.command_subid;
        match self.handlers.get(subid as usize).copied().flatten() {
            Some(handler) => {
                Counters::bump(&self.counters.events_dispatched);
                handler(envelope);
            }
            None => {
                Counters::bump(&self.counters.events_dropped);
                trace!(
                    "Device {} dropped report {subid}, no handler",
                    self.config.instance_id
                );
            }
        }
    }

    fn dispatch_reply(&self, envelope: &Envelope) -> Result<()> {
        let id = self.config.instance_id;
        let sequence = envelope.sequence;
        if !envelope.status_major.is_terminal() {
            trace!("Device {id} seq {sequence} {:?}", envelope.status_major);
            return Ok(());
        }

        for index in 0..self.rings.outbound_capacity() {
            match self.mailboxes[index as usize].deliver(envelope) {
                Delivery::Filled => {
                    debug!("Device {id} reply seq {sequence} matched slot {index}");
                    self.event.signal();
                    return Ok(());
                }
                Delivery::Late => {
                    debug!("Device {id} late reply seq {sequence} for slot {index}");
                    self.rings.reclaim(Slot::new(index));
                    return Ok(());
                }
                Delivery::Duplicate => {
                    Counters::bump(&self.counters.duplicate_replies);
                    debug!("Device {id} dropped duplicate reply seq {sequence} for slot {index}");
                    return Ok(());
                }
                Delivery::Unmatched => {}
            }
        }

        error!("Device {id} reply seq {sequence} matches no outstanding call");
        Err(Error::Protocol)
    }
}
