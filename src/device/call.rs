//! Call Dispatcher: publish a request on the outbound ring and wait for its
//! reply.
//!
//! Only one call is in flight per device instance at a time, enforced by the
//! call lock.  A call:
//! 1. acquires the call lock under the instance's [`super::LockPolicy`]
//! 2. reserves the outbound tail slot, writes the envelope with a fresh
//!    sequence number, arms the slot's mailbox and publishes the slot
//! 3. waits for a terminal status, either by polling the slot or by
//!    sleeping on the completion event
//! 4. returns the reply, or gives the slot up as abandoned on timeout
//!
//! [`Device::call_pipelined()`] publishes several requests before waiting,
//! and collects replies in whatever order they arrive.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::sync::atomic::{Ordering, fence};

use crate::envelope::{CommandType, Envelope, StatusMajor, payload_capacity};
use crate::port::{CompletionEvent, Delay};
use crate::regfile::SharedIo;
use crate::ring::{MAX_SLOTS, Slot, SlotState};
use crate::{Error, Result};

use super::{Completion, Counters, Device};

/// One request to be sent by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub command_type: CommandType,
    pub command_subid: u8,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    pub const fn new(command_type: CommandType, command_subid: u8, payload: &'a [u8]) -> Self {
        Self {
            command_type,
            command_subid,
            payload,
        }
    }
}

/// A successful reply from the service core.
///
/// Replies with an error status are returned as [`Error::Status`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply(Envelope);

impl Reply {
    /// Secondary status, meaning owned by the peripheral client
    pub fn status_minor(&self) -> u8 {
        self.0.status_minor
    }

    pub fn payload(&self) -> &[u8] {
        self.0.payload()
    }

    pub fn sequence(&self) -> u8 {
        self.0.sequence
    }

    pub fn envelope(&self) -> &Envelope {
        &self.0
    }
}

/// A published request awaiting its reply
#[derive(Debug, Clone, Copy)]
pub(super) struct InFlight {
    /// Position in the caller's request list
    pub(super) index: usize,
    pub(super) slot: Slot,
    pub(super) sequence: u8,
}

/// Progress through one call's requests.  Each published request holds a
/// distinct outbound slot, so there are never more than [`MAX_SLOTS`] in
/// flight.
pub(super) struct Pipeline {
    inflight: [Option<InFlight>; MAX_SLOTS],
    /// First request not yet published
    next: usize,
}

impl Pipeline {
    pub(super) const fn new() -> Self {
        Self {
            inflight: [None; MAX_SLOTS],
            next: 0,
        }
    }

    fn push(&mut self, entry: InFlight) {
        if let Some(free) = self.inflight.iter_mut().find(|e| e.is_none()) {
            *free = Some(entry);
        }
    }

    pub(super) fn is_idle(&self) -> bool {
        self.inflight.iter().all(Option::is_none)
    }

    fn inflight_mut(&mut self) -> impl Iterator<Item = &mut Option<InFlight>> {
        self.inflight.iter_mut().filter(|e| e.is_some())
    }
}

impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    /// Send one request and wait for its reply.
    ///
    /// Returns:
    /// - the reply, if the service core completed the request successfully
    /// - [`Error::Status`] if it completed with an error status
    /// - [`Error::Busy`] if another call holds the instance
    /// - [`Error::RingFull`] if no outbound slot is free
    /// - [`Error::Timeout`] if no reply arrived in time.  The slot stays
    ///   unusable until the service core is done with it.
    /// - [`Error::Uninit`] if the instance is not ready
    /// - [`Error::Protocol`] if the service core broke the ring protocol,
    ///   after which the instance is not ready until reinitialized
    pub fn call(&self, command_type: CommandType, command_subid: u8, payload: &[u8]) -> Result<Reply> {
        let request = Request::new(command_type, command_subid, payload);
        let mut replies = [Err(Error::Timeout)];
        self.call_pipelined(&[request], &mut replies)?;
        replies[0]
    }

    /// Send several requests, publishing as many as the outbound ring holds
    /// before waiting, and collect their replies in any order.
    ///
    /// `replies[i]` receives the outcome of `requests[i]`.  An error for the
    /// whole operation (lock, readiness, argument or protocol failure) is
    /// returned directly, otherwise each request's outcome is in `replies`.
    /// Once one wait times out, all requests still outstanding are failed
    /// with [`Error::Timeout`].
    pub fn call_pipelined(&self, requests: &[Request<'_>], replies: &mut [Result<Reply>]) -> Result<()> {
        self.check_requests(requests, replies)?;
        let _guard = self.lock()?;
        self.check_ready()?;

        let mut pipeline = Pipeline::new();
        let result = self.run_pipeline(requests, replies, &mut pipeline);
        self.finish(result, requests.len(), replies, &mut pipeline)
    }

    /// Reset a peripheral to its defaults.
    pub fn reset_defaults(&self, command_subid: u8) -> Result<Reply> {
        self.call(CommandType::Default, command_subid, &[])
    }

    pub fn set(&self, command_subid: u8, payload: &[u8]) -> Result<Reply> {
        self.call(CommandType::Set, command_subid, payload)
    }

    pub fn get(&self, command_subid: u8, payload: &[u8]) -> Result<Reply> {
        self.call(CommandType::Get, command_subid, payload)
    }

    pub fn send_data(&self, command_subid: u8, payload: &[u8]) -> Result<Reply> {
        self.call(CommandType::Data, command_subid, payload)
    }

    /// Query the peripheral's protocol version or capabilities.
    pub fn query_protocol(&self, command_subid: u8) -> Result<Reply> {
        self.call(CommandType::Protocol, command_subid, &[])
    }
}

// Internal functions
impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    /// Reject arguments before anything touches the rings.
    pub(super) fn check_requests(&self, requests: &[Request<'_>], replies: &[Result<Reply>]) -> Result<()> {
        if replies.len() < requests.len() {
            return Err(Error::InvalidParameter);
        }
        let capacity = payload_capacity(self.config.frame_size);
        if let Some(request) = requests.iter().find(|r| r.payload.len() > capacity) {
            debug!(
                "Device {} payload of {} bytes exceeds {capacity}",
                self.config.instance_id,
                request.payload.len()
            );
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn run_pipeline(
        &self,
        requests: &[Request<'_>],
        replies: &mut [Result<Reply>],
        pipeline: &mut Pipeline,
    ) -> Result<()> {
        loop {
            self.submit_while_room(requests, replies, pipeline)?;
            if pipeline.is_idle() {
                return Ok(());
            }

            let progress = match self.config.completion {
                Completion::Polling {
                    interval_us,
                    max_polls,
                } => self.poll_until_any(pipeline, replies, interval_us, max_polls)?,
                Completion::Blocking { timeout_ms } => {
                    self.block_until_any(pipeline, replies, timeout_ms)?
                }
            };

            if !progress {
                self.abandon_all(pipeline, replies, requests.len())?;
                return Ok(());
            }
        }
    }

    /// Publish requests until the ring is full or all are published.
    pub(super) fn submit_while_room(
        &self,
        requests: &[Request<'_>],
        replies: &mut [Result<Reply>],
        pipeline: &mut Pipeline,
    ) -> Result<()> {
        while let Some(request) = requests.get(pipeline.next) {
            match self.submit(request) {
                Ok((slot, sequence)) => pipeline.push(InFlight {
                    index: pipeline.next,
                    slot,
                    sequence,
                }),
                // Wait for room
                Err(Error::RingFull) if !pipeline.is_idle() => return Ok(()),
                Err(Error::Protocol) => return Err(Error::Protocol),
                Err(e) => replies[pipeline.next] = Err(e),
            }
            Counters::bump(&self.counters.calls);
            pipeline.next += 1;
        }
        Ok(())
    }

    /// Write `request` into the tail slot and publish it.
    fn submit(&self, request: &Request<'_>) -> Result<(Slot, u8)> {
        let mut envelope = Envelope::with_payload(request.command_type, request.command_subid, request.payload)?;
        self.reclaim_settled()?;

        let regs = self.regs();
        let slot = self.rings.reserve_outbound(&regs)?;
        let sequence = self.next_sequence();
        envelope.sequence = sequence;

        if let Err(e) = self.write_frame(self.outbound_addr(slot), &envelope) {
            self.rings.unreserve(slot)?;
            return Err(e);
        }

        let mailbox = &self.mailboxes[slot.as_usize()];
        mailbox.arm(sequence);
        if let Err(e) = self.rings.publish_outbound(&regs, slot) {
            self.unwind_publish(slot, e)?;
            return Err(e);
        }

        debug!(
            "Device {} published {:?}/{} seq {sequence} in slot {}",
            self.config.instance_id,
            request.command_type,
            request.command_subid,
            slot.index()
        );
        Ok((slot, sequence))
    }

    /// Undo a failed publish.  A slot the far side never saw is freed.  One
    /// it may have seen is left abandoned, like a timed out call.
    fn unwind_publish(&self, slot: Slot, e: Error) -> Result<()> {
        let mailbox = &self.mailboxes[slot.as_usize()];
        if self.rings.state(slot) == SlotState::Reserved {
            mailbox.disarm();
            return self.rings.unreserve(slot);
        }

        warn!(
            "Device {} slot {} publish failed after tail moved: {e:?}",
            self.config.instance_id,
            slot.index()
        );
        if mailbox.abandon().is_some() {
            // Replied to already
            self.rings.reclaim(slot);
        }
        Ok(())
    }

    /// Free abandoned slots whose status shows the service core has since
    /// completed them.
    pub(super) fn reclaim_settled(&self) -> Result<()> {
        for slot in self.rings.abandoned() {
            let (_, status) = self.read_slot_status(slot)?;
            let status = StatusMajor::try_from(status).inspect_err(|_| {
                error!(
                    "Device {} abandoned slot {} invalid status {status:#04X}",
                    self.config.instance_id,
                    slot.index()
                )
            })?;
            if !status.is_terminal() {
                continue;
            }
            let mailbox = &self.mailboxes[slot.as_usize()];
            self.clear_slot_status(slot)?;
            mailbox.complete_abandoned(mailbox.sequence());
            self.rings.reclaim(slot);
        }
        Ok(())
    }

    pub(super) fn poll_until_any(
        &self,
        pipeline: &mut Pipeline,
        replies: &mut [Result<Reply>],
        interval_us: u32,
        max_polls: u32,
    ) -> Result<bool> {
        for poll in 0..=max_polls {
            if self.collect(pipeline, replies)? > 0 {
                return Ok(true);
            }
            if poll == max_polls {
                break;
            }
            trace!("Device {} poll {poll}", self.config.instance_id);
            self.delay.delay_us(interval_us);
        }
        Ok(false)
    }

    fn block_until_any(
        &self,
        pipeline: &mut Pipeline,
        replies: &mut [Result<Reply>],
        timeout_ms: u32,
    ) -> Result<bool> {
        loop {
            if self.collect(pipeline, replies)? > 0 {
                return Ok(true);
            }
            if !self.event.wait(timeout_ms) {
                // A reply may have landed between the check and the timeout
                return Ok(self.collect(pipeline, replies)? > 0);
            }
        }
    }

    /// Gather every reply that has arrived.  Returns how many did.
    pub(super) fn collect(&self, pipeline: &mut Pipeline, replies: &mut [Result<Reply>]) -> Result<usize> {
        let mut collected = 0;
        for entry in pipeline.inflight_mut() {
            let Some(call) = *entry else { continue };
            if let Some(result) = self.check_completion(&call)? {
                replies[call.index] = result;
                *entry = None;
                collected += 1;
            }
        }
        Ok(collected)
    }

    /// Check one published request for a reply, from the event dispatcher
    /// or, when polling, in the slot itself.
    fn check_completion(&self, call: &InFlight) -> Result<Option<Result<Reply>>> {
        let mailbox = &self.mailboxes[call.slot.as_usize()];
        if let Some(reply) = mailbox.take() {
            self.rings.complete(call.slot)?;
            debug!(
                "Device {} reply seq {} via inbound ring",
                self.config.instance_id, call.sequence
            );
            return Ok(Some(self.reply_result(reply)));
        }

        if !matches!(self.config.completion, Completion::Polling { .. }) {
            return Ok(None);
        }

        let (_, status) = self.read_slot_status(call.slot)?;
        let status = StatusMajor::try_from(status).inspect_err(|_| {
            error!(
                "Device {} slot {} invalid status {status:#04X}",
                self.config.instance_id,
                call.slot.index()
            )
        })?;
        if !status.is_terminal() {
            return Ok(None);
        }

        fence(Ordering::Acquire);
        let reply = self.read_frame(self.outbound_addr(call.slot))?;
        if reply.sequence != call.sequence {
            error!(
                "Device {} slot {} completed seq {} expected {}",
                self.config.instance_id,
                call.slot.index(),
                reply.sequence,
                call.sequence
            );
            return Err(Error::Protocol);
        }

        self.clear_slot_status(call.slot)?;
        // Any copy also posted inbound is dropped as a duplicate
        mailbox.complete();
        self.rings.complete(call.slot)?;
        debug!(
            "Device {} reply seq {} in slot {}",
            self.config.instance_id,
            call.sequence,
            call.slot.index()
        );
        Ok(Some(self.reply_result(reply)))
    }

    /// Give up on everything still outstanding after a timeout.
    pub(super) fn abandon_all(
        &self,
        pipeline: &mut Pipeline,
        replies: &mut [Result<Reply>],
        count: usize,
    ) -> Result<()> {
        for reply in replies[pipeline.next..count].iter_mut() {
            *reply = Err(Error::Timeout);
        }
        pipeline.next = count;

        for entry in pipeline.inflight_mut() {
            let Some(call) = entry.take() else { continue };
            match self.mailboxes[call.slot.as_usize()].abandon() {
                Some(reply) => {
                    self.rings.complete(call.slot)?;
                    replies[call.index] = self.reply_result(reply);
                }
                None => {
                    self.rings.abandon(call.slot);
                    Counters::bump(&self.counters.timeouts);
                    warn!(
                        "Device {} call seq {} in slot {} timed out",
                        self.config.instance_id,
                        call.sequence,
                        call.slot.index()
                    );
                    replies[call.index] = Err(Error::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Resolve the outcome of a pipeline run, failing whatever is still
    /// outstanding on error.
    pub(super) fn finish(
        &self,
        result: Result<()>,
        count: usize,
        replies: &mut [Result<Reply>],
        pipeline: &mut Pipeline,
    ) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };
        if e == Error::Protocol {
            self.fail_protocol("outbound ring");
        }
        for entry in pipeline.inflight_mut() {
            if let Some(call) = entry.take() {
                replies[call.index] = Err(e);
            }
        }
        for reply in replies[pipeline.next..count].iter_mut() {
            *reply = Err(e);
        }
        Err(e)
    }

    fn reply_result(&self, reply: Envelope) -> Result<Reply> {
        match reply.status_major {
            StatusMajor::Success => Ok(Reply(reply)),
            status if status.is_error() => {
                debug!(
                    "Device {} seq {} failed {status:?} minor {:#04X}",
                    self.config.instance_id, reply.sequence, reply.status_minor
                );
                Err(Error::Status {
                    status,
                    minor: reply.status_minor,
                })
            }
            status => {
                error!(
                    "Device {} seq {} completed with {status:?}",
                    self.config.instance_id, reply.sequence
                );
                Err(Error::Protocol)
            }
        }
    }
}
