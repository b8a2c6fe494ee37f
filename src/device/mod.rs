//! A device instance: one virtual peripheral backed by a register file and a
//! pair of rings in shared memory.
//!
//! Each instance owns:
//! - its configuration ([`DeviceConfig`])
//! - the outbound and inbound slot allocator
//! - a reply mailbox per outbound slot
//! - a call lock, so that at most one call is in flight per instance
//! - a table of event handlers for unsolicited `Report` messages
//!
//! Instances are created with [`Device::initialize()`], configured (event
//! handlers registered) while still exclusively owned, then shared between
//! the calling tasks and the inbound interrupt handler, typically by placing
//! them in a `static`.  Nothing in the instance allocates.
//!
//! ```rust,ignore
//! let config = DeviceConfig::new(0x4A00_0000, 0x8F00_0000);
//! let mut device = Device::initialize(config, MmioIo::new(), event, delay)?;
//! device.register_event_handler(EventId::new(1)?, &on_card_detect);
//! static DEVICE: StaticCell<Device<...>> = StaticCell::new();
//! let device = DEVICE.init(device);
//! device.attach_irq(&mut gic)?;
//!
//! let reply = device.get(0x02, &[])?;
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod call;
pub mod event;
#[cfg(feature = "async")]
pub mod futures;

mod mailbox;

pub use call::{Reply, Request};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::envelope::{Envelope, MAX_FRAME_SIZE, check_frame_size};
use crate::port::{CompletionEvent, Delay, InterruptController};
use crate::regfile::{Direction, Doorbell, RegFile, SharedIo, check_base_addr};
use crate::ring::{MAX_SLOTS, Slot, SlotAllocator};
use crate::{Error, Result};
use mailbox::Mailbox;

/// Default frame size in bytes
pub const DEFAULT_FRAME_SIZE: usize = 64;

/// Default outbound ring capacity
pub const DEFAULT_OUTBOUND_SLOTS: u32 = 20;

/// Default inbound ring capacity
pub const DEFAULT_INBOUND_SLOTS: u32 = 10;

pub const DEFAULT_POLL_INTERVAL_US: u32 = 40;
pub const DEFAULT_MAX_POLLS: u32 = 200;

pub const DEFAULT_LOCK_ATTEMPTS: u32 = 1000;
pub const DEFAULT_LOCK_RETRY_US: u32 = 10;

/// Number of distinct `Report` subids that can have a handler
pub const MAX_EVENTS: usize = 32;

/// Handler for an unsolicited `Report` message.
///
/// Called in interrupt context, so must not block.  The envelope is only
/// valid for the duration of the call.
pub type EventHandler = &'static (dyn Fn(&Envelope) + Sync);

/// Outbound ring capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingSize {
    /// Fixed number of slots
    Fixed(u32),
    /// Read from the service core's MEM_RING_SIZE capability register
    FromRegister,
}

/// How a caller waits for the reply to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Busy-wait on the outbound slot's status, `max_polls` times, every
    /// `interval_us` microseconds.
    Polling { interval_us: u32, max_polls: u32 },
    /// Sleep on the completion event, signalled by the inbound interrupt.
    Blocking { timeout_ms: u32 },
}

/// Bounded acquisition of the per-instance call lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub retry_us: u32,
}

/// Inbound doorbell interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqConfig {
    pub vector: u32,
    pub priority: u32,
}

/// Configuration for a device instance.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Used in log messages only
    pub instance_id: u32,
    pub regfile_base: usize,
    /// Base of the outbound slots
    pub shmem_base: usize,
    pub frame_size: usize,
    pub outbound: RingSize,
    pub inbound_capacity: u32,
    /// Offset of the inbound slots from `shmem_base`.  `None` places them
    /// directly after the outbound slots.
    pub inbound_offset: Option<usize>,
    pub completion: Completion,
    pub lock: LockPolicy,
    pub irq: Option<IrqConfig>,
}

impl DeviceConfig {
    /// Create a configuration with default ring geometry and polling
    /// completion.
    pub const fn new(regfile_base: usize, shmem_base: usize) -> Self {
        Self {
            instance_id: 0,
            regfile_base,
            shmem_base,
            frame_size: DEFAULT_FRAME_SIZE,
            outbound: RingSize::Fixed(DEFAULT_OUTBOUND_SLOTS),
            inbound_capacity: DEFAULT_INBOUND_SLOTS,
            inbound_offset: None,
            completion: Completion::Polling {
                interval_us: DEFAULT_POLL_INTERVAL_US,
                max_polls: DEFAULT_MAX_POLLS,
            },
            lock: LockPolicy {
                attempts: DEFAULT_LOCK_ATTEMPTS,
                retry_us: DEFAULT_LOCK_RETRY_US,
            },
            irq: None,
        }
    }
}

/// Identifies a `Report` message by its `command_subid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(u8);

impl EventId {
    /// Returns [`Error::InvalidParameter`] if `subid` is not below
    /// [`MAX_EVENTS`].
    pub const fn new(subid: u8) -> Result<Self> {
        if (subid as usize) < MAX_EVENTS {
            Ok(Self(subid))
        } else {
            Err(Error::InvalidParameter)
        }
    }

    pub const fn subid(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for EventId {
    type Error = Error;

    fn try_from(subid: u8) -> Result<Self> {
        Self::new(subid)
    }
}

/// Snapshot of a device instance's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Requests submitted, including those that failed
    pub calls: u32,
    pub timeouts: u32,
    pub protocol_errors: u32,
    pub events_dispatched: u32,
    /// `Report` messages with no registered handler
    pub events_dropped: u32,
    /// Inbound interrupts with no doorbell bit set
    pub spurious_interrupts: u32,
    /// Replies received again after their call had already completed
    pub duplicate_replies: u32,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU32,
    timeouts: AtomicU32,
    protocol_errors: AtomicU32,
    events_dispatched: AtomicU32,
    events_dropped: AtomicU32,
    spurious_interrupts: AtomicU32,
    duplicate_replies: AtomicU32,
}

impl Counters {
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            calls: self.calls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            duplicate_replies: self.duplicate_replies.load(Ordering::Relaxed),
        }
    }
}

/// One virtual device instance.
///
/// - `I` accesses the register file and shared memory
/// - `E` is signalled by the inbound interrupt when a reply arrives, and is
///   only waited on with [`Completion::Blocking`] (use
///   [`crate::port::NoEvent`] otherwise)
/// - `D` is used for polling and lock retries
pub struct Device<I: SharedIo, E: CompletionEvent, D: Delay> {
    config: DeviceConfig,
    io: I,
    event: E,
    delay: D,
    rings: SlotAllocator,
    inbound_base: usize,
    ready: AtomicBool,
    dispatching: AtomicBool,
    call_lock: spin::Mutex<()>,
    next_sequence: AtomicU8,
    mailboxes: [Mailbox; MAX_SLOTS],
    handlers: [Option<EventHandler>; MAX_EVENTS],
    counters: Counters,
}

impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    /// Validate `config`, zero the ring indices and enable the inbound
    /// doorbell.
    ///
    /// With [`RingSize::FromRegister`] the outbound capacity is read from
    /// the service core, which must therefore have populated its register
    /// file already.
    pub fn initialize(config: DeviceConfig, io: I, event: E, delay: D) -> Result<Self> {
        check_base_addr(config.regfile_base)?;
        check_base_addr(config.shmem_base)?;
        check_frame_size(config.frame_size)?;
        check_completion(&config.completion)?;

        let outbound_capacity = match config.outbound {
            RingSize::Fixed(capacity) => capacity,
            RingSize::FromRegister => {
                let capacity = RegFile::new(&io, config.regfile_base).read_ring_size()?;
                debug!(
                    "Device {} ring size register reports {capacity} slots",
                    config.instance_id
                );
                capacity
            }
        };
        let rings = SlotAllocator::new(outbound_capacity, config.inbound_capacity).inspect_err(|_| {
            error!(
                "Device {} unsupported ring capacity {outbound_capacity}/{}",
                config.instance_id, config.inbound_capacity
            )
        })?;

        let outbound_size = outbound_capacity as usize * config.frame_size;
        let inbound_offset = config.inbound_offset.unwrap_or(outbound_size);
        if inbound_offset < outbound_size {
            error!(
                "Device {} inbound slots at offset {inbound_offset:#X} overlap outbound slots",
                config.instance_id
            );
            return Err(Error::InvalidParameter);
        }
        let inbound_base = config.shmem_base + inbound_offset;
        check_base_addr(inbound_base)?;

        let device = Self {
            config,
            io,
            event,
            delay,
            rings,
            inbound_base,
            ready: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            call_lock: spin::Mutex::new(()),
            next_sequence: AtomicU8::new(0),
            mailboxes: [const { Mailbox::new() }; MAX_SLOTS],
            handlers: [None; MAX_EVENTS],
            counters: Counters::default(),
        };

        device.bring_up()?;
        info!(
            "Device {} initialized regfile {:#010X} shmem {:#010X} {} outbound {} inbound slots of {} bytes",
            device.config.instance_id,
            device.config.regfile_base,
            device.config.shmem_base,
            device.rings.outbound_capacity(),
            device.rings.inbound_capacity(),
            device.config.frame_size,
        );
        Ok(device)
    }

    /// Stop accepting calls and disable the inbound doorbell.
    ///
    /// Calls still in flight are allowed to complete or time out first.  If
    /// the call lock cannot be acquired under the lock policy, the instance
    /// is left not ready and [`Error::Busy`] is returned, so this can be
    /// retried.  Deinitializing twice is harmless.
    pub fn deinitialize(&self) -> Result<()> {
        let was_ready = self.ready.swap(false, Ordering::AcqRel);
        let _guard = self.lock()?;

        let regs = self.regs();
        regs.mask_doorbell(Direction::Inbound)?;
        self.rings.reset(&regs)?;
        self.reset_mailboxes();

        if was_ready {
            info!("Device {} deinitialized", self.config.instance_id);
        } else {
            debug!("Device {} already deinitialized", self.config.instance_id);
        }
        Ok(())
    }

    /// Bring the instance back into service, for example after a protocol
    /// error.  All slots and mailboxes are freed, abandoned ones included.
    pub fn reinitialize(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.ready.store(false, Ordering::Release);
        self.regs().mask_doorbell(Direction::Inbound)?;
        self.bring_up()?;
        info!("Device {} reinitialized", self.config.instance_id);
        Ok(())
    }

    /// Whether calls are accepted
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn outbound_capacity(&self) -> u32 {
        self.rings.outbound_capacity()
    }

    pub fn inbound_capacity(&self) -> u32 {
        self.rings.inbound_capacity()
    }

    /// Register a handler for `Report` messages with `event`'s subid.
    ///
    /// Returns the handler it replaced, if any.
    pub fn register_event_handler(
        &mut self,
        event: EventId,
        handler: EventHandler,
    ) -> Option<EventHandler> {
        debug!(
            "Device {} handler registered for event {}",
            self.config.instance_id,
            event.subid()
        );
        self.handlers[event.0 as usize].replace(handler)
    }

    pub fn unregister_event_handler(&mut self, event: EventId) -> Option<EventHandler> {
        self.handlers[event.0 as usize].take()
    }

    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    /// Enable or disable logging on the service core.
    pub fn set_debug(&self, enable: bool) -> Result<()> {
        self.regs().set_debug(enable)
    }

    /// Enable or disable the service core's liveness reporting.
    pub fn set_alive(&self, enable: bool) -> Result<()> {
        self.regs().set_alive(enable)
    }

    /// Read one of the hardware passthrough registers.
    pub fn read_passthrough(&self, index: usize) -> Result<u32> {
        self.regs().read_passthrough(index)
    }

    pub fn write_passthrough(&self, index: usize, value: u32) -> Result<()> {
        self.regs().write_passthrough(index, value)
    }

    /// Install and unmask the configured inbound interrupt.
    ///
    /// The controller's handler for the vector must call
    /// [`Self::handle_interrupt()`].  Returns [`Error::InvalidParameter`] if
    /// no interrupt is configured.
    pub fn attach_irq<C: InterruptController>(&self, controller: &mut C) -> Result<()> {
        let irq = self.config.irq.ok_or(Error::InvalidParameter)?;
        controller
            .install(irq.vector, irq.priority)
            .and_then(|_| controller.unmask(irq.vector))
            .map_err(|e| {
                error!(
                    "Device {} failed to attach irq {}: {e:?}",
                    self.config.instance_id, irq.vector
                );
                Error::Io
            })?;
        debug!(
            "Device {} attached irq {} priority {}",
            self.config.instance_id, irq.vector, irq.priority
        );
        Ok(())
    }

    /// Mask the configured inbound interrupt.
    pub fn detach_irq<C: InterruptController>(&self, controller: &mut C) -> Result<()> {
        let irq = self.config.irq.ok_or(Error::InvalidParameter)?;
        controller.mask(irq.vector).map_err(|e| {
            error!(
                "Device {} failed to detach irq {}: {e:?}",
                self.config.instance_id, irq.vector
            );
            Error::Io
        })
    }
}

// Internal functions
impl<I: SharedIo, E: CompletionEvent, D: Delay> Device<I, E, D> {
    fn regs(&self) -> RegFile<'_, I> {
        RegFile::new(&self.io, self.config.regfile_base)
    }

    fn bring_up(&self) -> Result<()> {
        let regs = self.regs();
        self.rings.reset(&regs)?;
        self.reset_mailboxes();
        regs.ack_doorbell(Direction::Inbound, Doorbell::all())?;
        regs.unmask_doorbell(Direction::Inbound)?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn reset_mailboxes(&self) {
        for mailbox in self.mailboxes.iter() {
            mailbox.reset();
        }
    }

    fn check_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Uninit)
        }
    }

    /// Acquire the call lock under the configured lock policy.
    fn lock(&self) -> Result<spin::MutexGuard<'_, ()>> {
        let LockPolicy { attempts, retry_us } = self.config.lock;
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            if let Some(guard) = self.call_lock.try_lock() {
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                self.delay.delay_us(retry_us);
            }
        }
        debug!("Device {} call lock busy", self.config.instance_id);
        Err(Error::Busy)
    }

    /// Next sequence number not held by any outbound slot's mailbox.
    fn next_sequence(&self) -> u8 {
        let mut sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        for _ in 0..u8::MAX {
            if !self.mailboxes.iter().any(|m| m.holds(sequence)) {
                break;
            }
            sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        }
        sequence
    }

    fn outbound_addr(&self, slot: Slot) -> usize {
        self.config.shmem_base + slot.as_usize() * self.config.frame_size
    }

    fn inbound_addr(&self, slot: Slot) -> usize {
        self.inbound_base + slot.as_usize() * self.config.frame_size
    }

    fn write_frame(&self, addr: usize, envelope: &Envelope) -> Result<()> {
        let frame_size = self.config.frame_size;
        let mut frame = [0u8; MAX_FRAME_SIZE];
        envelope.encode(&mut frame[..frame_size])?;

        let mut words = [0u32; MAX_FRAME_SIZE / 4];
        for (word, bytes) in words.iter_mut().zip(frame[..frame_size].chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        self.io.write_bulk(addr, &words[..frame_size / 4])
    }

    fn read_frame(&self, addr: usize) -> Result<Envelope> {
        let frame_size = self.config.frame_size;
        let mut words = [0u32; MAX_FRAME_SIZE / 4];
        self.io.read_bulk(addr, &mut words[..frame_size / 4])?;

        let mut frame = [0u8; MAX_FRAME_SIZE];
        for (bytes, word) in frame[..frame_size].chunks_exact_mut(4).zip(words.iter()) {
            bytes.copy_from_slice(&word.to_le_bytes());
        }
        Envelope::decode(&frame[..frame_size])
    }

    /// Echoed sequence and raw `status_major` of an outbound slot, read
    /// without decoding the rest of the frame.
    fn read_slot_status(&self, slot: Slot) -> Result<(u8, u8)> {
        let addr = self.outbound_addr(slot);
        let header = self.io.read_u32(addr)?;
        let status = self.io.read_u32(addr + 4)?;
        Ok(((header >> 8) as u8, (status >> 24) as u8))
    }

    /// Return an outbound slot's status to `NotReady`.
    fn clear_slot_status(&self, slot: Slot) -> Result<()> {
        let addr = self.outbound_addr(slot) + 4;
        let value = self.io.read_u32(addr)?;
        self.io.write_u32(addr, value & 0x0000_FFFF)
    }

    /// Record a protocol error and take the instance out of service until
    /// reinitialized.
    fn fail_protocol(&self, context: &str) {
        Counters::bump(&self.counters.protocol_errors);
        self.ready.store(false, Ordering::Release);
        error!(
            "Device {} protocol error: {context}, instance not ready",
            self.config.instance_id
        );
    }
}

fn check_completion(completion: &Completion) -> Result<()> {
    match *completion {
        Completion::Polling { max_polls: 0, .. } | Completion::Blocking { timeout_ms: 0 } => {
            Err(Error::InvalidParameter)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::port::NoEvent;
    use crate::regfile::{DEBUG, MEM_RING_SIZE, PASSTHROUGH_BASE, S2M_INT_MASK, S2M_INT_STATE, TX_TAIL};
    use crate::sim::{REG_BASE, SHM_BASE, SimIo};
    use std::sync::atomic::AtomicU32;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;
    use std::vec::Vec;

    /// Delay that only counts
    #[derive(Default)]
    pub(crate) struct CountingDelay {
        pub(crate) calls: AtomicU32,
        pub(crate) total_us: AtomicU32,
    }

    impl Delay for CountingDelay {
        fn delay_us(&self, us: u32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.total_us.fetch_add(us, Ordering::SeqCst);
        }
    }

    /// Delay that plays the service core: runs `script` with the delay
    /// count on every delay.
    pub(crate) struct ScriptedDelay<F: Fn(u32)> {
        pub(crate) calls: AtomicU32,
        script: F,
    }

    impl<F: Fn(u32)> ScriptedDelay<F> {
        pub(crate) fn new(script: F) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script,
            }
        }
    }

    impl<F: Fn(u32)> Delay for ScriptedDelay<F> {
        fn delay_us(&self, _us: u32) {
            let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.script)(count);
        }
    }

    /// Delay for tests running real threads
    pub(crate) struct YieldDelay;

    impl Delay for YieldDelay {
        fn delay_us(&self, _us: u32) {
            std::thread::yield_now();
        }
    }

    /// Completion event that is never signalled in time, recording each wait
    #[derive(Default)]
    pub(crate) struct RecordingEvent {
        pub(crate) waits: Mutex<Vec<u32>>,
        pub(crate) signals: AtomicU32,
    }

    impl CompletionEvent for RecordingEvent {
        fn wait(&self, timeout_ms: u32) -> bool {
            self.waits.lock().unwrap().push(timeout_ms);
            false
        }

        fn signal(&self) {
            self.signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Completion event backed by a condition variable
    #[derive(Default)]
    pub(crate) struct StdEvent {
        signalled: Mutex<bool>,
        cv: Condvar,
    }

    impl CompletionEvent for StdEvent {
        fn wait(&self, timeout_ms: u32) -> bool {
            let guard = self.signalled.lock().unwrap();
            let (mut signalled, _) = self
                .cv
                .wait_timeout_while(guard, Duration::from_millis(timeout_ms as u64), |s| !*s)
                .unwrap();
            core::mem::replace(&mut *signalled, false)
        }

        fn signal(&self) {
            *self.signalled.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    pub(crate) fn config(out: u32, inb: u32) -> DeviceConfig {
        DeviceConfig {
            outbound: RingSize::Fixed(out),
            inbound_capacity: inb,
            completion: Completion::Polling {
                interval_us: 40,
                max_polls: 5,
            },
            lock: LockPolicy {
                attempts: 3,
                retry_us: 10,
            },
            ..DeviceConfig::new(REG_BASE, SHM_BASE)
        }
    }

    pub(crate) type TestDevice<'a> = Device<&'a SimIo, NoEvent, CountingDelay>;

    pub(crate) fn device(sim: &SimIo, out: u32, inb: u32) -> TestDevice<'_> {
        Device::initialize(config(out, inb), sim, NoEvent, CountingDelay::default()).unwrap()
    }

    #[test]
    fn test_initialize() {
        let sim = SimIo::new(64, 4, 4);
        sim.set_reg(TX_TAIL, 3);
        sim.set_reg(S2M_INT_MASK, 0xFFFF_FFFF);
        sim.set_reg(S2M_INT_STATE, Doorbell::RX_TAIL.bits());
        let device = device(&sim, 4, 4);
        assert!(device.is_ready());
        assert_eq!(sim.reg(TX_TAIL), 0);
        assert_eq!(sim.reg(S2M_INT_STATE), 0);
        assert_eq!(sim.reg(S2M_INT_MASK) & Doorbell::all().bits(), 0);
        assert_eq!(device.outbound_capacity(), 4);
        assert_eq!(device.stats(), DeviceStats::default());
    }

    #[test]
    fn test_initialize_rejects_bad_config() {
        let sim = SimIo::new(64, 4, 4);
        let cases = [
            (DeviceConfig { frame_size: 60, ..config(4, 4) }, Error::InvalidParameter),
            (DeviceConfig { frame_size: 256, ..config(4, 4) }, Error::InvalidParameter),
            (DeviceConfig { outbound: RingSize::Fixed(1), ..config(4, 4) }, Error::InvalidParameter),
            (DeviceConfig { outbound: RingSize::Fixed(33), ..config(4, 4) }, Error::InvalidParameter),
            (DeviceConfig { inbound_capacity: 0, ..config(4, 4) }, Error::InvalidParameter),
            (DeviceConfig { regfile_base: REG_BASE + 2, ..config(4, 4) }, Error::NotAligned),
            (DeviceConfig { shmem_base: SHM_BASE + 1, ..config(4, 4) }, Error::NotAligned),
            (DeviceConfig { inbound_offset: Some(64), ..config(4, 4) }, Error::InvalidParameter),
            (
                DeviceConfig {
                    completion: Completion::Blocking { timeout_ms: 0 },
                    ..config(4, 4)
                },
                Error::InvalidParameter,
            ),
        ];
        for (config, expected) in cases {
            let result = Device::initialize(config, &sim, NoEvent, CountingDelay::default());
            assert_eq!(result.err(), Some(expected));
        }
    }

    #[test]
    fn test_ring_size_from_register() {
        let sim = SimIo::new(64, 8, 4);
        sim.set_reg(MEM_RING_SIZE, 8 << 8);
        let config = DeviceConfig {
            outbound: RingSize::FromRegister,
            ..config(4, 4)
        };
        let device = Device::initialize(config, &sim, NoEvent, CountingDelay::default()).unwrap();
        assert_eq!(device.outbound_capacity(), 8);

        sim.set_reg(MEM_RING_SIZE, 0);
        let config = DeviceConfig {
            outbound: RingSize::FromRegister,
            ..device.config().clone()
        };
        let result = Device::initialize(config, &sim, NoEvent, CountingDelay::default());
        assert_eq!(result.err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn test_deinitialize_twice() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        device.deinitialize().unwrap();
        assert!(!device.is_ready());
        assert_eq!(sim.reg(S2M_INT_MASK) & Doorbell::all().bits(), Doorbell::all().bits());
        device.deinitialize().unwrap();
        assert!(!device.is_ready());
        assert_eq!(device.call(crate::envelope::CommandType::Get, 1, &[]).err(), Some(Error::Uninit));
    }

    #[test]
    fn test_deinitialize_busy() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        let guard = device.call_lock.lock();
        assert_eq!(device.deinitialize(), Err(Error::Busy));
        assert!(!device.is_ready());
        drop(guard);
        device.deinitialize().unwrap();
    }

    #[test]
    fn test_reinitialize() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        device.fail_protocol("test");
        assert!(!device.is_ready());
        assert_eq!(device.stats().protocol_errors, 1);
        device.reinitialize().unwrap();
        assert!(device.is_ready());
    }

    #[test]
    fn test_event_id() {
        assert_eq!(EventId::new(0).unwrap().subid(), 0);
        assert_eq!(EventId::try_from(31).unwrap().subid(), 31);
        assert_eq!(EventId::new(32), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_register_event_handler() {
        static FIRST: fn(&Envelope) = |_| {};
        static SECOND: fn(&Envelope) = |_| {};
        let sim = SimIo::new(64, 4, 4);
        let mut device = device(&sim, 4, 4);
        let id = EventId::new(3).unwrap();
        assert!(device.register_event_handler(id, &FIRST).is_none());
        assert!(device.register_event_handler(id, &SECOND).is_some());
        assert!(device.unregister_event_handler(id).is_some());
        assert!(device.unregister_event_handler(id).is_none());
    }

    #[test]
    fn test_debug_and_passthrough() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        device.set_debug(true).unwrap();
        device.set_alive(true).unwrap();
        assert_eq!(sim.reg(DEBUG), 0b11);
        device.set_debug(false).unwrap();
        assert_eq!(sim.reg(DEBUG), 0b10);

        sim.set_reg(PASSTHROUGH_BASE + 4, 0x55);
        assert_eq!(device.read_passthrough(1), Ok(0x55));
        device.write_passthrough(5, 0xAA).unwrap();
        assert_eq!(sim.reg(PASSTHROUGH_BASE + 20), 0xAA);
        assert_eq!(device.read_passthrough(6), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_sequence_skips_held() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        device.mailboxes[0].arm(1);
        assert_eq!(device.next_sequence(), 0);
        assert_eq!(device.next_sequence(), 2);

        device.next_sequence.store(u8::MAX, Ordering::Relaxed);
        assert_eq!(device.next_sequence(), u8::MAX);
        assert_eq!(device.next_sequence(), 0);
    }

    #[derive(Default)]
    struct RecordingController {
        calls: Vec<(&'static str, u32)>,
        fail: bool,
    }

    impl InterruptController for RecordingController {
        type Error = &'static str;

        fn install(&mut self, vector: u32, priority: u32) -> core::result::Result<(), Self::Error> {
            if self.fail {
                return Err("install failed");
            }
            self.calls.push(("install", vector));
            self.calls.push(("priority", priority));
            Ok(())
        }

        fn unmask(&mut self, vector: u32) -> core::result::Result<(), Self::Error> {
            self.calls.push(("unmask", vector));
            Ok(())
        }

        fn mask(&mut self, vector: u32) -> core::result::Result<(), Self::Error> {
            self.calls.push(("mask", vector));
            Ok(())
        }
    }

    #[test]
    fn test_attach_irq() {
        let sim = SimIo::new(64, 4, 4);
        let config = DeviceConfig {
            irq: Some(IrqConfig {
                vector: 77,
                priority: 3,
            }),
            ..config(4, 4)
        };
        let device = Device::initialize(config, &sim, NoEvent, CountingDelay::default()).unwrap();
        let mut controller = RecordingController::default();
        device.attach_irq(&mut controller).unwrap();
        device.detach_irq(&mut controller).unwrap();
        assert_eq!(
            controller.calls,
            [("install", 77), ("priority", 3), ("unmask", 77), ("mask", 77)]
        );

        let mut failing = RecordingController {
            fail: true,
            ..Default::default()
        };
        assert_eq!(device.attach_irq(&mut failing), Err(Error::Io));
    }

    #[test]
    fn test_attach_irq_unconfigured() {
        let sim = SimIo::new(64, 4, 4);
        let device = device(&sim, 4, 4);
        let mut controller = RecordingController::default();
        assert_eq!(device.attach_irq(&mut controller), Err(Error::InvalidParameter));
        assert!(controller.calls.is_empty());
    }

    #[test]
    fn test_device_is_shareable() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<Device<SimIo, NoEvent, CountingDelay>>();
    }
}
