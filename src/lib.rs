//! Cross-core messaging transport for virtual devices.
//!
//! A client core (running the RTOS and peripheral drivers) and a service core
//! (emulating the peripherals) exchange fixed-size messages over shared
//! memory.  Each virtual device instance has:
//! - a register file holding the ring indices, doorbell interrupt registers
//!   and a few custom registers
//! - an outbound ring of request slots, written by the client
//! - an inbound ring of reply and event slots, written by the service core
//!
//! Peripheral drivers use a [`device::Device`] to make request/reply calls
//! and to receive unsolicited `Report` events.  What the commands and
//! payloads mean is up to the peripheral driver; the transport only moves
//! envelopes.
//!
//! `no_std`.  Requires `alloc` for the async traits.
//!
//! ## Architecture
//!
//! Each slot holds one [`envelope::Envelope`]: an 8 byte header (sequence,
//! command type and subid, payload length, status) followed by the payload,
//! serialized little-endian into a frame of the configured size.
//!
//! Rings are single-producer single-consumer.  The producer of a ring owns
//! its tail index and the consumer its head index.  The ring is full when
//! `(tail + 1) % capacity == head`, so one slot is always unused.
//!
//! ```text
//!   client                       register file                service core
//!   ------                       -------------                ------------
//!   write slot, tail += 1  --->  TX_TAIL, M2S doorbell  --->  consume, head += 1
//!   poll slot status       <---  status in slot         <---  complete in place
//!   interrupt, head += 1   <---  RX_TAIL, S2M doorbell  <---  write slot, tail += 1
//! ```
//!
//! A call completes either by polling the `status_major` of its own
//! outbound slot, or by sleeping until the inbound interrupt delivers a
//! reply with the call's sequence number.  Replies may arrive in any order.
//!
//! ## Modules
//!
//! - [`envelope`] - Message envelope and its wire format
//! - [`regfile`] - Register file layout, and the [`regfile::SharedIo`] trait
//!   through which all shared register and memory accesses go
//! - [`ring`] - Ring slot allocation and ownership tracking
//! - [`port`] - Traits for the delay, completion event and interrupt
//!   controller services the application provides
//! - [`device`] - Device instances, their call and event dispatchers
//!
//! ## Getting Started
//!
//! 1. Implement [`port::Delay`], and for blocking calls
//!    [`port::CompletionEvent`], for your RTOS.
//! 2. Build a [`device::DeviceConfig`] with the register file and shared
//!    memory addresses of the instance.
//! 3. [`device::Device::initialize()`] with [`regfile::MmioIo`].
//! 4. Register any event handlers, then move the instance somewhere it can
//!    be shared with the interrupt handler.
//! 5. [`device::Device::attach_irq()`], and call
//!    [`device::Device::handle_interrupt()`] from the installed handler.
//! 6. Make calls with [`device::Device::call()`] or the convenience wrappers.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable [`device::Device::call_async()`] and the async port
//!   traits (requires `alloc`).
//!
//! Compile with `--no-default-features` for a purely synchronous client.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "async")]
extern crate alloc;

pub mod device;
pub mod envelope;
pub mod port;
pub mod regfile;
pub mod ring;

#[cfg(test)]
mod sim;

pub use device::{Device, DeviceConfig, Reply, Request};
pub use envelope::{CommandType, Envelope, StatusMajor};

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// No free outbound slot
    RingFull,
    /// Another call holds the device instance
    Busy,
    /// No reply in time
    Timeout,
    /// The far side broke the ring protocol.  The instance is not ready
    /// until reinitialized.
    Protocol,
    /// The service core completed the call with an error status
    Status { status: StatusMajor, minor: u8 },
    /// Invalid argument, configuration or payload size
    InvalidParameter,
    /// Device instance not ready
    Uninit,
    /// Address not word aligned
    NotAligned,
    /// Register or shared memory access failed
    Io,
}

impl Error {
    /// Whether the same call may succeed if retried later
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Error::RingFull | Error::Busy | Error::Timeout)
    }

    /// Whether the device instance needs reinitializing
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol)
    }
}

/// Type to represent the result of a transport operation
pub type Result<T> = core::result::Result<T, Error>;
