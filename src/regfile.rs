//! Register file and shared memory access.
//!
//! Each device instance has a small block of memory-mapped control registers
//! (the register file) holding the ring indices and two doorbell register
//! pairs, one per direction:
//!
//! | Offset    | Register              | Owner                  |
//! |-----------|-----------------------|------------------------|
//! | 0x00      | TX_HEAD               | service core           |
//! | 0x04      | TX_TAIL               | client                 |
//! | 0x08      | RX_HEAD               | client                 |
//! | 0x0C      | RX_TAIL               | service core           |
//! | 0x20/0x24 | M2S_INT_MASK / STATE  | client to service core |
//! | 0x28/0x2C | S2M_INT_MASK / STATE  | service core to client |
//! | 0x30-0x44 | hardware passthrough  | peripheral specific    |
//! | 0x48      | MEM_RING_SIZE         | capability             |
//! | 0x58      | DEBUG                 | client                 |
//!
//! [`RegFile`] wraps an implementation of [`SharedIo`] and is the only place
//! register offsets are used.  [`MmioIo`] is the only place raw addresses are
//! dereferenced.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;

use crate::{Error, Result};

pub const TX_HEAD: usize = 0x00;
pub const TX_TAIL: usize = 0x04;
pub const RX_HEAD: usize = 0x08;
pub const RX_TAIL: usize = 0x0C;
pub const M2S_INT_MASK: usize = 0x20;
pub const M2S_INT_STATE: usize = 0x24;
pub const S2M_INT_MASK: usize = 0x28;
pub const S2M_INT_STATE: usize = 0x2C;
pub const PASSTHROUGH_BASE: usize = 0x30;
pub const MEM_RING_SIZE: usize = 0x48;
pub const DEBUG: usize = 0x58;

/// Number of hardware passthrough registers
pub const PASSTHROUGH_COUNT: usize = 6;

/// Size of the register file in bytes
pub const REGFILE_SIZE: usize = 0x80;

// Ring index registers only carry a 16 bit index
const INDEX_MASK: u32 = 0xFFFF;

// MEM_RING_SIZE bits 13:8 hold the outbound slot count
const RING_SIZE_TX_SHIFT: u32 = 8;
const RING_SIZE_TX_MASK: u32 = 0x3F << RING_SIZE_TX_SHIFT;

// Writing all ones to a mask register masks every source
const MASK_ALL: u32 = 0xFFFF_FFFF;

const DEBUG_ENABLE: u32 = 1 << 0;
const DEBUG_ALIVE: u32 = 1 << 1;

bitflags! {
    /// Doorbell interrupt sources, as found in the mask and state registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Doorbell: u32 {
        /// Far side moved the outbound head
        const TX_HEAD = 1 << 0;
        /// Far side moved the inbound tail
        const RX_TAIL = 1 << 1;
        /// Message notification
        const MESSAGE = 1 << 4;
    }
}

/// Ring or doorbell direction, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to service core
    Outbound,
    /// Service core to client
    Inbound,
}

impl Direction {
    const fn head_offset(self) -> usize {
        match self {
            Direction::Outbound => TX_HEAD,
            Direction::Inbound => RX_HEAD,
        }
    }

    const fn tail_offset(self) -> usize {
        match self {
            Direction::Outbound => TX_TAIL,
            Direction::Inbound => RX_TAIL,
        }
    }

    const fn mask_offset(self) -> usize {
        match self {
            Direction::Outbound => M2S_INT_MASK,
            Direction::Inbound => S2M_INT_MASK,
        }
    }

    const fn state_offset(self) -> usize {
        match self {
            Direction::Outbound => M2S_INT_STATE,
            Direction::Inbound => S2M_INT_STATE,
        }
    }
}

/// Trait for accessing the register file and shared message memory.
///
/// Every access is a single, uncached 32-bit operation at an absolute
/// address.  Methods take `&self` as the same instance is used from task and
/// interrupt context.
pub trait SharedIo {
    /// Atomic read u32 operation
    fn read_u32(&self, addr: usize) -> Result<u32>;

    /// Atomic write u32 operation
    fn write_u32(&self, addr: usize, value: u32) -> Result<()>;

    /// Bulk read access, no need for atomicity
    fn read_bulk(&self, addr: usize, buf: &mut [u32]) -> Result<()> {
        for (i, word) in buf.iter_mut().enumerate() {
            *word = self.read_u32(addr + i * 4)?;
        }
        Ok(())
    }

    /// Bulk write access, no need for atomicity
    fn write_bulk(&self, addr: usize, data: &[u32]) -> Result<()> {
        for (i, word) in data.iter().enumerate() {
            self.write_u32(addr + i * 4, *word)?;
        }
        Ok(())
    }
}

impl<T: SharedIo + ?Sized> SharedIo for &T {
    fn read_u32(&self, addr: usize) -> Result<u32> {
        (**self).read_u32(addr)
    }

    fn write_u32(&self, addr: usize, value: u32) -> Result<()> {
        (**self).write_u32(addr, value)
    }

    fn read_bulk(&self, addr: usize, buf: &mut [u32]) -> Result<()> {
        (**self).read_bulk(addr, buf)
    }

    fn write_bulk(&self, addr: usize, data: &[u32]) -> Result<()> {
        (**self).write_bulk(addr, data)
    }
}

/// Shared I/O implementation using volatile access to device memory.
#[derive(Debug, Clone, Copy)]
pub struct MmioIo;

impl MmioIo {
    /// Create a new MmioIo instance.
    ///
    /// ```rust,ignore
    /// static MMIO: MmioIo = unsafe { MmioIo::new() };
    /// ```
    ///
    /// # Safety
    ///
    /// Every address later passed to this instance, which is every register
    /// file and shared memory address in the [`crate::device::DeviceConfig`]
    /// it is used with, must be mapped, 4-byte aligned, device (uncached)
    /// memory for the lifetime of the program.
    pub const unsafe fn new() -> Self {
        Self
    }
}

impl SharedIo for MmioIo {
    fn read_u32(&self, addr: usize) -> Result<u32> {
        // SAFETY: validity of addr is guaranteed by the contract of new()
        Ok(unsafe { core::ptr::read_volatile(addr as *const u32) })
    }

    fn write_u32(&self, addr: usize, value: u32) -> Result<()> {
        // SAFETY: validity of addr is guaranteed by the contract of new()
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) };
        Ok(())
    }
}

/// Typed accessors over one device's register file.
///
/// Holds no state of its own.  Callers are responsible for ordering: slot
/// contents must be visible before the tail update or doorbell that
/// announces them.
pub struct RegFile<'a, I: SharedIo> {
    io: &'a I,
    base: usize,
}

impl<'a, I: SharedIo> RegFile<'a, I> {
    pub fn new(io: &'a I, base: usize) -> Self {
        Self { io, base }
    }

    pub fn read_head(&self, direction: Direction) -> Result<u32> {
        Ok(self.read(direction.head_offset())? & INDEX_MASK)
    }

    pub fn write_head(&self, direction: Direction, value: u32) -> Result<()> {
        self.write(direction.head_offset(), value & INDEX_MASK)
    }

    pub fn read_tail(&self, direction: Direction) -> Result<u32> {
        Ok(self.read(direction.tail_offset())? & INDEX_MASK)
    }

    pub fn write_tail(&self, direction: Direction, value: u32) -> Result<()> {
        self.write(direction.tail_offset(), value & INDEX_MASK)
    }

    /// Raise the message doorbell towards the far side of `direction`.
    pub fn ring_doorbell(&self, direction: Direction) -> Result<()> {
        self.write(direction.state_offset(), Doorbell::MESSAGE.bits())
    }

    /// Read the pending doorbell sources.
    pub fn doorbell_state(&self, direction: Direction) -> Result<Doorbell> {
        Ok(Doorbell::from_bits_truncate(self.read(direction.state_offset())?))
    }

    /// Acknowledge `bits`, leaving any other pending sources set.
    pub fn ack_doorbell(&self, direction: Direction, bits: Doorbell) -> Result<()> {
        let state = self.read(direction.state_offset())?;
        self.write(direction.state_offset(), state & !bits.bits())
    }

    pub fn mask_doorbell(&self, direction: Direction) -> Result<()> {
        self.write(direction.mask_offset(), MASK_ALL)
    }

    pub fn unmask_doorbell(&self, direction: Direction) -> Result<()> {
        self.write(direction.mask_offset(), !Doorbell::all().bits())
    }

    /// Outbound slot count advertised by the service core, 0 if none.
    pub fn read_ring_size(&self) -> Result<u32> {
        Ok((self.read(MEM_RING_SIZE)? & RING_SIZE_TX_MASK) >> RING_SIZE_TX_SHIFT)
    }

    pub fn read_passthrough(&self, index: usize) -> Result<u32> {
        self.read(passthrough_offset(index)?)
    }

    pub fn write_passthrough(&self, index: usize, value: u32) -> Result<()> {
        self.write(passthrough_offset(index)?, value)
    }

    /// Enable or disable service core logging.
    pub fn set_debug(&self, enable: bool) -> Result<()> {
        self.update_debug(DEBUG_ENABLE, enable)
    }

    /// Enable or disable service core liveness reporting.
    pub fn set_alive(&self, enable: bool) -> Result<()> {
        self.update_debug(DEBUG_ALIVE, enable)
    }
}

// Internal functions
impl<I: SharedIo> RegFile<'_, I> {
    fn read(&self, offset: usize) -> Result<u32> {
        self.io.read_u32(self.base + offset)
    }

    fn write(&self, offset: usize, value: u32) -> Result<()> {
        self.io.write_u32(self.base + offset, value)
    }

    fn update_debug(&self, bit: u32, enable: bool) -> Result<()> {
        let value = self.read(DEBUG)?;
        let value = if enable { value | bit } else { value & !bit };
        self.write(DEBUG, value)
    }
}

fn passthrough_offset(index: usize) -> Result<usize> {
    if index < PASSTHROUGH_COUNT {
        Ok(PASSTHROUGH_BASE + index * 4)
    } else {
        Err(Error::InvalidParameter)
    }
}

/// Check an address is word aligned.
pub(crate) fn check_base_addr(addr: usize) -> Result<()> {
    if addr % 4 != 0 {
        Err(Error::NotAligned)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{REG_BASE, SimIo};

    #[test]
    fn test_index_registers() {
        let sim = SimIo::new(64, 4, 4);
        let regs = RegFile::new(&sim, REG_BASE);

        regs.write_tail(Direction::Outbound, 3).unwrap();
        regs.write_head(Direction::Inbound, 2).unwrap();
        assert_eq!(sim.reg(TX_TAIL), 3);
        assert_eq!(sim.reg(RX_HEAD), 2);

        sim.set_reg(TX_HEAD, 0xABCD_0001);
        assert_eq!(regs.read_head(Direction::Outbound).unwrap(), 1);
    }

    #[test]
    fn test_doorbells() {
        let sim = SimIo::new(64, 4, 4);
        let regs = RegFile::new(&sim, REG_BASE);

        regs.ring_doorbell(Direction::Outbound).unwrap();
        assert_eq!(sim.reg(M2S_INT_STATE), Doorbell::MESSAGE.bits());

        sim.set_reg(S2M_INT_STATE, (Doorbell::RX_TAIL | Doorbell::TX_HEAD).bits());
        let state = regs.doorbell_state(Direction::Inbound).unwrap();
        assert_eq!(state, Doorbell::RX_TAIL | Doorbell::TX_HEAD);

        regs.ack_doorbell(Direction::Inbound, Doorbell::RX_TAIL).unwrap();
        assert_eq!(sim.reg(S2M_INT_STATE), Doorbell::TX_HEAD.bits());

        regs.mask_doorbell(Direction::Inbound).unwrap();
        assert_eq!(sim.reg(S2M_INT_MASK), 0xFFFF_FFFF);
        regs.unmask_doorbell(Direction::Inbound).unwrap();
        assert_eq!(sim.reg(S2M_INT_MASK) & Doorbell::all().bits(), 0);
    }

    #[test]
    fn test_ring_size_and_passthrough() {
        let sim = SimIo::new(64, 4, 4);
        let regs = RegFile::new(&sim, REG_BASE);

        sim.set_reg(MEM_RING_SIZE, (8 << 8) | 0x0F);
        assert_eq!(regs.read_ring_size().unwrap(), 8);

        sim.set_reg(PASSTHROUGH_BASE + 8, 1);
        assert_eq!(regs.read_passthrough(2).unwrap(), 1);
        regs.write_passthrough(5, 0x55).unwrap();
        assert_eq!(sim.reg(0x44), 0x55);
        assert_eq!(regs.read_passthrough(6), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_debug_bits() {
        let sim = SimIo::new(64, 4, 4);
        let regs = RegFile::new(&sim, REG_BASE);

        regs.set_debug(true).unwrap();
        regs.set_alive(true).unwrap();
        assert_eq!(sim.reg(DEBUG), 0b11);
        regs.set_debug(false).unwrap();
        assert_eq!(sim.reg(DEBUG), 0b10);
    }
}
