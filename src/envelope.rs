//! Message envelope exchanged in every ring slot.
//!
//! Wire layout (byte offsets, little-endian):
//!
//! | Offset | Width | Field           |
//! |--------|-------|-----------------|
//! | 0      | 1     | reserved, zero  |
//! | 1      | 1     | `sequence`      |
//! | 2      | 1     | `command_type`  |
//! | 3      | 1     | `command_subid` |
//! | 4      | 2     | `length`        |
//! | 6      | 1     | `status_minor`  |
//! | 7      | 1     | `status_major`  |
//! | 8..    | N     | payload         |
//!
//! The frame size is fixed per device instance by configuration.  All frames
//! carry the same 8 byte header, so the payload capacity is the frame size
//! less [`HEADER_SIZE`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::{Error, Result};

/// Size of the envelope header in bytes
pub const HEADER_SIZE: usize = 8;

/// Smallest frame size accepted
pub const MIN_FRAME_SIZE: usize = 16;

/// Largest frame size accepted
pub const MAX_FRAME_SIZE: usize = 128;

/// Largest payload any frame can carry
pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Byte offset of `status_minor` within a frame
pub const STATUS_MINOR_OFFSET: usize = 6;

/// Byte offset of `status_major` within a frame
pub const STATUS_MAJOR_OFFSET: usize = 7;

/// Command type taxonomy, shared by every peripheral.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Reset the peripheral to its defaults
    Default = 0,
    Set = 1,
    Get = 2,
    Data = 3,
    /// Service core initiated, asynchronous notification
    Report = 4,
    /// Capability/version query
    Protocol = 5,
}

impl TryFrom<u8> for CommandType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CommandType::Default),
            1 => Ok(CommandType::Set),
            2 => Ok(CommandType::Get),
            3 => Ok(CommandType::Data),
            4 => Ok(CommandType::Report),
            5 => Ok(CommandType::Protocol),
            _ => Err(Error::Protocol),
        }
    }
}

/// Transport level completion state, written by the service core.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StatusMajor {
    #[default]
    NotReady = 0x00,
    Success = 0x01,
    InProgress = 0x02,
    GenericError = 0x10,
    TypeNotSupported = 0x11,
    CommandNotSupported = 0x12,
    InvalidParameter = 0x13,
}

impl StatusMajor {
    /// Whether the service core has finished with the command
    pub const fn is_terminal(self) -> bool {
        !matches!(self, StatusMajor::NotReady | StatusMajor::InProgress)
    }

    pub const fn is_error(self) -> bool {
        (self as u8) >= 0x10
    }
}

impl TryFrom<u8> for StatusMajor {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(StatusMajor::NotReady),
            0x01 => Ok(StatusMajor::Success),
            0x02 => Ok(StatusMajor::InProgress),
            0x10 => Ok(StatusMajor::GenericError),
            0x11 => Ok(StatusMajor::TypeNotSupported),
            0x12 => Ok(StatusMajor::CommandNotSupported),
            0x13 => Ok(StatusMajor::InvalidParameter),
            _ => Err(Error::Protocol),
        }
    }
}

/// One message, as held in a ring slot.
///
/// The payload is stored inline at its maximum size; only the first
/// [`Self::len()`] bytes are meaningful and bytes past it are always zero.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    /// Assigned by the client, echoed unmodified by the service core
    pub sequence: u8,

    pub command_type: CommandType,

    /// Command type scoped opcode, opaque to the transport
    pub command_subid: u8,

    /// Secondary status, meaning owned by the peripheral client
    pub status_minor: u8,

    pub status_major: StatusMajor,

    length: u16,
    payload: [u8; MAX_PAYLOAD],
}

impl Envelope {
    /// Create a control envelope with an empty payload.
    pub const fn new(command_type: CommandType, command_subid: u8) -> Self {
        Self {
            sequence: 0,
            command_type,
            command_subid,
            status_minor: 0,
            status_major: StatusMajor::NotReady,
            length: 0,
            payload: [0; MAX_PAYLOAD],
        }
    }

    /// Create an envelope carrying `payload`.
    ///
    /// Returns [`Error::InvalidParameter`] if the payload exceeds
    /// [`MAX_PAYLOAD`].  Whether it also fits a particular frame is checked
    /// by [`Self::encode()`].
    pub fn with_payload(command_type: CommandType, command_subid: u8, payload: &[u8]) -> Result<Self> {
        let mut envelope = Self::new(command_type, command_subid);
        envelope.set_payload(payload)?;
        Ok(envelope)
    }

    /// Replace the payload, zeroing anything beyond it.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidParameter);
        }
        self.payload = [0; MAX_PAYLOAD];
        self.payload[..payload.len()].copy_from_slice(payload);
        self.length = payload.len() as u16;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length as usize]
    }

    /// Payload length in bytes, as carried in the `length` field
    pub const fn len(&self) -> usize {
        self.length as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Serialize into `frame`, whose length is the configured frame size.
    ///
    /// Nothing is written unless the whole envelope fits.  Frame bytes past
    /// the payload are zeroed.
    pub fn encode(&self, frame: &mut [u8]) -> Result<()> {
        check_frame_size(frame.len())?;
        if self.len() > frame.len() - HEADER_SIZE {
            return Err(Error::InvalidParameter);
        }

        let length = self.length.to_le_bytes();
        frame[0] = 0;
        frame[1] = self.sequence;
        frame[2] = self.command_type as u8;
        frame[3] = self.command_subid;
        frame[4] = length[0];
        frame[5] = length[1];
        frame[STATUS_MINOR_OFFSET] = self.status_minor;
        frame[STATUS_MAJOR_OFFSET] = self.status_major as u8;

        let (body, rest) = frame[HEADER_SIZE..].split_at_mut(self.len());
        body.copy_from_slice(self.payload());
        rest.fill(0);

        Ok(())
    }

    /// Deserialize from `frame`.
    ///
    /// Unknown command types or status values, a non-zero reserved byte, and
    /// a `length` larger than the frame can hold, are reported as
    /// [`Error::Protocol`] since they can only come from a misbehaving far
    /// side.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        check_frame_size(frame.len())?;
        if frame[0] != 0 {
            return Err(Error::Protocol);
        }

        let length = u16::from_le_bytes([frame[4], frame[5]]);
        if length as usize > frame.len() - HEADER_SIZE {
            return Err(Error::Protocol);
        }

        let mut envelope = Self::new(CommandType::try_from(frame[2])?, frame[3]);
        envelope.sequence = frame[1];
        envelope.status_minor = frame[STATUS_MINOR_OFFSET];
        envelope.status_major = StatusMajor::try_from(frame[STATUS_MAJOR_OFFSET])?;
        envelope.length = length;
        envelope.payload[..length as usize]
            .copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + length as usize]);

        Ok(envelope)
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.command_type == other.command_type
            && self.command_subid == other.command_subid
            && self.status_minor == other.status_minor
            && self.status_major == other.status_major
            && self.payload() == other.payload()
    }
}

impl Eq for Envelope {}

/// Check a frame size is one this crate can handle.
pub fn check_frame_size(size: usize) -> Result<()> {
    if (MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) && size % 8 == 0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter)
    }
}

/// Payload capacity of a frame of `frame_size` bytes
pub const fn payload_capacity(frame_size: usize) -> usize {
    frame_size.saturating_sub(HEADER_SIZE)
}
