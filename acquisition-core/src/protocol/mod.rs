//! Command protocol framing.
//!
//! Requests and responses share one layout: magic byte, code byte, payload
//! length as a little-endian `u16`, then the payload. Fragmented requests are
//! coalesced by [`Reassembler`] before [`dispatch`] runs them.

use core::fmt;

use winnow::Parser;
use winnow::binary::{le_u16, le_u32, u8 as byte};
use winnow::error::ContextError;

use crate::fsm::State;

mod dispatch;
pub mod reassembly;

pub use dispatch::{DispatchContext, Response, dispatch};
pub use reassembly::{ProtocolConfig, Reassembler, ReassemblyError, ReassemblyState};

pub const MAGIC: u8 = 130;
pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;
pub const BUILD_ID_LEN: usize = 32;
pub const STATUS_LEN: usize = 8 + BUILD_ID_LEN;
pub const FRAME_REQUEST_LEN: usize = 12;

/// Request codes understood by the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandCode {
    GetStatus,
    ClearFault,
    QueueFrame,
    GetFrame,
}

impl CommandCode {
    const GET_STATUS: u8 = 0x01;
    const CLEAR_FAULT: u8 = 0x02;
    const QUEUE_FRAME: u8 = 0x11;
    const GET_FRAME: u8 = 0x12;

    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            CommandCode::GetStatus => Self::GET_STATUS,
            CommandCode::ClearFault => Self::CLEAR_FAULT,
            CommandCode::QueueFrame => Self::QUEUE_FRAME,
            CommandCode::GetFrame => Self::GET_FRAME,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            Self::GET_STATUS => Some(CommandCode::GetStatus),
            Self::CLEAR_FAULT => Some(CommandCode::ClearFault),
            Self::QUEUE_FRAME => Some(CommandCode::QueueFrame),
            Self::GET_FRAME => Some(CommandCode::GetFrame),
            _ => None,
        }
    }
}

/// Response codes emitted by the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseCode {
    Ack,
    Status,
    Frame,
    Nack,
}

impl ResponseCode {
    const ACK: u8 = 0x80;
    const STATUS: u8 = 0x81;
    const FRAME: u8 = 0x92;
    const NACK: u8 = 0xFF;

    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            ResponseCode::Ack => Self::ACK,
            ResponseCode::Status => Self::STATUS,
            ResponseCode::Frame => Self::FRAME,
            ResponseCode::Nack => Self::NACK,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            Self::ACK => Some(ResponseCode::Ack),
            Self::STATUS => Some(ResponseCode::Status),
            Self::FRAME => Some(ResponseCode::Frame),
            Self::NACK => Some(ResponseCode::Nack),
            _ => None,
        }
    }
}

/// Error byte carried by a negative acknowledgement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    UnrecognizedCommand,
    /// Framing, magic or length mismatch.
    BadPacket,
    /// Payload length inconsistent with its structure.
    IncorrectSize,
    /// Operation not valid in the current state.
    IllegalState,
    /// Well-formed but semantically illegal, e.g. a frame with no shots.
    InvalidParameter,
}

impl ErrorCode {
    const UNRECOGNIZED_COMMAND: u8 = 1;
    const BAD_PACKET: u8 = 2;
    const INCORRECT_SIZE: u8 = 3;
    const ILLEGAL_STATE: u8 = 4;
    const INVALID_PARAMETER: u8 = 5;

    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            ErrorCode::UnrecognizedCommand => Self::UNRECOGNIZED_COMMAND,
            ErrorCode::BadPacket => Self::BAD_PACKET,
            ErrorCode::IncorrectSize => Self::INCORRECT_SIZE,
            ErrorCode::IllegalState => Self::ILLEGAL_STATE,
            ErrorCode::InvalidParameter => Self::INVALID_PARAMETER,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            Self::UNRECOGNIZED_COMMAND => Some(ErrorCode::UnrecognizedCommand),
            Self::BAD_PACKET => Some(ErrorCode::BadPacket),
            Self::INCORRECT_SIZE => Some(ErrorCode::IncorrectSize),
            Self::ILLEGAL_STATE => Some(ErrorCode::IllegalState),
            Self::INVALID_PARAMETER => Some(ErrorCode::InvalidParameter),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::UnrecognizedCommand => "unrecognized command",
            ErrorCode::BadPacket => "bad packet",
            ErrorCode::IncorrectSize => "incorrect size",
            ErrorCode::IllegalState => "illegal state",
            ErrorCode::InvalidParameter => "invalid parameter",
        })
    }
}

/// Four-byte packet header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub magic: u8,
    pub code: u8,
    pub length: u16,
}

impl PacketHeader {
    /// Header for a `payload_len`-byte payload, if the length fits the wire.
    #[must_use]
    pub fn for_payload(code: u8, payload_len: usize) -> Option<Self> {
        Some(Self {
            magic: MAGIC,
            code,
            length: u16::try_from(payload_len).ok()?,
        })
    }

    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        (byte::<_, ContextError>, byte, le_u16)
            .map(|(magic, code, length)| Self {
                magic,
                code,
                length,
            })
            .parse_next(&mut input)
            .ok()
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let [low, high] = self.length.to_le_bytes();
        [self.magic, self.code, low, high]
    }
}

/// A validated packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Packet<'a> {
    pub code: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Validates magic and declared length.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::BadPacket`] for short input, a wrong magic byte,
    /// or a declared length that differs from the payload length.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ErrorCode> {
        let header = PacketHeader::decode(bytes).ok_or(ErrorCode::BadPacket)?;
        let payload = &bytes[HEADER_LEN..];
        if header.magic != MAGIC || usize::from(header.length) != payload.len() {
            return Err(ErrorCode::BadPacket);
        }
        Ok(Self {
            code: header.code,
            payload,
        })
    }
}

/// Encodes a complete packet.
#[cfg(feature = "alloc")]
#[must_use]
pub fn encode_packet(code: u8, payload: &[u8]) -> Option<alloc::vec::Vec<u8>> {
    let header = PacketHeader::for_payload(code, payload.len())?;
    let mut bytes = alloc::vec::Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);
    Some(bytes)
}

/// Payload of a `Status` response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusRecord {
    pub state: State,
    /// Reserved, always zero.
    pub flags: u32,
    pub build_id: [u8; BUILD_ID_LEN],
}

impl StatusRecord {
    #[must_use]
    pub const fn new(state: State, build_id: [u8; BUILD_ID_LEN]) -> Self {
        Self {
            state,
            flags: 0,
            build_id,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let mut out = [0u8; STATUS_LEN];
        out[..4].copy_from_slice(&self.state.to_raw().to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..].copy_from_slice(&self.build_id);
        out
    }

    /// Decodes a status payload; `None` on a short payload or unknown state.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != STATUS_LEN {
            return None;
        }
        let mut input = bytes;
        let (state, flags) = (le_u32::<_, ContextError>, le_u32)
            .parse_next(&mut input)
            .ok()?;
        let mut build_id = [0u8; BUILD_ID_LEN];
        build_id.copy_from_slice(input);
        Some(Self {
            state: State::from_raw(state)?,
            flags,
            build_id,
        })
    }

    /// Build identifier up to the first NUL byte.
    #[must_use]
    pub fn build_id_str(&self) -> &str {
        let end = self
            .build_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BUILD_ID_LEN);
        core::str::from_utf8(&self.build_id[..end]).unwrap_or("")
    }
}

/// Zero-padded build identifier, truncated to [`BUILD_ID_LEN`] bytes.
#[must_use]
pub fn build_id_bytes(id: &str) -> [u8; BUILD_ID_LEN] {
    let mut out = [0u8; BUILD_ID_LEN];
    let len = id.len().min(BUILD_ID_LEN);
    out[..len].copy_from_slice(&id.as_bytes()[..len]);
    out
}

/// Payload of a `GetFrame` request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameDataRequest {
    pub adc: u32,
    pub byte_offset: u32,
    pub byte_count: u32,
}

impl FrameDataRequest {
    #[must_use]
    pub const fn new(adc: u32, byte_offset: u32, byte_count: u32) -> Self {
        Self {
            adc,
            byte_offset,
            byte_count,
        }
    }

    /// Decodes exactly [`FRAME_REQUEST_LEN`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FRAME_REQUEST_LEN {
            return None;
        }
        let mut input = bytes;
        (le_u32::<_, ContextError>, le_u32, le_u32)
            .map(|(adc, byte_offset, byte_count)| Self::new(adc, byte_offset, byte_count))
            .parse_next(&mut input)
            .ok()
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; FRAME_REQUEST_LEN] {
        let mut out = [0u8; FRAME_REQUEST_LEN];
        out[..4].copy_from_slice(&self.adc.to_le_bytes());
        out[4..8].copy_from_slice(&self.byte_offset.to_le_bytes());
        out[8..].copy_from_slice(&self.byte_count.to_le_bytes());
        out
    }
}
