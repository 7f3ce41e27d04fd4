//! CCID frame encoding and decoding.
//!
//! Every exchange with the reader is a single CCID message: a 10-byte
//! header followed by a payload whose length is declared in the header.
//!
//! ```text
//! PC_to_RDR   │ opcode │ dwLength (LE) │ slot │ seq │ param0 │ param1 │ param2 │ payload...
//! RDR_to_PC   │ opcode │ dwLength (LE) │ slot │ seq │ status │ error  │ chain  │ payload...
//! ```
//!
//! # Usage
//!
//! ```
//! use blescard_protocol::frame::{CcidCommand, CommandCode, Decoded, decode};
//!
//! let cmd = CcidCommand::xfr_block(1, vec![0x00, 0xA4, 0x04, 0x00]).with_sequence(7);
//! let bytes = cmd.encode().unwrap();
//! assert_eq!(bytes.len(), 14);
//! assert_eq!(bytes[0], CommandCode::XfrBlock.as_u8());
//!
//! // A short read is not an error, only a request for more bytes.
//! assert!(matches!(decode(&bytes[..6], 2).unwrap(), Decoded::NeedMoreData));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use blescard_core::{
    Error, Result, SCardError,
    constants::{
        CHAIN_OFFSET, DEFAULT_MAX_FRAME_SIZE, ERROR_OFFSET, HEADER_SIZE, LENGTH_OFFSET,
        PC_TO_RDR_ESCAPE, PC_TO_RDR_GET_SLOT_STATUS, PC_TO_RDR_ICC_POWER_OFF,
        PC_TO_RDR_ICC_POWER_ON, PC_TO_RDR_XFR_BLOCK, RDR_TO_PC_DATA_BLOCK, RDR_TO_PC_ESCAPE,
        RDR_TO_PC_SLOT_STATUS, SEQUENCE_OFFSET, SLOT_NAME_ESCAPE_PREFIX, SLOT_OFFSET,
        STATUS_OFFSET,
    },
};

use crate::slot_status::{IccStatus, parse_ccid_header_error, parse_ccid_header_status};

/// Host-to-reader message types used by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    IccPowerOn,
    IccPowerOff,
    GetSlotStatus,
    Escape,
    XfrBlock,
}

impl CommandCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            CommandCode::IccPowerOn => PC_TO_RDR_ICC_POWER_ON,
            CommandCode::IccPowerOff => PC_TO_RDR_ICC_POWER_OFF,
            CommandCode::GetSlotStatus => PC_TO_RDR_GET_SLOT_STATUS,
            CommandCode::Escape => PC_TO_RDR_ESCAPE,
            CommandCode::XfrBlock => PC_TO_RDR_XFR_BLOCK,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            PC_TO_RDR_ICC_POWER_ON => Some(CommandCode::IccPowerOn),
            PC_TO_RDR_ICC_POWER_OFF => Some(CommandCode::IccPowerOff),
            PC_TO_RDR_GET_SLOT_STATUS => Some(CommandCode::GetSlotStatus),
            PC_TO_RDR_ESCAPE => Some(CommandCode::Escape),
            PC_TO_RDR_XFR_BLOCK => Some(CommandCode::XfrBlock),
            _ => None,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandCode::IccPowerOn => "PC_to_RDR_IccPowerOn",
            CommandCode::IccPowerOff => "PC_to_RDR_IccPowerOff",
            CommandCode::GetSlotStatus => "PC_to_RDR_GetSlotStatus",
            CommandCode::Escape => "PC_to_RDR_Escape",
            CommandCode::XfrBlock => "PC_to_RDR_XfrBlock",
        };
        write!(f, "{} ({:02X})", name, self.as_u8())
    }
}

/// Reader-to-host message types.
///
/// Unknown opcodes are kept so the session can report them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    DataBlock,
    SlotStatus,
    Escape,
    Unknown(u8),
}

impl ResponseCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ResponseCode::DataBlock => RDR_TO_PC_DATA_BLOCK,
            ResponseCode::SlotStatus => RDR_TO_PC_SLOT_STATUS,
            ResponseCode::Escape => RDR_TO_PC_ESCAPE,
            ResponseCode::Unknown(code) => *code,
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        match code {
            RDR_TO_PC_DATA_BLOCK => ResponseCode::DataBlock,
            RDR_TO_PC_SLOT_STATUS => ResponseCode::SlotStatus,
            RDR_TO_PC_ESCAPE => ResponseCode::Escape,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::DataBlock => "RDR_to_PC_DataBlock",
            ResponseCode::SlotStatus => "RDR_to_PC_SlotStatus",
            ResponseCode::Escape => "RDR_to_PC_Escape",
            ResponseCode::Unknown(_) => "Unknown",
        };
        write!(f, "{} ({:02X})", name, self.as_u8())
    }
}

/// An outgoing CCID message.
///
/// The sequence number is assigned by the session right before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcidCommand {
    pub code: CommandCode,
    pub slot: u8,
    pub sequence: u8,
    pub parameters: [u8; 3],
    pub payload: Bytes,
}

impl CcidCommand {
    pub fn new(code: CommandCode, slot: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            slot,
            sequence: 0,
            parameters: [0; 3],
            payload: payload.into(),
        }
    }

    /// Power the card with automatic voltage selection.
    pub fn power_on(slot: u8) -> Self {
        Self::new(CommandCode::IccPowerOn, slot, Bytes::new())
    }

    pub fn power_off(slot: u8) -> Self {
        Self::new(CommandCode::IccPowerOff, slot, Bytes::new())
    }

    pub fn get_slot_status(slot: u8) -> Self {
        Self::new(CommandCode::GetSlotStatus, slot, Bytes::new())
    }

    pub fn xfr_block(slot: u8, apdu: impl Into<Bytes>) -> Self {
        Self::new(CommandCode::XfrBlock, slot, apdu)
    }

    /// Reader control command. Escapes always address slot 0.
    pub fn escape(data: impl Into<Bytes>) -> Self {
        Self::new(CommandCode::Escape, 0, data)
    }

    /// Vendor escape asking for the name of `slot`.
    pub fn slot_name(slot: u8) -> Self {
        let [a, b] = SLOT_NAME_ESCAPE_PREFIX;
        Self::escape(vec![a, b, slot])
    }

    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = sequence;
        self
    }

    /// Total encoded size (header + payload).
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the wire form of this command to `dst`.
    ///
    /// # Errors
    /// Returns `Error::FrameTooLarge` if the payload length does not fit
    /// the 32-bit length field.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let length = u32::try_from(self.payload.len()).map_err(|_| Error::FrameTooLarge {
            size: self.frame_len(),
            max_size: HEADER_SIZE.saturating_add(u32::MAX as usize),
        })?;

        dst.reserve(self.frame_len());
        dst.put_u8(self.code.as_u8());
        dst.put_u32_le(length);
        dst.put_u8(self.slot);
        dst.put_u8(self.sequence);
        dst.put_slice(&self.parameters);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode this command into a standalone buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// The fixed part of a reader response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcidHeader {
    pub code: ResponseCode,
    pub length: u32,
    pub slot: u8,
    pub sequence: u8,
    pub status: u8,
    pub error: u8,
    pub chain: u8,
}

impl CcidHeader {
    /// Read a header from the first [`HEADER_SIZE`] bytes, if available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let mut length = [0u8; 4];
        length.copy_from_slice(&header[LENGTH_OFFSET..LENGTH_OFFSET + 4]);

        Some(Self {
            code: ResponseCode::from(header[0]),
            length: u32::from_le_bytes(length),
            slot: header[SLOT_OFFSET],
            sequence: header[SEQUENCE_OFFSET],
            status: header[STATUS_OFFSET],
            error: header[ERROR_OFFSET],
            chain: header[CHAIN_OFFSET],
        })
    }

    /// Declared total frame length (header + payload).
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    pub fn icc_status(&self) -> IccStatus {
        parse_ccid_header_status(self.status)
    }

    /// The per-command error reported in this header, if any.
    pub fn slot_error(&self) -> Option<SCardError> {
        parse_ccid_header_error(self.error, self.status)
    }

    /// Check the header against the session's limits.
    pub fn validate(&self, slot_count: u8, max_frame_size: usize) -> Result<()> {
        if self.slot >= slot_count {
            return Err(Error::SlotOutOfRange {
                slot: self.slot,
                slot_count,
            });
        }
        if self.frame_len() > max_frame_size {
            return Err(Error::FrameTooLarge {
                size: self.frame_len(),
                max_size: max_frame_size,
            });
        }
        Ok(())
    }
}

/// A complete reader response. Never mutated once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcidResponse {
    pub header: CcidHeader,
    pub payload: Bytes,
}

impl CcidResponse {
    pub fn code(&self) -> ResponseCode {
        self.header.code
    }

    pub fn slot(&self) -> u8 {
        self.header.slot
    }

    pub fn sequence(&self) -> u8 {
        self.header.sequence
    }

    pub fn icc_status(&self) -> IccStatus {
        self.header.icc_status()
    }

    pub fn slot_error(&self) -> Option<SCardError> {
        self.header.slot_error()
    }
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The header or payload is still incomplete.
    NeedMoreData,
    /// A full response. `frame_len` bytes of the input were consumed.
    Complete {
        response: CcidResponse,
        frame_len: usize,
    },
}

/// Decode a reader response with the default frame size cap.
///
/// See [`decode_with_limit`].
pub fn decode(bytes: &[u8], slot_count: u8) -> Result<Decoded> {
    decode_with_limit(bytes, slot_count, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a reader response from the start of `bytes`.
///
/// Bytes beyond the declared frame length are left to the caller, who
/// decides whether they belong to the next frame or are an overrun.
///
/// # Errors
///
/// - `Error::EmptyFrame` for empty input
/// - `Error::SlotOutOfRange` if the slot index is not below `slot_count`
/// - `Error::FrameTooLarge` if the declared length exceeds `max_frame_size`
pub fn decode_with_limit(bytes: &[u8], slot_count: u8, max_frame_size: usize) -> Result<Decoded> {
    if bytes.is_empty() {
        return Err(Error::EmptyFrame);
    }

    let Some(header) = CcidHeader::parse(bytes) else {
        return Ok(Decoded::NeedMoreData);
    };
    header.validate(slot_count, max_frame_size)?;

    let frame_len = header.frame_len();
    if bytes.len() < frame_len {
        return Ok(Decoded::NeedMoreData);
    }

    Ok(Decoded::Complete {
        response: CcidResponse {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..frame_len]),
        },
        frame_len,
    })
}
