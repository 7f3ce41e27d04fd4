//! Slot status interpretation.
//!
//! The reader reports card state in two places:
//!
//! - the **status bitmap** of the CCID status attribute, read once at
//!   session setup and then notified on every change;
//! - the **status and error bytes** of every CCID response header.
//!
//! # Status Bitmap
//!
//! ```text
//! byte 0        byte 1                          byte 2 ...
//! ┌─┬───────┐   ┌──────┬──────┬──────┬──────┐
//! │S│ count │   │slot 3│slot 2│slot 1│slot 0│   slots 4..7, LSB first
//! └─┴───────┘   └──────┴──────┴──────┴──────┘
//!  └ sleep flag   2 bits each: 0 absent, 1 present, 2 removed, 3 inserted
//! ```
//!
//! # Header Status Byte
//!
//! ```text
//! bit  7 6      5 4 3 2    1 0
//!     ┌────┐   ┌──────┐   ┌────┐
//!     │cmd │   │ RFU  │   │icc │   cmd: 0 ok, 1 failed, other unknown
//!     └────┘   └──────┘   └────┘   icc: 0 powered, 1 unpowered, 2 absent
//! ```

use tracing::warn;

use blescard_core::{
    Error, ErrorCode, Result, SCardError,
    constants::{
        COMMAND_STATUS_SHIFT, ICC_STATUS_MASK, LOW_POWER_FLAG, SLOT_COUNT_MASK,
        SLOT_ERROR_BAD_ATR_TCK, SLOT_ERROR_BAD_ATR_TS, SLOT_ERROR_BUSY_WITH_AUTO_SEQUENCE,
        SLOT_ERROR_CMD_ABORTED, SLOT_ERROR_CMD_NOT_SUPPORTED, SLOT_ERROR_CMD_SLOT_BUSY,
        SLOT_ERROR_DEACTIVATED_PROTOCOL, SLOT_ERROR_HW_ERROR, SLOT_ERROR_ICC_CLASS_NOT_SUPPORTED,
        SLOT_ERROR_ICC_MUTE, SLOT_ERROR_ICC_PROTOCOL_NOT_SUPPORTED,
        SLOT_ERROR_PROCEDURE_BYTE_CONFLICT, SLOT_ERROR_XFR_OVERRUN, SLOT_ERROR_XFR_PARITY_ERROR,
        SLOTS_PER_BITMAP_BYTE,
    },
};

/// 2-bit per-slot code of the status bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotCode {
    Absent,
    Present,
    Removed,
    Inserted,
}

impl SlotCode {
    /// Interpret the two low bits of `bits`.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => SlotCode::Absent,
            1 => SlotCode::Present,
            2 => SlotCode::Removed,
            _ => SlotCode::Inserted,
        }
    }

    /// A card is in the slot after this report.
    pub fn card_present(&self) -> bool {
        matches!(self, SlotCode::Present | SlotCode::Inserted)
    }

    /// The report carries a presence edge.
    pub fn is_change(&self) -> bool {
        matches!(self, SlotCode::Removed | SlotCode::Inserted)
    }
}

/// Parsed status bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Low-power flag set. Per-slot codes are not reported.
    Sleeping,
    /// One code per slot, indexed by slot number.
    Awake(Vec<SlotCode>),
}

impl DeviceStatus {
    pub fn is_sleeping(&self) -> bool {
        matches!(self, DeviceStatus::Sleeping)
    }
}

/// Slot count declared by the first byte of a status bitmap.
pub fn declared_slot_count(bytes: &[u8]) -> Result<u8> {
    bytes
        .first()
        .map(|b| b & SLOT_COUNT_MASK)
        .ok_or(Error::EmptyFrame)
}

/// Parse the device-wide status bitmap.
///
/// # Errors
///
/// - `Error::EmptyFrame` for empty input
/// - `Error::SlotCountMismatch` if the declared count differs from `expected_slot_count`
/// - `Error::SlotCountOverflow` if the bitmap is too short for the declared count
///
/// # Examples
///
/// ```
/// use blescard_protocol::slot_status::{DeviceStatus, SlotCode, parse_device_status_bitmap};
///
/// let status = parse_device_status_bitmap(&[0x05, 0x10, 0x02], 5).unwrap();
/// assert_eq!(
///     status,
///     DeviceStatus::Awake(vec![
///         SlotCode::Absent,
///         SlotCode::Absent,
///         SlotCode::Present,
///         SlotCode::Absent,
///         SlotCode::Removed,
///     ])
/// );
///
/// assert!(parse_device_status_bitmap(&[0x85], 5).unwrap().is_sleeping());
/// ```
pub fn parse_device_status_bitmap(bytes: &[u8], expected_slot_count: u8) -> Result<DeviceStatus> {
    let declared = declared_slot_count(bytes)?;

    if declared != expected_slot_count {
        return Err(Error::SlotCountMismatch {
            declared,
            expected: expected_slot_count,
        });
    }

    if bytes[0] & LOW_POWER_FLAG != 0 {
        return Ok(DeviceStatus::Sleeping);
    }

    let available = (bytes.len() - 1) * SLOTS_PER_BITMAP_BYTE;
    if usize::from(declared) > available {
        return Err(Error::SlotCountOverflow {
            declared,
            available,
        });
    }

    let codes = (0..usize::from(declared))
        .map(|slot| {
            let byte = bytes[1 + slot / SLOTS_PER_BITMAP_BYTE];
            let shift = (slot % SLOTS_PER_BITMAP_BYTE) * 2;
            SlotCode::from_bits(byte >> shift)
        })
        .collect();

    Ok(DeviceStatus::Awake(codes))
}

/// Card state carried by the low bits of a header status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccStatus {
    PresentPowered,
    PresentUnpowered,
    Absent,
    /// Reserved value. Prior slot state must be kept.
    Reserved,
}

impl IccStatus {
    /// `(present, powered)`, or `None` for the reserved value.
    pub fn card_status(&self) -> Option<(bool, bool)> {
        match self {
            IccStatus::PresentPowered => Some((true, true)),
            IccStatus::PresentUnpowered => Some((true, false)),
            IccStatus::Absent => Some((false, false)),
            IccStatus::Reserved => None,
        }
    }
}

pub fn parse_ccid_header_status(status: u8) -> IccStatus {
    match status & ICC_STATUS_MASK {
        0 => IccStatus::PresentPowered,
        1 => IccStatus::PresentUnpowered,
        2 => IccStatus::Absent,
        _ => {
            warn!("Reserved ICC status in header byte {:02X}", status);
            IccStatus::Reserved
        }
    }
}

/// Classify the error byte of a response header.
///
/// Returns `None` when the command succeeded or the reader only reports
/// that the command is not supported. Every card-level error is
/// recoverable.
pub fn parse_ccid_header_error(error: u8, status: u8) -> Option<SCardError> {
    match status >> COMMAND_STATUS_SHIFT {
        0 => None,
        1 => classify_slot_error(error),
        other => {
            warn!(
                "Unknown command status {} in header byte {:02X}, treating as failure",
                other, status
            );
            classify_slot_error(error)
        }
    }
}

fn classify_slot_error(error: u8) -> Option<SCardError> {
    let communication = |detail: &str| {
        Some(SCardError::recoverable(
            ErrorCode::CardCommunicationError,
            detail,
        ))
    };

    match error {
        SLOT_ERROR_CMD_NOT_SUPPORTED => None,
        SLOT_ERROR_ICC_MUTE => Some(SCardError::recoverable(
            ErrorCode::CardMute,
            "The card is mute",
        )),
        SLOT_ERROR_CMD_ABORTED => communication("The PC has sent an ABORT command"),
        SLOT_ERROR_XFR_PARITY_ERROR => communication("Parity error during transfer"),
        SLOT_ERROR_XFR_OVERRUN => communication("Overrun during transfer"),
        SLOT_ERROR_HW_ERROR => communication("Reader hardware error"),
        SLOT_ERROR_BAD_ATR_TS => communication("Invalid ATR TS byte"),
        SLOT_ERROR_BAD_ATR_TCK => communication("Invalid ATR checksum"),
        SLOT_ERROR_ICC_PROTOCOL_NOT_SUPPORTED => communication("Card protocol not supported"),
        SLOT_ERROR_ICC_CLASS_NOT_SUPPORTED => communication("Card class not supported"),
        SLOT_ERROR_PROCEDURE_BYTE_CONFLICT => communication("Error in T=0 protocol"),
        SLOT_ERROR_DEACTIVATED_PROTOCOL => communication("Protocol deactivated"),
        SLOT_ERROR_BUSY_WITH_AUTO_SEQUENCE => communication("Reader busy with automatic sequence"),
        SLOT_ERROR_CMD_SLOT_BUSY => communication("Slot busy"),
        other => Some(SCardError::recoverable(
            ErrorCode::CardCommunicationError,
            format!("CCID slot error: 0x{:02X}", other),
        )),
    }
}
