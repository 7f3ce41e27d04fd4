//! Core constants for the CCID-over-GATT protocol stack.
//!
//! This module gathers every wire-level literal used by the session: CCID
//! message opcodes, slot error codes, the status bitmap flags, chunking
//! limits and the Bluetooth SIG attribute identifiers read during session
//! setup.
//!
//! # Frame Layout
//!
//! Every CCID message starts with a fixed 10-byte header:
//!
//! ```text
//! offset  0      1..5          5      6      7        8        9
//!        ┌──────┬─────────────┬──────┬──────┬────────┬────────┬─────────┐
//!        │opcode│ length (LE) │ slot │ seq  │ status │ error  │ chain   │
//!        └──────┴─────────────┴──────┴──────┴────────┴────────┴─────────┘
//!                                            (commands: three parameter bytes)
//! ```
//!
//! followed by `length` bytes of payload.
//!
//! # Usage
//!
//! ```
//! use blescard_core::constants::*;
//!
//! assert_eq!(HEADER_SIZE, 10);
//! assert_eq!(PC_TO_RDR_XFR_BLOCK, 0x6F);
//! assert!(DEFAULT_MAX_CHUNK_SIZE <= 512);
//! ```

use uuid::Uuid;

// ============================================================================
// Frame Geometry
// ============================================================================

/// Size of the fixed CCID header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Offset of the little-endian payload length field inside the header.
pub const LENGTH_OFFSET: usize = 1;

/// Offset of the slot index byte inside the header.
pub const SLOT_OFFSET: usize = 5;

/// Offset of the sequence number byte inside the header.
pub const SEQUENCE_OFFSET: usize = 6;

/// Offset of the slot status byte inside a response header.
pub const STATUS_OFFSET: usize = 7;

/// Offset of the slot error byte inside a response header.
pub const ERROR_OFFSET: usize = 8;

/// Offset of the chain parameter byte inside a response header.
pub const CHAIN_OFFSET: usize = 9;

/// Default cap on a single transport write.
///
/// BLE attribute writes are limited to 512 bytes by the GATT specification.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 512;

/// Default hard cap on a declared frame length (header + payload).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

// ============================================================================
// Host to Reader Commands
// ============================================================================

/// Apply power to the card and return its ATR.
pub const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;

/// Remove power from the card.
pub const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;

/// Query the slot status without touching the card.
pub const PC_TO_RDR_GET_SLOT_STATUS: u8 = 0x65;

/// Vendor-specific command addressed to the reader itself.
pub const PC_TO_RDR_ESCAPE: u8 = 0x6B;

/// Exchange an APDU with the card.
pub const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;

// ============================================================================
// Reader to Host Responses
// ============================================================================

/// Response carrying card data (ATR or R-APDU).
pub const RDR_TO_PC_DATA_BLOCK: u8 = 0x80;

/// Response carrying only the slot status.
pub const RDR_TO_PC_SLOT_STATUS: u8 = 0x81;

/// Response to an escape command.
pub const RDR_TO_PC_ESCAPE: u8 = 0x83;

// ============================================================================
// Slot Errors (bError)
// ============================================================================

/// Command aborted by the host.
pub const SLOT_ERROR_CMD_ABORTED: u8 = 0xFF;

/// Card did not answer.
pub const SLOT_ERROR_ICC_MUTE: u8 = 0xFE;

/// Parity error during transfer.
pub const SLOT_ERROR_XFR_PARITY_ERROR: u8 = 0xFD;

/// Buffer overrun during transfer.
pub const SLOT_ERROR_XFR_OVERRUN: u8 = 0xFC;

/// Reader hardware error.
pub const SLOT_ERROR_HW_ERROR: u8 = 0xFB;

/// Invalid ATR initial character.
pub const SLOT_ERROR_BAD_ATR_TS: u8 = 0xF8;

/// Invalid ATR checksum.
pub const SLOT_ERROR_BAD_ATR_TCK: u8 = 0xF7;

/// Card protocol not supported by the reader.
pub const SLOT_ERROR_ICC_PROTOCOL_NOT_SUPPORTED: u8 = 0xF6;

/// Card voltage class not supported by the reader.
pub const SLOT_ERROR_ICC_CLASS_NOT_SUPPORTED: u8 = 0xF5;

/// T=0 procedure byte conflict.
pub const SLOT_ERROR_PROCEDURE_BYTE_CONFLICT: u8 = 0xF4;

/// Protocol deactivated on the card.
pub const SLOT_ERROR_DEACTIVATED_PROTOCOL: u8 = 0xF3;

/// Reader busy with an automatic sequence.
pub const SLOT_ERROR_BUSY_WITH_AUTO_SEQUENCE: u8 = 0xF2;

/// Slot busy with a previous command.
pub const SLOT_ERROR_CMD_SLOT_BUSY: u8 = 0xE0;

/// Command not supported. Benign: the reader answers but reports no fault.
pub const SLOT_ERROR_CMD_NOT_SUPPORTED: u8 = 0x00;

// ============================================================================
// Status Bytes
// ============================================================================

/// Mask of the card presence/power bits of a header status byte.
pub const ICC_STATUS_MASK: u8 = 0b0000_0011;

/// Shift of the command status bits of a header status byte.
pub const COMMAND_STATUS_SHIFT: u8 = 6;

/// Bit 7 of the first status bitmap byte: the reader is asleep.
pub const LOW_POWER_FLAG: u8 = 0x80;

/// Low 7 bits of the first status bitmap byte: the slot count.
pub const SLOT_COUNT_MASK: u8 = 0x7F;

/// Largest slot count a reader can declare.
pub const MAX_SLOT_COUNT: u8 = SLOT_COUNT_MASK;

/// Number of 2-bit slot codes packed into each bitmap byte.
pub const SLOTS_PER_BITMAP_BYTE: usize = 4;

// ============================================================================
// Vendor Escapes
// ============================================================================

/// Escape payload prefix asking the reader for a slot's name.
///
/// The slot index is appended as the third byte.
pub const SLOT_NAME_ESCAPE_PREFIX: [u8; 2] = [0x58, 0x21];

// ============================================================================
// Battery
// ============================================================================

/// Bits of the battery power state attribute that report external power.
pub const BATTERY_EXTERNAL_POWER_MASK: u8 = 0b0011_0000;

// ============================================================================
// GATT Attribute Identifiers
// ============================================================================

/// Device Information service.
pub const GATT_DEVICE_INFORMATION_SERVICE: u16 = 0x180A;

/// Battery service.
pub const GATT_BATTERY_SERVICE: u16 = 0x180F;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Model number string.
pub const GATT_MODEL_NUMBER: u16 = 0x2A24;

/// Serial number string.
pub const GATT_SERIAL_NUMBER: u16 = 0x2A25;

/// Firmware revision string, formatted `major.minor-build`.
pub const GATT_FIRMWARE_REVISION: u16 = 0x2A26;

/// Hardware revision string.
pub const GATT_HARDWARE_REVISION: u16 = 0x2A27;

/// Software revision string.
pub const GATT_SOFTWARE_REVISION: u16 = 0x2A28;

/// Manufacturer name string.
pub const GATT_MANUFACTURER_NAME: u16 = 0x2A29;

/// PnP ID (vendor source, vendor, product, version).
pub const GATT_PNP_ID: u16 = 0x2A50;

/// Battery level in percent.
pub const GATT_BATTERY_LEVEL: u16 = 0x2A19;

/// Battery power state bit field.
pub const GATT_BATTERY_POWER_STATE: u16 = 0x2A1A;

/// Expand a 16-bit SIG-assigned identifier into a full UUID.
///
/// # Examples
///
/// ```
/// use blescard_core::constants::{GATT_BATTERY_LEVEL, sig_uuid};
///
/// let uuid = sig_uuid(GATT_BATTERY_LEVEL);
/// assert_eq!(uuid.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
/// ```
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Default CCID service identifier (plain variant).
pub const DEFAULT_CCID_SERVICE: Uuid = Uuid::from_u128(0x7f20a000_b6e2_4a1c_9b4f_2c5e8d1f0a01);

/// Default CCID service identifier (secured variant).
pub const DEFAULT_CCID_SECURED_SERVICE: Uuid =
    Uuid::from_u128(0x7f20a000_b6e2_4a1c_9b4f_2c5e8d1f0a02);

/// Default CCID status characteristic (slot bitmap, read + notify).
pub const DEFAULT_CCID_STATUS: Uuid = Uuid::from_u128(0x7f20a001_b6e2_4a1c_9b4f_2c5e8d1f0a01);

/// Default host-to-reader characteristic (write).
pub const DEFAULT_CCID_PC_TO_RDR: Uuid = Uuid::from_u128(0x7f20a002_b6e2_4a1c_9b4f_2c5e8d1f0a01);

/// Default reader-to-host characteristic (notify).
pub const DEFAULT_CCID_RDR_TO_PC: Uuid = Uuid::from_u128(0x7f20a003_b6e2_4a1c_9b4f_2c5e8d1f0a01);
