//! Reassembly of notification fragments into CCID responses.
//!
//! A BLE notification carries at most one MTU worth of bytes, so a
//! response of any real size arrives split across several notifications.
//! The transport adds no framing of its own: the only way to know a
//! response is complete is the length declared in its CCID header.
//!
//! # Lifecycle
//!
//! ```text
//!               feed()                feed()
//! ┌───────┐  header short  ┌──────────────┐  len == declared  ┌──────────┐
//! │ Empty │──────────────►│ Accumulating │──────────────────►│ Complete │──► cleared
//! └───────┘               └──────────────┘                   └──────────┘
//!     ▲                         │  header error  ──► Failed   (cleared)
//!     │                         │  len > declared ─► Overrun  (cleared, fatal)
//!     └─────────────────────────┘  bad header ───► Protocol  (cleared, fatal)
//! ```
//!
//! # Usage
//!
//! ```
//! use blescard_protocol::{Feed, Reassembler};
//!
//! let mut reassembler = Reassembler::new(1);
//!
//! // RDR_to_PC_DataBlock, 2-byte payload, split over two notifications
//! let frame = [0x80, 0x02, 0, 0, 0, 0x00, 0x01, 0x00, 0x00, 0x00, 0x90, 0x00];
//! assert_eq!(reassembler.feed(&frame[..7]).unwrap(), Feed::Incomplete);
//!
//! let Feed::Complete(response) = reassembler.feed(&frame[7..]).unwrap() else {
//!     panic!("expected a complete response");
//! };
//! assert_eq!(&response.payload[..], &[0x90, 0x00]);
//! assert!(reassembler.is_empty());
//! ```

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use blescard_core::{Error, Result, SCardError, constants::DEFAULT_MAX_FRAME_SIZE};

use crate::frame::{CcidHeader, CcidResponse, Decoded, decode_with_limit};

/// Initial buffer capacity, enough for a short APDU response.
const INITIAL_BUFFER_CAPACITY: usize = 512;

/// Result of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// More fragments are needed.
    Incomplete,
    /// The header reported a per-command error. The buffer was discarded.
    Failed {
        header: CcidHeader,
        error: SCardError,
    },
    /// A full response. The buffer was cleared.
    Complete(CcidResponse),
}

/// Accumulates fragments of a single CCID response.
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    slot_count: u8,
    max_frame_size: usize,
}

impl Reassembler {
    /// Create a reassembler validating slot indices against `slot_count`.
    pub fn new(slot_count: u8) -> Self {
        Self::with_max_frame_size(slot_count, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(slot_count: u8, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            slot_count,
            max_frame_size,
        }
    }

    pub fn set_slot_count(&mut self, slot_count: u8) {
        self.slot_count = slot_count;
    }

    pub fn slot_count(&self) -> u8 {
        self.slot_count
    }

    /// Append a fragment and try to complete the response.
    ///
    /// # Errors
    ///
    /// Every error clears the buffer and is fatal for the session:
    /// - `Error::EmptyFrame` for an empty fragment
    /// - `Error::SlotOutOfRange` or `Error::FrameTooLarge` for a bad header
    /// - `Error::FrameOverrun` when more bytes arrive than declared
    pub fn feed(&mut self, fragment: &[u8]) -> Result<Feed> {
        if fragment.is_empty() {
            self.clear();
            return Err(Error::EmptyFrame);
        }

        self.buffer.extend_from_slice(fragment);
        trace!(
            "Reassembly buffer: {} bytes after {}-byte fragment",
            self.buffer.len(),
            fragment.len()
        );

        if let Some(header) = CcidHeader::parse(&self.buffer) {
            if let Err(e) = header.validate(self.slot_count, self.max_frame_size) {
                warn!("Discarding malformed response header: {}", e);
                self.clear();
                return Err(e);
            }

            if let Some(error) = header.slot_error() {
                debug!(
                    "Slot {} reported error {:02X}: {}",
                    header.slot, header.error, error
                );
                self.clear();
                return Ok(Feed::Failed { header, error });
            }

            if self.buffer.len() > header.frame_len() {
                let received = self.buffer.len();
                self.clear();
                return Err(Error::FrameOverrun {
                    received,
                    declared: header.frame_len(),
                });
            }
        }

        match decode_with_limit(&self.buffer, self.slot_count, self.max_frame_size) {
            Ok(Decoded::NeedMoreData) => Ok(Feed::Incomplete),
            Ok(Decoded::Complete { response, .. }) => {
                self.clear();
                Ok(Feed::Complete(response))
            }
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    /// Discard any partial response.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
