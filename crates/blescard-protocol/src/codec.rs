//! Tokio codec for CCID over byte-stream transports.
//!
//! USB bulk endpoints and serial links deliver CCID responses as a plain
//! byte stream. [`CcidCodec`] plugs the frame codec into Tokio's
//! `Framed` so such transports get the same request/response types as the
//! GATT session.
//!
//! ```text
//! byte stream -> Decoder -> CcidResponse
//! CcidCommand -> Encoder -> byte stream
//! ```
//!
//! Unlike [`Reassembler`](crate::Reassembler), bytes following a complete
//! frame are kept for the next call: a stream may carry several frames
//! back to back. Per-command errors stay inside the decoded response; use
//! [`CcidResponse::slot_error`] to inspect them.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use blescard_protocol::{CcidCodec, CcidCommand};
//! use futures::{SinkExt, StreamExt};
//! use tokio_util::codec::Framed;
//!
//! # async fn example(port: tokio::io::DuplexStream) -> blescard_core::Result<()> {
//! let mut framed = Framed::new(port, CcidCodec::new(1));
//!
//! framed.send(CcidCommand::power_on(0).with_sequence(1)).await?;
//! if let Some(Ok(response)) = framed.next().await {
//!     println!("ATR: {:02X?}", &response.payload[..]);
//! }
//! # Ok(())
//! # }
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use blescard_core::{
    Error, Result,
    constants::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE},
};

use crate::frame::{CcidCommand, CcidHeader, CcidResponse, Decoded, decode_with_limit};

/// Tokio codec for CCID messages.
#[derive(Debug)]
pub struct CcidCodec {
    slot_count: u8,

    /// Frames declaring more than this are rejected in both directions.
    max_frame_size: usize,
}

impl CcidCodec {
    pub fn new(slot_count: u8) -> Self {
        Self::with_max_frame_size(slot_count, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(slot_count: u8, max_frame_size: usize) -> Self {
        Self {
            slot_count,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for CcidCodec {
    type Item = CcidResponse;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        match decode_with_limit(&src[..], self.slot_count, self.max_frame_size)? {
            Decoded::NeedMoreData => {
                if let Some(header) = CcidHeader::parse(&src[..]) {
                    src.reserve(header.frame_len() - src.len());
                } else {
                    src.reserve(HEADER_SIZE - src.len());
                }
                Ok(None)
            }
            Decoded::Complete {
                response,
                frame_len,
            } => {
                src.advance(frame_len);
                trace!(
                    "Decoded {} for slot {} ({} bytes)",
                    response.code(),
                    response.slot(),
                    frame_len
                );
                Ok(Some(response))
            }
        }
    }
}

impl Encoder<CcidCommand> for CcidCodec {
    type Error = Error;

    fn encode(&mut self, item: CcidCommand, dst: &mut BytesMut) -> Result<()> {
        let size = item.frame_len();
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max_size: self.max_frame_size,
            });
        }
        item.encode_into(dst)
    }
}
