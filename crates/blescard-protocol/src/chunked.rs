//! Chunked writes over a size-limited transport.
//!
//! GATT writes carry at most 512 bytes. A CCID frame larger than the
//! transport limit is sent as consecutive chunks, each one issued only
//! after the previous write was confirmed.
//!
//! ```text
//! next_chunk() ──► Write(c0) ──► on_write_confirmed() ──► Write(c1) ──► ... ──► Done
//!                    │                                      │
//!                    └─ next_chunk() again: Pending ────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use blescard_protocol::chunked::{ChunkedWriter, WriteStep};
//!
//! let mut writer = ChunkedWriter::new(vec![0u8; 600], 512);
//!
//! let WriteStep::Write(first) = writer.next_chunk() else { unreachable!() };
//! assert_eq!(first.len(), 512);
//! assert_eq!(writer.next_chunk(), WriteStep::Pending);
//!
//! let WriteStep::Write(second) = writer.on_write_confirmed() else { unreachable!() };
//! assert_eq!(second.len(), 88);
//! assert_eq!(writer.on_write_confirmed(), WriteStep::Done);
//! ```

use bytes::Bytes;
use tracing::trace;

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    /// Issue this chunk to the transport.
    Write(Bytes),
    /// A chunk is still awaiting confirmation.
    Pending,
    /// Every chunk was confirmed.
    Done,
}

/// Splits one buffer into sequential transport writes.
#[derive(Debug, Clone)]
pub struct ChunkedWriter {
    data: Bytes,
    max_chunk_size: usize,
    /// Start of the next chunk to issue.
    offset: usize,
    /// Length of the chunk awaiting confirmation.
    in_flight: Option<usize>,
    chunks_written: usize,
}

impl ChunkedWriter {
    /// Create a writer for `data`.
    ///
    /// A zero `max_chunk_size` is raised to one byte.
    pub fn new(data: impl Into<Bytes>, max_chunk_size: usize) -> Self {
        Self {
            data: data.into(),
            max_chunk_size: max_chunk_size.max(1),
            offset: 0,
            in_flight: None,
            chunks_written: 0,
        }
    }

    /// Issue the next chunk unless one is already awaiting confirmation.
    pub fn next_chunk(&mut self) -> WriteStep {
        if self.in_flight.is_some() {
            return WriteStep::Pending;
        }
        if self.offset >= self.data.len() {
            return WriteStep::Done;
        }

        let end = (self.offset + self.max_chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.in_flight = Some(chunk.len());

        trace!(
            "Issuing chunk {} ({} bytes, {}/{})",
            self.chunks_written + 1,
            chunk.len(),
            end,
            self.data.len()
        );
        WriteStep::Write(chunk)
    }

    /// Record that the transport confirmed the chunk in flight, then
    /// issue the next one.
    pub fn on_write_confirmed(&mut self) -> WriteStep {
        if let Some(len) = self.in_flight.take() {
            self.offset += len;
            self.chunks_written += 1;
        }
        self.next_chunk()
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    /// Bytes not yet confirmed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.in_flight.is_none() && self.offset >= self.data.len()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }
}
