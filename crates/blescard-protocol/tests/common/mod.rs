//! Common test utilities for protocol integration tests.
//!
//! Builders for raw reader responses, so tests can describe what the
//! reader sends byte for byte without going through the session.

#![allow(dead_code)]

/// Build a raw RDR_to_PC frame.
pub fn response_frame(code: u8, slot: u8, seq: u8, status: u8, error: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10 + payload.len());
    bytes.push(code);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&[slot, seq, status, error, 0x00]);
    bytes.extend_from_slice(payload);
    bytes
}

/// Successful RDR_to_PC_DataBlock with a powered card.
pub fn data_block(slot: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    response_frame(0x80, slot, seq, 0x00, 0x00, payload)
}

/// RDR_to_PC_SlotStatus reporting a present, unpowered card.
pub fn slot_status_unpowered(slot: u8, seq: u8) -> Vec<u8> {
    response_frame(0x81, slot, seq, 0x01, 0x00, &[])
}

/// Split `bytes` at the given cut points (sorted, deduplicated, in range).
pub fn split_at_points(bytes: &[u8], mut points: Vec<usize>) -> Vec<Vec<u8>> {
    points.retain(|p| *p > 0 && *p < bytes.len());
    points.sort_unstable();
    points.dedup();

    let mut pieces = Vec::with_capacity(points.len() + 1);
    let mut start = 0;
    for p in points {
        pieces.push(bytes[start..p].to_vec());
        start = p;
    }
    pieces.push(bytes[start..].to_vec());
    pieces
}
