//! Variable-length integer framing: the packet-length prefix and the stream
//! id that follows it.
//!
//! Both values share one encoding: each byte's low bit is a continuation
//! flag (`1` = more bytes follow), the remaining 7 bits hold a little-endian
//! chunk of the magnitude (least-significant chunk first).

use crate::error::SstError;

/// A logical stream identifier. `0` is reserved for control frames.
pub type StreamId = u64;

/// Stream id reserved for [`crate::multiplex`] control frames.
pub const CONTROL_STREAM: StreamId = 0;

/// Upper bound on a serialized [`StreamId`], per the wire format.
pub const MAX_STREAM_ID_BYTES: usize = 9;

/// Upper bound on a serialized packet length.
pub const MAX_LEN_BYTES: usize = 5;

/// Largest payload-plus-stream-id byte count a packet length can carry.
pub const MAX_FRAME_BODY: u32 = (1 << 30) - 1;

/// Appends the varint encoding of `value` to `out`.
pub(crate) fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let chunk = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(chunk << 1);
            return;
        }
        out.push((chunk << 1) | 1);
    }
}

/// Number of bytes `write_varint` would emit for `value`.
pub(crate) fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Outcome of scanning a prefix of bytes for a complete varint.
pub(crate) enum VarintScan {
    /// Fully parsed: `(value, bytes consumed)`.
    Complete(u64, usize),
    /// Not enough bytes yet to find the terminating byte.
    Incomplete,
    /// Continuation bit still set after `max_bytes` bytes.
    TooLong,
}

/// Scans `buf` (up to `max_bytes`) for a complete varint.
pub(crate) fn scan_varint(buf: &[u8], max_bytes: usize) -> VarintScan {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().take(max_bytes).enumerate() {
        value |= u64::from(b >> 1) << shift;
        if b & 1 == 0 {
            return VarintScan::Complete(value, i + 1);
        }
        shift += 7;
    }
    if buf.len() >= max_bytes { VarintScan::TooLong } else { VarintScan::Incomplete }
}

/// Encodes one send: `len_bytes || sid_bytes || payload` in a single
/// contiguous allocation, so the socket wrapper can issue one write.
pub(crate) fn encode_frame(origin_stream: StreamId, payload: &[u8]) -> Result<Vec<u8>, SstError> {
    let sid_len = varint_len(origin_stream);
    let total = payload.len().checked_add(sid_len).ok_or(SstError::PayloadTooLarge)?;
    if total > MAX_FRAME_BODY as usize {
        return Err(SstError::PayloadTooLarge);
    }

    let len_len = varint_len(total as u64);
    if len_len > MAX_LEN_BYTES {
        return Err(SstError::PayloadTooLarge);
    }

    let mut buf = Vec::with_capacity(len_len + total);
    write_varint(total as u64, &mut buf);
    write_varint(origin_stream, &mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Splits a fully-assembled `sid || body` window into its stream id and
/// payload.
pub(crate) fn split_sid_body(window: &[u8]) -> Result<(StreamId, &[u8]), SstError> {
    match scan_varint(window, MAX_STREAM_ID_BYTES) {
        VarintScan::Complete(sid, consumed) => Ok((sid, &window[consumed..])),
        VarintScan::Incomplete | VarintScan::TooLong => {
            Err(SstError::ProtocolViolation("bad stream id"))
        }
    }
}
