//! Control-frame opcodes carried on [`crate::codec::CONTROL_STREAM`].
//!
//! A control frame's body is `opcode:u8` followed by a single
//! `streamid_varint` argument for all three opcodes currently defined.

use crate::codec::{self, StreamId, VarintScan, MAX_STREAM_ID_BYTES};
use crate::error::SstError;

pub(crate) const NEW_STREAM: u8 = 1;
pub(crate) const CLOSE_STREAM: u8 = 2;
pub(crate) const ACK_CLOSE: u8 = 3;

pub(crate) enum ControlFrame {
    NewStream(StreamId),
    CloseStream(StreamId),
    AckClose(StreamId),
}

/// Builds a control frame body: `opcode || sid`.
pub(crate) fn encode(opcode: u8, sid: StreamId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + codec::varint_len(sid));
    buf.push(opcode);
    codec::write_varint(sid, &mut buf);
    buf
}

pub(crate) fn decode(body: &[u8]) -> Result<ControlFrame, SstError> {
    let (&opcode, rest) =
        body.split_first().ok_or(SstError::ProtocolViolation("empty control frame"))?;

    let sid = match codec::scan_varint(rest, MAX_STREAM_ID_BYTES) {
        VarintScan::Complete(sid, _) => sid,
        VarintScan::Incomplete | VarintScan::TooLong => {
            return Err(SstError::ProtocolViolation("bad control frame stream id"));
        }
    };

    match opcode {
        NEW_STREAM => Ok(ControlFrame::NewStream(sid)),
        CLOSE_STREAM => Ok(ControlFrame::CloseStream(sid)),
        ACK_CLOSE => Ok(ControlFrame::AckClose(sid)),
        _ => Err(SstError::ProtocolViolation("unknown control opcode")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        for (opcode, expect) in
            [(NEW_STREAM, 7u64), (CLOSE_STREAM, 9u64), (ACK_CLOSE, 1 << 20)]
        {
            let body = encode(opcode, expect);
            match decode(&body) {
                Ok(ControlFrame::NewStream(sid)) => assert_eq!(sid, expect),
                Ok(ControlFrame::CloseStream(sid)) => assert_eq!(sid, expect),
                Ok(ControlFrame::AckClose(sid)) => assert_eq!(sid, expect),
                Err(err) => panic!("unexpected decode error: {err}"),
            }
        }
    }

    #[test]
    fn unknown_opcode_is_protocol_violation() {
        let body = vec![0xff, 0x02];
        assert!(matches!(decode(&body), Err(SstError::ProtocolViolation(_))));
    }

    #[test]
    fn empty_body_is_protocol_violation() {
        assert!(matches!(decode(&[]), Err(SstError::ProtocolViolation(_))));
    }
}
