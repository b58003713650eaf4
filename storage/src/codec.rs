//! Encode/decode for committed operations flowing through the apply path
//! (SPEC_FULL.md §4.3: "primary format is a compact binary encoding; a
//! legacy text-map format must be accepted as a fallback").
//!
//! The legacy fallback is a JSON payload behind an 8-byte big-endian length
//! prefix; the primary path is now
//! bincode, which is both smaller and doesn't require the length prefix
//! (bincode framing is handled by the Raft entry boundaries themselves).

use byteorder::{BigEndian, ByteOrder};
use metastore_model::{CResult, Error, Op};

/// Encode an `Op` using the primary binary format.
pub fn encode_op(op: &Op) -> CResult<Vec<u8>> {
    bincode::serialize(op).map_err(|e| Error::Internal(format!("encode op: {}", e)))
}

/// Decode a committed payload, trying the primary binary format first and
/// falling back to the legacy length-prefixed JSON format. Never panics on
/// malformed input — the apply loop must log and skip rather than crash
/// (SPEC_FULL.md §4.3 step 2).
pub fn decode_op(bytes: &[u8]) -> CResult<Op> {
    match bincode::deserialize::<Op>(bytes) {
        Ok(op) => Ok(op),
        Err(primary_err) => decode_legacy_op(bytes)
            .map_err(|_| Error::Internal(format!("decode op: {}", primary_err))),
    }
}

fn decode_legacy_op(bytes: &[u8]) -> CResult<Op> {
    if bytes.len() < 8 {
        return Err(Error::Internal("legacy payload shorter than length prefix".into()));
    }
    let len = BigEndian::read_u64(&bytes[..8]) as usize;
    let body = bytes
        .get(8..8 + len)
        .ok_or_else(|| Error::Internal("legacy payload length prefix out of bounds".into()))?;
    serde_json::from_slice(body).map_err(|e| Error::Internal(format!("legacy decode: {}", e)))
}

/// Encode the legacy format, used only by tests exercising fallback decoding.
#[cfg(test)]
pub fn encode_legacy_op(op: &Op) -> Vec<u8> {
    let body = serde_json::to_vec(op).expect("serialize op as json");
    let mut out = Vec::with_capacity(8 + body.len());
    let mut len_buf = [0u8; 8];
    BigEndian::write_u64(&mut len_buf, body.len() as u64);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primary_binary_format() {
        let op = Op::Put {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            lease_id: 0,
        };
        let bytes = encode_op(&op).unwrap();
        assert_eq!(decode_op(&bytes).unwrap(), op);
    }

    #[test]
    fn falls_back_to_legacy_json_format() {
        let op = Op::DeleteRange {
            key: b"a".to_vec(),
            range_end: b"z".to_vec(),
        };
        let bytes = encode_legacy_op(&op);
        assert_eq!(decode_op(&bytes).unwrap(), op);
    }

    #[test]
    fn garbage_input_is_an_error_not_a_panic() {
        let bytes = vec![0xff, 0x00, 0x01];
        assert!(decode_op(&bytes).is_err());
    }
}
