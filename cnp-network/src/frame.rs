//! Transport framing: `len(4) | crc32(4) | payload(len)`, little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use cnp_core::{CanopyError, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, Result, crc32};

pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CanopyError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| CanopyError::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_SIZE,
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(len);
    buf.put_u32_le(crc32(payload));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete, otherwise the
/// payload and the number of bytes consumed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Bytes, usize)>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CanopyError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let total = FRAME_HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }

    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[FRAME_HEADER_SIZE..total];
    let actual = crc32(payload);
    if expected != actual {
        cnp_metrics::increment_crc_failures();
        return Err(CanopyError::CrcMismatch { expected, actual });
    }

    Ok(Some((Bytes::copy_from_slice(payload), total)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let encoded = encode_frame(b"join me").unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 7);

        let (payload, used) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(&payload[..], b"join me");
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let encoded = encode_frame(b"partial").unwrap();
        assert!(parse_frame(&encoded[..3]).unwrap().is_none());
        assert!(parse_frame(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut encoded = encode_frame(b"payload").unwrap().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let err = parse_frame(&encoded).unwrap_err();
        assert!(matches!(err, CanopyError::CrcMismatch { .. }));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());

        let err = parse_frame(&header).unwrap_err();
        assert!(matches!(err, CanopyError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode_frame(&[]).unwrap();
        let (payload, used) = parse_frame(&encoded).unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(used, FRAME_HEADER_SIZE);
    }
}
