//! Length-prefixed framing
//!
//! Each message on the wire is a `u32` big-endian length followed by exactly
//! that many payload bytes. The prefix is stripped before the payload is
//! handed to a worker. A zero-length frame is legal.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Slice one complete frame off the front of `buf`.
///
/// Returns `None` when the buffer does not yet hold the prefix plus the full
/// payload, leaving `buf` untouched. On success the prefix and payload are
/// consumed and the payload is returned; the unframed tail stays in `buf`.
/// Any length value is accepted here, bounds are a policy for upper layers.
pub fn extract_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes(buf[..FRAME_HEADER_LEN].try_into().unwrap()) as usize;
    if buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    buf.advance(FRAME_HEADER_LEN);
    Some(buf.split_to(len).freeze())
}

/// Prefix `payload` with its length and append the frame to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_frames_extract_in_order() {
        let payloads: [&[u8]; 4] = [b"alpha", b"", b"b", b"gamma ray"];
        let mut buf = BytesMut::new();
        for p in payloads {
            encode_frame(p, &mut buf);
        }
        // an incomplete tail behind the complete frames
        buf.put_u32(100);
        buf.put_slice(b"partial");

        for p in payloads {
            let got = extract_frame(&mut buf).expect("frame");
            assert_eq!(got.as_ref(), p);
        }
        assert!(extract_frame(&mut buf).is_none());
        assert_eq!(buf.len(), FRAME_HEADER_LEN + "partial".len());
    }

    #[test]
    fn test_starved_header_leaves_buffer_unchanged() {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(extract_frame(&mut buf).is_none());
        assert_eq!(buf.as_ref(), &[0u8, 0, 0]);
    }

    #[test]
    fn test_starved_payload_leaves_buffer_unchanged() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(b"ab");
        assert!(extract_frame(&mut buf).is_none());
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 2);
        // completing the payload releases the frame
        buf.put_slice(b"cd");
        let got = extract_frame(&mut buf).expect("frame");
        assert_eq!(got.as_ref(), b"abcd");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_zero_length_frame() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf);
        let got = extract_frame(&mut buf).expect("frame");
        assert!(got.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_arrival() {
        let mut wire = BytesMut::new();
        encode_frame(b"drip", &mut wire);
        let mut buf = BytesMut::new();
        let mut frames = 0;
        for b in wire.as_ref() {
            buf.put_u8(*b);
            while let Some(p) = extract_frame(&mut buf) {
                assert_eq!(p.as_ref(), b"drip");
                frames += 1;
            }
        }
        assert_eq!(frames, 1);
    }
}
