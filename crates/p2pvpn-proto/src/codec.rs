//! Codec for length-prefixed tunnel frames

use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Truncated frame: expected {expected} bytes, stream closed after {received}")]
    Truncated { expected: usize, received: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel frame codec
///
/// Format: `[length: u16 little-endian][payload: length bytes]`
///
/// The receive side refuses any declared length above the configured
/// maximum, so a corrupt prefix never makes the reader buffer more than one
/// frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Use a custom frame cap (clamped to what the 2-byte prefix can express)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u16::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode one frame into a freshly allocated buffer
    pub fn encode_frame(&self, frame: &[u8]) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
        self.put_frame(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    fn put_frame(&self, frame: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame.len());
        dst.put_u16_le(frame.len() as u16);
        dst.extend_from_slice(frame);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if buf.is_empty() {
            return Ok(None);
        }

        // The peer closed mid-frame: never hand out the partial payload.
        let expected = if buf.len() < LENGTH_PREFIX_SIZE {
            LENGTH_PREFIX_SIZE
        } else {
            LENGTH_PREFIX_SIZE + u16::from_le_bytes([buf[0], buf[1]]) as usize
        };
        let received = buf.len();
        buf.clear();

        Err(FrameError::Truncated { expected, received })
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        self.put_frame(frame, dst)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.put_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn frames_from(wire: &[u8]) -> Vec<Result<Vec<u8>, String>> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(wire);
        let mut out = Vec::new();
        loop {
            match codec.decode_eof(&mut buf) {
                Ok(Some(frame)) => out.push(Ok(frame.to_vec())),
                Ok(None) => break,
                Err(e) => {
                    out.push(Err(e.to_string()));
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn test_encode_layout() {
        let frame = [0xAB; 46];
        let encoded = FrameCodec::new().encode_frame(&frame).unwrap();

        assert_eq!(encoded.len(), 48);
        assert_eq!(&encoded[..2], &[0x2E, 0x00]);
        assert_eq!(&encoded[2..], &frame[..]);
    }

    #[test]
    fn test_roundtrip_boundaries() {
        let codec = FrameCodec::new();
        for size in [0, 1, 1500, MAX_FRAME_SIZE] {
            let frame: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let encoded = codec.encode_frame(&frame).unwrap();

            let mut buf = BytesMut::from(encoded.as_ref());
            let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.as_ref(), frame.as_slice());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let frame = vec![0u8; MAX_FRAME_SIZE + 1];
        let result = FrameCodec::new().encode_frame(&frame);
        assert!(matches!(
            result,
            Err(FrameError::TooLarge { size, max }) if size == MAX_FRAME_SIZE + 1 && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_declaration() {
        // 0xFFFF declared, far above the cap
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0x00][..]);
        let result = FrameCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(FrameError::TooLarge { size: 65535, .. })));
    }

    #[test]
    fn test_decode_waits_for_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x03, 0x00, 0x01][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x02, 0x03]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ref(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_prefix_only_then_eof_is_truncated() {
        let out = frames_from(&[0x0A, 0x00]);
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap_err().contains("Truncated"));
    }

    #[test]
    fn test_half_prefix_then_eof_is_truncated() {
        let mut buf = BytesMut::from(&[0x0A][..]);
        let result = FrameCodec::new().decode_eof(&mut buf);
        assert!(matches!(
            result,
            Err(FrameError::Truncated {
                expected: 2,
                received: 1
            })
        ));
    }

    #[test]
    fn test_empty_frame_is_complete() {
        let out = frames_from(&[0x00, 0x00]);
        assert_eq!(out, vec![Ok(Vec::new())]);
    }

    #[tokio::test]
    async fn test_complete_frame_then_truncated_frame() {
        let mut wire = vec![0x0A, 0x00];
        wire.extend_from_slice(&[7u8; 10]);
        // Second frame declares 5 bytes but only its prefix arrives
        wire.extend_from_slice(&[0x05, 0x00]);

        let mut reader = FramedRead::new(&wire[..], FrameCodec::new());

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), &[7u8; 10]);

        let second = reader.next().await.unwrap();
        assert!(matches!(
            second,
            Err(FrameError::Truncated {
                expected: 7,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_clean_close_ends_stream() {
        let wire = FrameCodec::new().encode_frame(b"hello").unwrap();
        let mut reader = FramedRead::new(wire.as_ref(), FrameCodec::new());

        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), b"hello");
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn test_custom_cap_clamped_to_prefix_range() {
        let codec = FrameCodec::with_max_frame_size(1 << 20);
        assert_eq!(codec.max_frame_size(), u16::MAX as usize);
    }
}
