//! Frame codec
//!
//! Every packet on the wire is a frame:
//!
//! ```text
//! [u8 code][u32 BE compressed length][deflate payload]
//! ```
//!
//! [`FrameReassembler`] turns an arbitrary sequence of reads back into whole
//! frames.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;
use vigil_core::compression::{deflate, inflate};

/// Size of the code and length prefix
pub const HEADER_SIZE: usize = 5;

/// Largest compressed payload accepted from a peer (64 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    /// Decompressed payload
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(code: u8, body: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }
}

/// Errors that can occur while framing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Need more data")]
    NeedMoreData,

    #[error("Unsupported frame size: {size} bytes (max: {max})")]
    UnsupportedSize { size: u64, max: u64 },

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Compress `body` and prepend the frame header
pub fn encode(code: u8, body: &[u8]) -> Result<Bytes, FrameError> {
    let compressed = deflate(body).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let len = u32::try_from(compressed.len()).map_err(|_| FrameError::UnsupportedSize {
        size: compressed.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut framed = Vec::with_capacity(HEADER_SIZE + compressed.len());
    framed.push(code);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&compressed);
    Ok(Bytes::from(framed))
}

/// Read the compressed length from a frame header
fn payload_len(buf: &[u8], max_frame_size: usize) -> Result<usize, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::NeedMoreData);
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let unsupported = || FrameError::UnsupportedSize {
        size: len as u64,
        max: max_frame_size as u64,
    };
    let len = usize::try_from(len).map_err(|_| unsupported())?;
    if len > max_frame_size {
        return Err(unsupported());
    }
    Ok(len)
}

/// Decode one frame from the front of `buf`
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<(Frame, usize), FrameError> {
    let len = payload_len(buf, max_frame_size)?;
    let total = HEADER_SIZE
        .checked_add(len)
        .ok_or(FrameError::UnsupportedSize {
            size: len as u64,
            max: max_frame_size as u64,
        })?;
    if buf.len() < total {
        return Err(FrameError::NeedMoreData);
    }
    let body = inflate(&buf[HEADER_SIZE..total]).map_err(|e| FrameError::Malformed(e.to_string()))?;
    Ok((Frame { code: buf[0], body }, total))
}

/// Incremental frame reassembly across partial reads
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameReassembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk and collect every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.buffer.is_empty() {
            let rest = self.drain(chunk, &mut frames);
            self.buffer.extend_from_slice(rest);
        } else {
            self.buffer.extend_from_slice(chunk);
            let buffer = std::mem::take(&mut self.buffer);
            let rest = self.drain(&buffer, &mut frames);
            self.buffer = rest.to_vec();
        }
        frames
    }

    /// Decode frames until the data runs out, returning the leftover
    fn drain<'a>(&self, mut data: &'a [u8], frames: &mut Vec<Frame>) -> &'a [u8] {
        loop {
            match decode(data, self.max_frame_size) {
                Ok((frame, consumed)) => {
                    frames.push(frame);
                    data = &data[consumed..];
                }
                Err(FrameError::NeedMoreData) => return data,
                Err(FrameError::Malformed(reason)) => {
                    warn!(code = data[0], %reason, "Dropping malformed frame");
                    // The header was complete, so the frame extent is known
                    let skip = payload_len(data, self.max_frame_size)
                        .map(|len| HEADER_SIZE + len)
                        .unwrap_or(data.len());
                    data = &data[skip.min(data.len())..];
                }
                Err(e @ FrameError::UnsupportedSize { .. }) => {
                    warn!(error = %e, dropped = data.len(), "Dropping buffered data");
                    return &[];
                }
            }
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let body = br#"{"message":"hello"}"#.repeat(20);
        let encoded = encode(7, &body).unwrap();
        assert_eq!(encoded[0], 7);

        let (frame, consumed) = decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame.code, 7);
        assert_eq!(frame.body, body);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_empty_body() {
        let encoded = encode(6, &[]).unwrap();
        let (frame, consumed) = decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame, Frame::new(6, Vec::new()));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_incomplete_input_needs_more_data() {
        let encoded = encode(1, b"payload").unwrap();
        assert_eq!(decode(&[], DEFAULT_MAX_FRAME_SIZE), Err(FrameError::NeedMoreData));
        assert_eq!(decode(&encoded[..4], DEFAULT_MAX_FRAME_SIZE), Err(FrameError::NeedMoreData));
        assert_eq!(
            decode(&encoded[..encoded.len() - 1], DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::NeedMoreData)
        );
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let header = [7u8, 0x00, 0x10, 0x00, 0x00];
        assert!(matches!(
            decode(&header, 1024),
            Err(FrameError::UnsupportedSize { size: 0x100000, max: 1024 })
        ));
    }

    #[test]
    fn test_corrupt_payload_is_malformed() {
        let data = [7u8, 0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode(&data, DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_split_at_every_offset_yields_one_frame() {
        let encoded = encode(10, &b"0123456789".repeat(30)).unwrap();
        for split in 0..=encoded.len() {
            let mut reassembler = FrameReassembler::default();
            let mut frames = reassembler.push(&encoded[..split]);
            frames.extend(reassembler.push(&encoded[split..]));
            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(frames[0].code, 10);
            assert_eq!(reassembler.buffered(), 0);
        }
    }

    #[test]
    fn test_many_frames_in_one_chunk() {
        let mut chunk = Vec::new();
        for code in [7u8, 8, 9] {
            chunk.extend_from_slice(&encode(code, &[code; 16]).unwrap());
        }
        let partial = encode(10, b"tail").unwrap();
        chunk.extend_from_slice(&partial[..3]);

        let mut reassembler = FrameReassembler::default();
        let codes: Vec<u8> = reassembler.push(&chunk).iter().map(|f| f.code).collect();
        assert_eq!(codes, vec![7, 8, 9]);
        assert_eq!(reassembler.buffered(), 3);

        let frames = reassembler.push(&partial[3..]);
        assert_eq!(frames, vec![Frame::new(10, b"tail".to_vec())]);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut chunk = vec![7u8, 0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff];
        chunk.extend_from_slice(&encode(3, b"after").unwrap());

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&chunk);
        assert_eq!(frames, vec![Frame::new(3, b"after".to_vec())]);
    }
}
