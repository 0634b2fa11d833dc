// Length-prefixed framing: 4-byte big-endian length + payload.
//
// Encoding is a single allocation (header + payload). Decoding is streaming:
// callers feed raw socket reads into a `FrameDecoder`, which reassembles
// complete frames across arbitrary chunk boundaries and enforces the
// configured maximum frame length.

use bytes::{BufMut, Bytes, BytesMut};

/// Default maximum frame length: 4 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Wire overhead of a frame: the 4-byte length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A decoded length prefix exceeded the configured maximum.
    TooLarge { length: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { length, max } => {
                write!(f, "Frame length exceeded native limit ({length} > {max})")
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a payload as a single framed blob: big-endian length prefix + bytes.
/// No bounds check; the producer is trusted.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

/// Reassembles length-prefixed frames from a byte stream.
///
/// Incoming bytes accumulate in a growing buffer with a trailing consumed
/// cursor. The buffer is compacted whenever the cursor passes the halfway
/// mark, bounding per-connection memory to roughly twice the largest
/// in-flight frame plus pending trailing bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    offset: usize,
    max_frame_length: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        let max = if max_frame_length == 0 {
            DEFAULT_MAX_FRAME_LENGTH
        } else {
            max_frame_length
        };
        Self {
            buf: Vec::new(),
            offset: 0,
            max_frame_length: max,
        }
    }

    /// Append freshly read bytes and decode every complete frame into `out`.
    ///
    /// Frames are appended in wire order. A zero-length frame is valid and
    /// yields an empty payload. An oversize length prefix returns an error,
    /// but only after any frames ahead of it were appended, so callers
    /// deliver those before tearing the connection down.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Bytes>) -> Result<(), FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut result = Ok(());

        while self.buf.len() - self.offset >= FRAME_HEADER_LEN {
            let header: [u8; 4] = self.buf[self.offset..self.offset + FRAME_HEADER_LEN]
                .try_into()
                .expect("4-byte slice");
            let length = u32::from_be_bytes(header) as usize;
            if length > self.max_frame_length {
                result = Err(FrameError::TooLarge {
                    length,
                    max: self.max_frame_length,
                });
                break;
            }
            if self.buf.len() - self.offset - FRAME_HEADER_LEN < length {
                // Partial frame, wait for more bytes.
                break;
            }
            let start = self.offset + FRAME_HEADER_LEN;
            out.push(Bytes::copy_from_slice(&self.buf[start..start + length]));
            self.offset += FRAME_HEADER_LEN + length;
        }

        // Compact once the consumed prefix dominates the buffer.
        if self.offset > self.buf.len() / 2 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }

        result
    }

    /// Bytes currently buffered, including the consumed prefix.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Position of the consumed cursor within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
