//! Byte-level framing shared by the host and the device.
//!
//! Every message travelling in either direction is a single frame:
//!
//! # Frame Structure (Little Endian)
//!
//! ```text
//! [0:4)                            string payload length (u32 LE)
//! [4:8)                            binary payload length (u32 LE)
//! [8 : 8+string_len)               UTF-8 text (JSON envelope)
//! [8+string_len : +binary_len)     raw binary payload (may be empty)
//! ```
//!
//! The two lengths are always read together as an 8-byte header before any
//! payload bytes are consumed.
//!
//! # Example
//!
//! ```
//! use tether_core::wire::{encode_frame, FrameHeader, HEADER_LEN};
//!
//! let wire = encode_frame(r#"{"id":"1"}"#, &[1, 2, 3]).unwrap();
//! let header = FrameHeader::decode(wire[..HEADER_LEN].try_into().unwrap());
//! assert_eq!(header.string_len, 10);
//! assert_eq!(header.binary_len, 3);
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Once the consumed prefix of a [`ByteBuffer`] grows past this many bytes it
/// is discarded on the next append.
const COMPACT_THRESHOLD: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum WireError {
    /// Fewer bytes are buffered than the read requires.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData { need: usize, have: usize },

    /// A payload does not fit in the 32-bit length field.
    #[error("payload of {0} bytes exceeds the frame length limit")]
    PayloadTooLarge(usize),

    /// A header declared a payload larger than the configured [`FrameLimits`].
    #[error("frame declares {declared} bytes of {part} payload, limit is {limit}")]
    FrameTooLarge {
        part: &'static str,
        declared: usize,
        limit: usize,
    },

    /// The string payload is not valid UTF-8.
    #[error("invalid UTF-8 in string payload")]
    Utf8,

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The decoded 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the UTF-8 text payload.
    pub string_len: u32,
    /// Length of the raw binary payload.
    pub binary_len: u32,
}

impl FrameHeader {
    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = *bytes;
        Self {
            string_len: u32::from_le_bytes([a, b, c, d]),
            binary_len: u32::from_le_bytes([e, f, g, h]),
        }
    }

    /// Encode the header into its wire representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.string_len.to_le_bytes());
        out[4..].copy_from_slice(&self.binary_len.to_le_bytes());
        out
    }
}

/// Upper bounds accepted for a single inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest accepted string payload.
    pub max_string_len: usize,
    /// Largest accepted binary payload.
    pub max_binary_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_string_len: 16 * 1024 * 1024,
            max_binary_len: 64 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    /// Reject a header whose declared lengths exceed these limits.
    pub fn check(&self, header: &FrameHeader) -> Result<(), WireError> {
        let string_len = header.string_len as usize;
        if string_len > self.max_string_len {
            return Err(WireError::FrameTooLarge {
                part: "string",
                declared: string_len,
                limit: self.max_string_len,
            });
        }
        let binary_len = header.binary_len as usize;
        if binary_len > self.max_binary_len {
            return Err(WireError::FrameTooLarge {
                part: "binary",
                declared: binary_len,
                limit: self.max_binary_len,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One complete wire unit: text envelope plus optional binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// The decoded text payload.
    pub text: String,
    /// The raw binary payload (empty when the frame carried none).
    pub binary: Vec<u8>,
}

// ---------------------------------------------------------------------------
// ByteBuffer (read side)
// ---------------------------------------------------------------------------

/// An owned, growable byte buffer with a read cursor.
///
/// Incoming socket bytes are appended at the back; framing code consumes
/// from the front through the bounds-checked `read_*` methods. Consumed
/// bytes are reclaimed lazily.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        } else if self.pos >= COMPACT_THRESHOLD {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn available(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn require(&self, need: usize) -> Result<(), WireError> {
        let have = self.available();
        if have < need {
            return Err(WireError::InsufficientData { need, have });
        }
        Ok(())
    }

    /// Consume a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> Result<u32, WireError> {
        self.require(4)?;
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .map_err(|_| WireError::InsufficientData { need: 4, have: 0 })?;
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Consume a complete frame header.
    pub fn read_header(&mut self) -> Result<FrameHeader, WireError> {
        self.require(HEADER_LEN)?;
        let string_len = self.read_u32_le()?;
        let binary_len = self.read_u32_le()?;
        Ok(FrameHeader {
            string_len,
            binary_len,
        })
    }

    /// Consume exactly `n` bytes, appending them to `dst`.
    pub fn read_into(&mut self, dst: &mut Vec<u8>, n: usize) -> Result<(), WireError> {
        self.require(n)?;
        dst.extend_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FrameWriter (write side)
// ---------------------------------------------------------------------------

/// Sequential writer producing an owned byte buffer.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    /// Create a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append a little-endian `u32`.
    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Return the written bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn checked_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge(len))
}

/// Encode a frame from its text and binary parts into one contiguous buffer.
///
/// The whole frame is assembled before anything is written so that two
/// frames queued on the same connection can never interleave.
pub fn encode_frame(text: &str, binary: &[u8]) -> Result<Vec<u8>, WireError> {
    let string_len = checked_len(text.len())?;
    let binary_len = checked_len(binary.len())?;

    let mut writer = FrameWriter::with_capacity(HEADER_LEN + text.len() + binary.len());
    writer.write_u32_le(string_len);
    writer.write_u32_le(binary_len);
    writer.write_bytes(text.as_bytes());
    writer.write_bytes(binary);
    Ok(writer.finish())
}

/// Read one complete frame from an async stream.
///
/// Reads the 8-byte header, then exactly the declared number of text and
/// binary bytes. Used by the host side, where a dedicated task owns the read
/// half of each connection.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::decode(&header);
    limits.check(&header)?;

    let mut text = vec![0u8; header.string_len as usize];
    reader.read_exact(&mut text).await?;
    let mut binary = vec![0u8; header.binary_len as usize];
    reader.read_exact(&mut binary).await?;

    let text = String::from_utf8(text).map_err(|_| WireError::Utf8)?;
    Ok(Frame { text, binary })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wire_format() {
        let header = FrameHeader {
            string_len: 0x0102_0304,
            binary_len: 5,
        };
        assert_eq!(header.encode(), [0x04, 0x03, 0x02, 0x01, 5, 0, 0, 0]);
        assert_eq!(FrameHeader::decode(&header.encode()), header);
    }

    #[test]
    fn encode_frame_layout() {
        let wire = encode_frame("abc", &[9, 8]).unwrap();
        assert_eq!(&wire[..4], &3u32.to_le_bytes());
        assert_eq!(&wire[4..8], &2u32.to_le_bytes());
        assert_eq!(&wire[8..11], b"abc");
        assert_eq!(&wire[11..], &[9, 8]);
    }

    #[test]
    fn encode_frame_without_binary() {
        let wire = encode_frame("{}", &[]).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 2);
        assert_eq!(&wire[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn buffer_reads_are_bounds_checked() {
        let mut buf = ByteBuffer::new();
        buf.append(&[1, 0, 0]);
        match buf.read_u32_le() {
            Err(WireError::InsufficientData { need, have }) => {
                assert_eq!(need, 4);
                assert_eq!(have, 3);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
        // Nothing was consumed by the failed read.
        assert_eq!(buf.available(), 3);
        buf.append(&[0]);
        assert_eq!(buf.read_u32_le().unwrap(), 1);
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn buffer_read_into_appends() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello world");
        let mut dst = b">".to_vec();
        buf.read_into(&mut dst, 5).unwrap();
        assert_eq!(dst, b">hello");
        assert_eq!(buf.available(), 6);
    }

    #[test]
    fn buffer_header_requires_all_eight_bytes() {
        let mut buf = ByteBuffer::new();
        buf.append(&[2, 0, 0, 0, 0]);
        assert!(buf.read_header().is_err());
        assert_eq!(buf.available(), 5);
        buf.append(&[0, 0, 0]);
        let header = buf.read_header().unwrap();
        assert_eq!(header.string_len, 2);
        assert_eq!(header.binary_len, 0);
    }

    #[test]
    fn buffer_compacts_after_full_consumption() {
        let mut buf = ByteBuffer::new();
        buf.append(&[0u8; 16]);
        let mut sink = Vec::new();
        buf.read_into(&mut sink, 16).unwrap();
        buf.append(&[7]);
        assert_eq!(buf.available(), 1);
        assert_eq!(buf.data.len(), 1);
    }

    #[test]
    fn limits_reject_oversized_header() {
        let limits = FrameLimits {
            max_string_len: 10,
            max_binary_len: 10,
        };
        let ok = FrameHeader {
            string_len: 10,
            binary_len: 0,
        };
        assert!(limits.check(&ok).is_ok());
        let too_big = FrameHeader {
            string_len: 1,
            binary_len: 11,
        };
        assert!(matches!(
            limits.check(&too_big),
            Err(WireError::FrameTooLarge { part: "binary", .. })
        ));
    }

    #[tokio::test]
    async fn read_frame_from_stream() {
        let wire = encode_frame("{\"id\":\"x\"}", &[1, 2, 3]).unwrap();
        let mut reader = &wire[..];
        let frame = read_frame(&mut reader, &FrameLimits::default()).await.unwrap();
        assert_eq!(frame.text, "{\"id\":\"x\"}");
        assert_eq!(frame.binary, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_frame_truncated_stream_is_io_error() {
        let wire = encode_frame("abcdef", &[]).unwrap();
        let mut reader = &wire[..10];
        let result = read_frame(&mut reader, &FrameLimits::default()).await;
        assert!(matches!(result, Err(WireError::Io(_))));
    }
}
