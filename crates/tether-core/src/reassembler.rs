//! Per-connection frame reassembly.
//!
//! A [`FrameReassembler`] turns the arbitrarily fragmented or coalesced bytes
//! of one stream back into discrete [`Frame`]s. It is driven with the
//! connection's [`ByteBuffer`] each time more bytes are available and
//! consumes at most one frame per call. When a frame completes with bytes
//! still buffered behind it, the caller learns the leftover count and is
//! expected to schedule another pass later instead of looping immediately.
//!
//! # Example
//!
//! ```
//! use tether_core::reassembler::{FrameReassembler, Progress};
//! use tether_core::wire::{encode_frame, ByteBuffer, FrameLimits};
//!
//! let wire = encode_frame("{}", b"xy").unwrap();
//! let (head, tail) = wire.split_at(5);
//!
//! let mut buffer = ByteBuffer::new();
//! let mut reassembler = FrameReassembler::new(FrameLimits::default());
//!
//! buffer.append(head);
//! assert!(matches!(reassembler.process(&mut buffer).unwrap(), Progress::NeedMore));
//!
//! buffer.append(tail);
//! match reassembler.process(&mut buffer).unwrap() {
//!     Progress::Complete { frame, leftover } => {
//!         assert_eq!(frame.text, "{}");
//!         assert_eq!(frame.binary, b"xy");
//!         assert_eq!(leftover, 0);
//!     }
//!     Progress::NeedMore => unreachable!(),
//! }
//! ```

use crate::wire::{ByteBuffer, Frame, FrameHeader, FrameLimits, WireError, HEADER_LEN};

/// Outcome of one reassembly pass.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// The buffered bytes were consumed but no frame is complete yet.
    NeedMore,
    /// A frame completed. `leftover` bytes remain buffered behind it.
    Complete { frame: Frame, leftover: usize },
}

/// A frame whose header has been read but whose payloads are incomplete.
#[derive(Debug)]
struct Partial {
    header: FrameHeader,
    text: Vec<u8>,
    binary: Vec<u8>,
}

impl Partial {
    fn new(header: FrameHeader) -> Self {
        Self {
            header,
            text: Vec::with_capacity(header.string_len as usize),
            binary: Vec::with_capacity(header.binary_len as usize),
        }
    }

    fn text_remaining(&self) -> usize {
        self.header.string_len as usize - self.text.len()
    }

    fn binary_remaining(&self) -> usize {
        self.header.binary_len as usize - self.binary.len()
    }
}

/// Frame reconstruction state for one connection.
#[derive(Debug)]
pub struct FrameReassembler {
    limits: FrameLimits,
    partial: Option<Partial>,
}

impl FrameReassembler {
    /// Create a reassembler enforcing `limits` on every header it reads.
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            partial: None,
        }
    }

    /// Whether a header has been consumed for a frame that is not yet complete.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Consume buffered bytes toward the current frame.
    ///
    /// The header is only consumed once all eight bytes are buffered. Text
    /// bytes are kept raw until the frame completes so that a multi-byte
    /// character split across reads decodes correctly.
    ///
    /// # Errors
    ///
    /// [`WireError::FrameTooLarge`] if a header exceeds the limits and
    /// [`WireError::Utf8`] if a completed text payload is not UTF-8. Either
    /// way the in-progress state is discarded.
    pub fn process(&mut self, buffer: &mut ByteBuffer) -> Result<Progress, WireError> {
        if self.partial.is_none() {
            if buffer.available() < HEADER_LEN {
                return Ok(Progress::NeedMore);
            }
            let header = buffer.read_header()?;
            self.limits.check(&header)?;
            self.partial = Some(Partial::new(header));
        }

        let Some(partial) = self.partial.as_mut() else {
            return Ok(Progress::NeedMore);
        };

        let take = buffer.available().min(partial.text_remaining());
        buffer.read_into(&mut partial.text, take)?;
        if partial.text_remaining() > 0 {
            return Ok(Progress::NeedMore);
        }

        if partial.binary_remaining() > 0 {
            let take = buffer.available().min(partial.binary_remaining());
            buffer.read_into(&mut partial.binary, take)?;
            if partial.binary_remaining() > 0 {
                return Ok(Progress::NeedMore);
            }
        }

        let Some(done) = self.partial.take() else {
            return Ok(Progress::NeedMore);
        };
        let text = String::from_utf8(done.text).map_err(|_| WireError::Utf8)?;
        Ok(Progress::Complete {
            frame: Frame {
                text,
                binary: done.binary,
            },
            leftover: buffer.available(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
