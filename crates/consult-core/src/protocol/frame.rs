//! Frame reassembly
//!
//! Reply frames arrive over an unreliable byte stream in arbitrary chunks.
//!
//! Frame format:
//! - 1 byte: [`FRAME_START`]
//! - 1 byte: number of data bytes N
//! - N bytes: data, one byte per polled register id

use tracing::{trace, warn};

use super::{ProtocolError, FRAME_HEADER_LEN, FRAME_START};

/// Default bound on buffered bytes that have not yet formed a frame
pub const DEFAULT_MAX_BUFFER_LEN: usize = 1024;

/// A complete reply frame, start marker and length byte included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    generation: u64,
}

impl Frame {
    /// Wrap complete frame bytes, tagged with the layout generation in effect
    pub fn new(bytes: Vec<u8>, generation: u64) -> Self {
        Self { bytes, generation }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Data bytes after the header
    pub fn data(&self) -> &[u8] {
        self.bytes.get(FRAME_HEADER_LEN..).unwrap_or_default()
    }

    /// Byte at a frame offset
    pub fn get(&self, offset: usize) -> Option<u8> {
        self.bytes.get(offset).copied()
    }

    /// Layout generation the frame was received under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Stateful stream reassembler
///
/// Bytes in front of a start marker are noise and are dropped as soon as
/// they are seen. The length byte directly after the marker fixes the
/// frame length; no partial frame is ever emitted.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
    max_len: usize,
    generation: u64,
    overflows: u64,
}

impl FrameAssembler {
    /// Create an assembler holding at most `max_len` unframed bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            expected_len: None,
            max_len,
            generation: 0,
            overflows: 0,
        }
    }

    /// Generation stamped on frames emitted from now on
    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Buffered bytes not yet part of an emitted frame
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Length of the frame currently being assembled, once known
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Times the buffer was reset for exceeding the bound
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Drop all buffered bytes
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
    }

    /// Append a chunk and return every frame it completes
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }

        match self.check_bound() {
            Ok(()) => Ok(frames),
            Err(e) if frames.is_empty() => Err(e),
            Err(e) => {
                warn!("{} (after {} frames)", e, frames.len());
                Ok(frames)
            }
        }
    }

    /// Extract the next complete frame from the buffer, if any
    fn next_frame(&mut self) -> Option<Frame> {
        if self.expected_len.is_none() {
            self.align();
            if self.buffer.len() < FRAME_HEADER_LEN {
                return None;
            }
            let expected = self.buffer[1] as usize + FRAME_HEADER_LEN;
            trace!("Frame start found, expecting {} bytes", expected);
            self.expected_len = Some(expected);
        }

        let expected = self.expected_len?;
        if self.buffer.len() < expected {
            return None;
        }

        let rest = self.buffer.split_off(expected);
        let bytes = std::mem::replace(&mut self.buffer, rest);
        self.expected_len = None;
        Some(Frame::new(bytes, self.generation))
    }

    /// Discard everything in front of the first start marker
    fn align(&mut self) {
        match self.buffer.iter().position(|&b| b == FRAME_START) {
            Some(0) => {}
            Some(pos) => {
                trace!("Discarding {} bytes before frame start", pos);
                self.buffer.drain(..pos);
            }
            None => {
                if !self.buffer.is_empty() {
                    trace!("Discarding {} bytes without frame start", self.buffer.len());
                    self.buffer.clear();
                }
            }
        }
    }

    fn check_bound(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.len() > self.max_len {
            let len = self.buffer.len();
            self.reset();
            self.overflows += 1;
            return Err(ProtocolError::FramingOverflow {
                len,
                max: self.max_len,
            });
        }
        Ok(())
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_LEN)
    }
}
