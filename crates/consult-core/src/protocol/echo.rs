//! Echo and offset resolution
//!
//! The Consult line is half-duplex: every byte the host sends is echoed
//! back, except that [`POLL_PREFIX`] comes back as [`REPLY_MARKER`].
//! Reply frames then carry one data byte per polled id, in request order.
//!
//! [`ReplyLayout::resolve`] works out, once per selection, what the echo
//! looks like and where every register's value sits inside a reply frame.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::request::{Request, RequestSelection};
use super::{FRAME_HEADER_LEN, POLL_PREFIX, REPLY_MARKER};

/// Position of a register byte inside a reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOffset {
    /// Byte index from the start of the frame
    At(usize),
    /// The id does not occur in the reply
    NotFound,
}

impl ByteOffset {
    pub fn index(&self) -> Option<usize> {
        match self {
            ByteOffset::At(index) => Some(*index),
            ByteOffset::NotFound => None,
        }
    }
}

/// Register id to reply frame offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: BTreeMap<u8, ByteOffset>,
}

impl OffsetTable {
    /// Offset of a register id (MSB or LSB id)
    pub fn get(&self, id: u8) -> ByteOffset {
        self.offsets.get(&id).copied().unwrap_or(ByteOffset::NotFound)
    }

    /// Resolved entries, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = (u8, ByteOffset)> + '_ {
        self.offsets.iter().map(|(id, offset)| (*id, *offset))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Everything derived from one selection: request, echo and offsets
///
/// Immutable once built. A new selection produces a new layout with a
/// higher generation, so frames decoded against an older layout can be
/// recognised and dropped.
#[derive(Debug, Clone)]
pub struct ReplyLayout {
    generation: u64,
    selection: RequestSelection,
    request: Request,
    expected_echo: Vec<u8>,
    offsets: OffsetTable,
    expected_reply_length: usize,
}

impl ReplyLayout {
    /// Resolve request, echo and offsets for a selection
    pub fn resolve(selection: RequestSelection, generation: u64) -> Self {
        let request = Request::build(&selection);
        let bytes = request.as_bytes();

        let expected_echo: Vec<u8> = bytes
            .iter()
            .map(|&b| if b == POLL_PREFIX { REPLY_MARKER } else { b })
            .collect();

        let skeleton: Vec<u8> = bytes.iter().copied().filter(|&b| b != POLL_PREFIX).collect();

        let mut offsets = BTreeMap::new();
        for id in selection.registers().iter().flat_map(|r| r.poll_ids()) {
            let offset = match skeleton.iter().position(|&b| b == id) {
                Some(index) => ByteOffset::At(index + FRAME_HEADER_LEN),
                None => ByteOffset::NotFound,
            };
            offsets.insert(id, offset);
        }

        // The echo of the terminator is not part of the reply
        let expected_reply_length = bytes.len() - 1;

        debug!(
            "Resolved layout gen {}: request {:02x?}, {} offsets, reply length {}",
            generation,
            bytes,
            offsets.len(),
            expected_reply_length
        );

        Self {
            generation,
            selection,
            request,
            expected_echo,
            offsets: OffsetTable { offsets },
            expected_reply_length,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn selection(&self) -> &RequestSelection {
        &self.selection
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Request bytes as they come back over the wire
    pub fn expected_echo(&self) -> &[u8] {
        &self.expected_echo
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    /// Number of echoed bytes preceding the first reply frame
    pub fn expected_reply_length(&self) -> usize {
        self.expected_reply_length
    }

    /// Echo bytes the ECU sends back before its first frame
    pub fn echo_prefix(&self) -> &[u8] {
        &self.expected_echo[..self.expected_reply_length]
    }
}

/// Strips the wire echo of the last request from the incoming stream
///
/// Matches byte by byte so the echo may be split across any number of
/// chunks. The first byte that differs ends matching; it and everything
/// after it is passed through.
#[derive(Debug, Default)]
pub struct EchoFilter {
    expected: Vec<u8>,
    matched: usize,
    mismatches: u64,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `echo` at the head of the stream
    pub fn arm(&mut self, echo: &[u8]) {
        self.expected.clear();
        self.expected.extend_from_slice(echo);
        self.matched = 0;
    }

    /// Stop expecting an echo
    pub fn clear(&mut self) {
        self.expected.clear();
        self.matched = 0;
    }

    /// Whether echo bytes are still outstanding
    pub fn is_armed(&self) -> bool {
        self.matched < self.expected.len()
    }

    /// Number of echoes that did not match
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    /// Consume echo bytes from the head of `chunk`, returning the rest
    pub fn filter<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let mut consumed = 0;
        while self.is_armed() && consumed < chunk.len() {
            let byte = chunk[consumed];
            let want = self.expected[self.matched];
            if byte != want {
                warn!(
                    "Echo mismatch at byte {}: expected {:#04x}, got {:#04x}",
                    self.matched, want, byte
                );
                self.mismatches += 1;
                self.clear();
                break;
            }
            self.matched += 1;
            consumed += 1;
        }
        if !self.expected.is_empty() && !self.is_armed() {
            debug!("Echo of {} bytes confirmed", self.expected.len());
            self.clear();
        }
        &chunk[consumed..]
    }
}
