//! Length-prefixed message framing.
//!
//! On the wire every message is a 4-byte big-endian length followed by that
//! many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | payload: len bytes        |
//! +----------------+---------------------------+
//! ```
//!
//! The decoder is incremental. A [`PartialMessage`] keeps the header and body
//! [`Frame`]s filled so far, and [`try_read_message`] can be fed any slice of
//! bytes, down to a single byte at a time, until the message is complete.

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const MESSAGE_PREFIX_SIZE: usize = 4;

/// Default upper bound of a message body. Equal to the default arena chunk
/// size so one chunk always holds one body.
pub const MESSAGE_MAX_SIZE: usize = 4096;

/// One length-delimited segment of a message.
#[derive(Debug)]
pub struct Frame {
    storage: Vec<u8>,
    bytes_expected: usize,
    bytes_received: usize,
}

impl Frame {
    fn new(capacity: usize, bytes_expected: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            bytes_expected,
            bytes_received: 0,
        }
    }

    pub fn bytes_expected(&self) -> usize {
        self.bytes_expected
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Bytes still missing before the frame is complete.
    pub fn remaining(&self) -> usize {
        self.bytes_expected - self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.bytes_expected
    }

    /// The bytes received so far.
    pub fn bytes(&self) -> &[u8] {
        &self.storage[..self.bytes_received]
    }

    /// Copies `min(src.len(), remaining)` bytes from the front of `src` into
    /// the frame and advances `src` past them.
    fn fill(&mut self, src: &mut &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        let start = self.bytes_received;
        self.storage[start..start + n].copy_from_slice(&src[..n]);
        self.bytes_received += n;
        *src = &src[n..];
        n
    }

    fn reset(&mut self, bytes_expected: usize) {
        debug_assert!(bytes_expected <= self.storage.len());
        self.bytes_expected = bytes_expected;
        self.bytes_received = 0;
    }
}

/// A message being reassembled: its header frame and its body frame.
#[derive(Debug)]
pub struct PartialMessage {
    header: Frame,
    body: Frame,
    max_size: usize,
}

impl PartialMessage {
    /// Creates an empty message able to hold a body of up to `max_size` bytes.
    /// The body storage is allocated once here and reused for every message.
    pub fn new(max_size: usize) -> Self {
        Self {
            header: Frame::new(MESSAGE_PREFIX_SIZE, MESSAGE_PREFIX_SIZE),
            body: Frame::new(max_size, 0),
            max_size,
        }
    }

    pub fn header(&self) -> &Frame {
        &self.header
    }

    pub fn body(&self) -> &Frame {
        &self.body
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The body of a completed message.
    pub fn payload(&self) -> &[u8] {
        self.body.bytes()
    }

    /// True when no byte of the current message has been received.
    pub fn is_empty(&self) -> bool {
        self.header.bytes_received == 0
    }

    pub fn is_complete(&self) -> bool {
        self.header.is_complete() && self.body.is_complete()
    }

    /// Forgets the current message. Called once a completed message has been
    /// handed off, or when the owning context is recycled.
    pub fn reset(&mut self) {
        self.header.reset(MESSAGE_PREFIX_SIZE);
        self.body.reset(0);
    }
}

/// Feeds bytes from the front of `src` into `partial`.
///
/// Returns `Ok(true)` once header and body are both complete; any bytes past
/// the end of the message are left in `src`. Returns `Ok(false)` when `src`
/// has been fully consumed and the message is still partial. A length prefix
/// above `partial.max_size()` is an error.
///
/// A completed message stays in `partial` until [`PartialMessage::reset`].
pub fn try_read_message(src: &mut &[u8], partial: &mut PartialMessage) -> Result<bool> {
    if partial.is_complete() {
        return Ok(true);
    }
    if !partial.header.is_complete() && !try_read_header(src, partial)? {
        return Ok(false);
    }
    Ok(try_read_body(src, partial))
}

/// Fills the header frame. Once its 4 bytes are in, decodes the body length
/// and arms the body frame for it.
pub fn try_read_header(src: &mut &[u8], partial: &mut PartialMessage) -> Result<bool> {
    partial.header.fill(src);
    if !partial.header.is_complete() {
        return Ok(false);
    }

    let mut prefix = [0u8; MESSAGE_PREFIX_SIZE];
    prefix.copy_from_slice(partial.header.bytes());
    let len = u32::from_be_bytes(prefix) as usize;
    if len > partial.max_size {
        return Err(Error::MessageTooLarge {
            len,
            max: partial.max_size,
        });
    }
    partial.body.reset(len);
    Ok(true)
}

/// Fills the body frame, continuing from any previous partial fill.
pub fn try_read_body(src: &mut &[u8], partial: &mut PartialMessage) -> bool {
    partial.body.fill(src);
    partial.body.is_complete()
}

/// Encodes the length prefix for a payload of `len` bytes.
pub fn encode_header(len: usize) -> Result<[u8; MESSAGE_PREFIX_SIZE]> {
    let len32 = u32::try_from(len).map_err(|_| Error::MessageTooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    Ok(len32.to_be_bytes())
}

/// Encodes a full message: prefix followed by the payload.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let header = encode_header(payload.len())?;
    let mut out = Vec::with_capacity(MESSAGE_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}
