use std::io::{self, IoSlice, Write};

use crate::arena::Chunk;
use crate::error::{Error, Result};
use crate::protocol::{encode_header, try_read_message, MESSAGE_PREFIX_SIZE};
use crate::token::{ConnectionId, ConnectionToken};

/// The operation an I/O context was last issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    None,
    Accept,
    Connect,
    Send,
    Receive,
}

/// One reusable asynchronous operation slot.
///
/// A context owns its arena chunk for life. While checked out of the pool it
/// carries exactly one in-flight operation; once that operation completes it
/// is cleared and pushed back.
#[derive(Debug)]
pub struct IoContext {
    chunk: Chunk,
    operation: Operation,
    len: usize,
    transferred: usize,
    header: [u8; MESSAGE_PREFIX_SIZE],
    pub(crate) token: ConnectionToken,
}

impl IoContext {
    pub fn new(chunk: Chunk) -> Self {
        let token = ConnectionToken::new(chunk.offset(), chunk.len());
        Self {
            chunk,
            operation: Operation::None,
            len: 0,
            transferred: 0,
            header: [0; MESSAGE_PREFIX_SIZE],
            token,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Logical length of the payload held in the chunk (sends only).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub(crate) fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.chunk
    }

    pub fn token(&self) -> &ConnectionToken {
        &self.token
    }

    /// Marks the context as working on `operation` for `owner`.
    pub(crate) fn begin(&mut self, operation: Operation, owner: ConnectionId) {
        self.operation = operation;
        self.token.attach(owner);
    }

    /// Copies `payload` into the chunk and prepares the length prefix.
    pub(crate) fn load(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.chunk.len() {
            return Err(Error::MessageTooLarge {
                len: payload.len(),
                max: self.chunk.len(),
            });
        }
        self.header = encode_header(payload.len())?;
        self.chunk.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        self.transferred = 0;
        Ok(())
    }

    /// Feeds `src` into the incoming message, leaving unconsumed bytes in it.
    pub(crate) fn decode(&mut self, src: &mut &[u8]) -> Result<bool> {
        try_read_message(src, &mut self.token.incoming)
    }

    /// Runs the first `n` bytes of the chunk through the framer. Returns
    /// whether the message is complete and the bytes past its end.
    pub(crate) fn decode_chunk(&mut self, n: usize) -> Result<(bool, &[u8])> {
        let mut src = &self.chunk.as_slice()[..n];
        let done = try_read_message(&mut src, &mut self.token.incoming)?;
        Ok((done, src))
    }

    /// Bytes of the framed message not yet written: the rest of the prefix
    /// and the rest of the payload.
    fn unsent(&self) -> (&[u8], &[u8]) {
        let header_sent = self.transferred.min(MESSAGE_PREFIX_SIZE);
        let body_sent = self.transferred.saturating_sub(MESSAGE_PREFIX_SIZE);
        (
            &self.header[header_sent..],
            &self.chunk.as_slice()[body_sent..self.len],
        )
    }

    pub fn is_fully_sent(&self) -> bool {
        self.transferred == MESSAGE_PREFIX_SIZE + self.len
    }

    /// Writes as much of the framed message as `writer` accepts.
    ///
    /// Returns `Ok(())` once everything is out. `WouldBlock` is passed through
    /// with the progress kept, so the call can be repeated on the next
    /// writable event.
    pub(crate) fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        while !self.is_fully_sent() {
            let (header, body) = self.unsent();
            let bufs = [IoSlice::new(header), IoSlice::new(body)];
            match writer.write_vectored(&bufs) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.transferred += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Resets everything tied to the last operation before going back to the
    /// pool.
    pub(crate) fn clear(&mut self) {
        self.operation = Operation::None;
        self.len = 0;
        self.transferred = 0;
        self.token.detach();
    }
}
