use std::fmt;

use crate::protocol::PartialMessage;

/// Unique identifier for connections.
///
/// Every socket created by an engine, listening or not, gets one. It is the
/// value of the socket's reactor token, so it is unique among live sockets of
/// the same engine and stays constant for the socket's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-connection state attached to a pooled I/O context.
///
/// A token belongs to exactly one context and is only touched by whoever
/// holds that context, so it needs no synchronization of its own.
#[derive(Debug)]
pub struct ConnectionToken {
    buffer_offset: usize,
    owner: Option<ConnectionId>,
    pub(crate) incoming: PartialMessage,
}

impl ConnectionToken {
    pub fn new(buffer_offset: usize, max_message_size: usize) -> Self {
        Self {
            buffer_offset,
            owner: None,
            incoming: PartialMessage::new(max_message_size),
        }
    }

    /// Offset of the context's chunk inside the shared arena.
    pub fn buffer_offset(&self) -> usize {
        self.buffer_offset
    }

    /// The connection the context is currently working for.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn incoming(&self) -> &PartialMessage {
        &self.incoming
    }

    pub(crate) fn attach(&mut self, owner: ConnectionId) {
        self.owner = Some(owner);
    }

    /// Drops every connection-specific bit of state.
    pub(crate) fn detach(&mut self) {
        self.owner = None;
        self.incoming.reset();
    }
}
