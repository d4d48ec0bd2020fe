use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::connection::AsyncSocket;

/// What a domain event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A listener accepted a new peer; `peer` is the new connection.
    NewConnection,
    /// An outgoing connect completed.
    ConnectionAccepted,
    /// A full message arrived; the payload is attached.
    DataReceived,
    /// A message was completely written to the socket.
    DataSent,
    /// The connection was closed. Only published when
    /// [`EngineConfig::notify_closed`](crate::config::EngineConfig) is set.
    ConnectionClosed,
}

/// An immutable record of a completed socket operation.
pub struct AsyncEvent {
    kind: EventKind,
    peer: AsyncSocket,
    payload: Option<Bytes>,
}

impl AsyncEvent {
    pub fn new(kind: EventKind, peer: AsyncSocket, payload: Option<Bytes>) -> Self {
        Self {
            kind,
            peer,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The connection the event is about.
    pub fn peer(&self) -> &AsyncSocket {
        &self.peer
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn into_parts(self) -> (EventKind, AsyncSocket, Option<Bytes>) {
        (self.kind, self.peer, self.payload)
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("kind", &self.kind)
            .field("peer", &self.peer.id())
            .field("payload_len", &self.payload.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Multi-producer queue of events feeding a single consumer loop.
///
/// Producers are the completion threads; the consumer is the application.
/// Events of unrelated connections may come out in any order.
pub struct EventQueue<E = AsyncEvent> {
    sender: Sender<E>,
    receiver: Receiver<E>,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn publish(&self, event: E) {
        // Both ends live in `self`, so the channel can't be disconnected.
        let _ = self.sender.send(event);
    }

    /// Takes the next event if one is ready.
    pub fn try_take(&self) -> Option<E> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn take_timeout(&self, timeout: Duration) -> Option<E> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Discards every queued event, returning how many were dropped.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
