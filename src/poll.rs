use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lockfree::map::Map as LockfreeMap;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::Result;
use crate::handler::SharedHandler;

/// Token reserved for the reactor's waker. Socket tokens start at 1.
pub const WAKE_TOKEN: Token = Token(0);

/// Owner of the OS poller. Lives on the reactor thread.
pub struct PollHandle {
    poller: Poll,
    registrar: Arc<Registrar>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)?;
        Ok(PollHandle {
            poller,
            registrar: Arc::new(Registrar {
                registry,
                handlers: LockfreeMap::new(),
                waker,
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            }),
        })
    }

    pub fn registrar(&self) -> Arc<Registrar> {
        Arc::clone(&self.registrar)
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        self.poller.poll(events, timeout)?;
        Ok(events.iter().count())
    }
}

/// Thread-safe side of the poller: registration, handler lookup and wakeups.
pub struct Registrar {
    registry: Registry,
    handlers: LockfreeMap<usize, SharedHandler>,
    waker: Waker,
    next_token: AtomicUsize,
}

impl Registrar {
    /// Hands out a token no other source of this poller uses.
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register<S>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
        handler: SharedHandler,
    ) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.handlers.insert(token.0, handler);
        if let Err(e) = src.register(&self.registry, token, interest) {
            self.handlers.remove(&token.0);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.handlers.remove(&token.0);
        src.deregister(&self.registry)?;
        Ok(())
    }

    pub fn handler(&self, token: Token) -> Option<SharedHandler> {
        self.handlers.get(&token.0).map(|entry| Arc::clone(entry.val()))
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.iter().count()
    }

    /// Drops every registered handler.
    pub fn clear(&self) {
        let tokens: Vec<usize> = self.handlers.iter().map(|entry| *entry.key()).collect();
        for token in tokens {
            self.handlers.remove(&token);
        }
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}
