use mio::{event::Event, Token};
use std::fmt;

/// Owned snapshot of a mio readiness event, safe to move onto a worker
/// thread.
#[derive(Clone, Copy)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_error: bool,
    is_read_closed: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_error", &self.is_error)
            .field("is_read_closed", &self.is_read_closed)
            .finish()
    }
}

impl Readiness {
    /// Readiness that asks the handler to retry everything it has pending.
    pub fn all(token: Token) -> Self {
        Self {
            token,
            is_readable: true,
            is_writable: true,
            is_error: false,
            is_read_closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is_read_closed(&self) -> bool {
        self.is_read_closed
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_error: event.is_error(),
            is_read_closed: event.is_read_closed(),
        }
    }
}
