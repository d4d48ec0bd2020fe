use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::Events;
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    event::Readiness,
    poll::{PollHandle, Registrar, WAKE_TOKEN},
    thread_pool::Spawner,
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 150;

/// Polls the OS for readiness and hands each event to the worker pool,
/// where the registered handler completes whatever operation was waiting.
pub struct Reactor {
    poll_handle: PollHandle,
    events: Events,
    spawner: Spawner,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
}

/// Stops a running [`Reactor`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    registrar: Arc<Registrar>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.registrar.wake() {
            debug!(error = %e, "failed to wake reactor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout: Duration, spawner: Spawner) -> Result<Self> {
        Ok(Self {
            poll_handle: PollHandle::new()?,
            events: Events::with_capacity(events_capacity),
            spawner,
            running: Arc::new(AtomicBool::new(true)),
            poll_timeout,
        })
    }

    pub fn registrar(&self) -> Arc<Registrar> {
        self.poll_handle.registrar()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            registrar: self.poll_handle.registrar(),
        }
    }

    /// Runs until [`ShutdownHandle::shutdown`] is called.
    ///
    /// A poll interrupted by a signal is retried. Any other poll failure
    /// ends the loop and is returned.
    pub fn run(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            match self
                .poll_handle
                .poll(&mut self.events, Some(self.poll_timeout))
            {
                Ok(_) => {}
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("poll interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch_event(Readiness::from(event))?;
            }
        }
        debug!("reactor stopped");
        Ok(())
    }

    pub fn dispatch_event(&self, event: Readiness) -> Result<()> {
        let Some(handler) = self.poll_handle.registrar().handler(event.token()) else {
            trace!(token = event.token().0, "event for unregistered token");
            return Ok(());
        };

        self.spawner.exec(move || handler.handle_event(&event))
    }
}
