//! # Mill-Socket
//! A low-allocation asynchronous TCP socket engine built on top of [`mio`].
//!
//! Mill-Socket turns partially delivered byte streams on many concurrent
//! connections into discrete, length-prefixed messages. Everything an I/O
//! operation needs is allocated once at startup: a fixed pool of I/O
//! contexts, each bound for life to one chunk of a single shared arena.
//! Operations borrow a context, complete on a worker thread and give it back.
//! Completions are published as events on a queue the application drains.
//!
//! ## Features
//! - **No per-operation allocation**: contexts and buffers are pooled
//! - **Streaming framer**: messages survive any fragmentation, down to one byte per read
//! - **Backpressure by design**: an exhausted pool drops the request instead of queueing it
//! - **Runtime-agnostic**: no async runtime, a reactor thread and a worker pool
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │   Engine    │───▶│   Reactor    │───▶│ PollHandle  │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!        │                   │ readiness
//!        ▼                   ▼
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ResourcePool │◀──▶│ AsyncSocket  │───▶│ EventQueue  │
//! │ (IoContext) │    │ (on workers) │    │             │
//! └─────────────┘    └──────────────┘    └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_socket::{Engine, EngineConfig, EventKind};
//! use std::time::Duration;
//!
//! fn main() -> mill_socket::error::Result<()> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!     let listener = engine.bind("tcp://127.0.0.1:5555")?;
//!
//!     loop {
//!         listener.accept()?;
//!         let Some(event) = engine.next_event(Duration::from_millis(100)) else {
//!             continue;
//!         };
//!         match event.kind() {
//!             EventKind::NewConnection => event.peer().receive()?,
//!             EventKind::DataReceived => {
//!                 event.peer().send(b"pong")?;
//!                 event.peer().receive()?;
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! - [`Engine`]: Owns the arena, the context pool, the reactor and the workers
//! - [`AsyncSocket`]: Non-blocking accept, connect, send and receive
//! - [`protocol`]: The length-prefixed wire format and its incremental decoder
//! - [`net::patterns`]: Ready-made request/reply loops
//! - [`error`]: Error types and result handling

use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{Builder, JoinHandle},
    time::Duration,
};

use tracing::{debug, info, warn};

pub mod arena;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod poll;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod reactor;
pub mod thread_pool;
pub mod token;
mod utils;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use connection::{AsyncSocket, ConnectionState};
pub use handler::EventHandler;
pub use queue::{AsyncEvent, EventKind, EventQueue};
pub use token::ConnectionId;

use crate::{
    arena::SharedArena,
    connection::Shared,
    context::IoContext,
    error::{Error, Result},
    net::address::Address,
    pool::ResourcePool,
    reactor::{Reactor, ShutdownHandle},
    thread_pool::ThreadPool,
};

/// A convenient prelude module that re-exports commonly used types.
///
/// ```rust
/// use mill_socket::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::connection::{AsyncSocket, ConnectionState};
    pub use crate::error::{Error, Result};
    pub use crate::net::patterns::{Replier, Requester, Router};
    pub use crate::queue::{AsyncEvent, EventKind};
    pub use crate::Engine;
}

/// The socket engine.
///
/// Creating an engine reserves all of its memory: `pool_size` I/O contexts
/// backed by one `pool_size * chunk_size` arena. It then starts one reactor
/// thread and `workers` completion threads, which run until the engine is
/// dropped or [`shutdown`](Self::shutdown) is called.
///
/// Every socket created by the engine publishes into the same event queue.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_socket::{Engine, EngineConfig, EventKind};
/// use std::time::Duration;
///
/// let engine = Engine::new(EngineConfig::builder().pool_size(16).build())?;
/// let client = engine.socket();
/// client.connect("127.0.0.1:5555".parse().unwrap())?;
///
/// while let Some(event) = engine.next_event(Duration::from_secs(1)) {
///     if event.kind() == EventKind::ConnectionAccepted {
///         event.peer().send(b"ping")?;
///     }
/// }
/// # Ok::<(), mill_socket::error::Error>(())
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    pool: Option<ThreadPool>,
    reactor_thread: Option<JoinHandle<()>>,
    shutdown: ShutdownHandle,
}

impl Engine {
    /// Creates an engine and starts its threads.
    ///
    /// ## Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The arena cannot back every context (a sizing misconfiguration)
    /// - The poller or one of the threads cannot be created
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let arena = SharedArena::new(config.chunk_size, config.pool_size);
        let mut contexts = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            contexts.push(IoContext::new(arena.assign_buffer()?));
        }
        let contexts = ResourcePool::from_items(contexts);

        let pool = ThreadPool::new(config.workers)?;
        let mut reactor = Reactor::new(
            config.events_capacity,
            config.poll_timeout,
            pool.spawner(),
        )?;
        let shutdown = reactor.shutdown_handle();
        let shared = Arc::new(Shared::new(
            config,
            contexts,
            reactor.registrar(),
            pool.spawner(),
        ));

        let reactor_shared = Arc::clone(&shared);
        let reactor_thread = Builder::new()
            .name("mill-socket-reactor".into())
            .spawn(move || {
                if let Err(e) = reactor.run() {
                    // Nothing completes without the reactor.
                    tracing::error!(error = %e, "reactor failed, stopping engine");
                    reactor_shared.stop();
                }
            })?;

        info!(
            contexts = shared.config.pool_size,
            chunk_size = shared.config.chunk_size,
            workers = pool.workers_len(),
            "engine started"
        );

        Ok(Self {
            shared,
            pool: Some(pool),
            reactor_thread: Some(reactor_thread),
            shutdown,
        })
    }

    /// Binds a listening socket to `addr`.
    ///
    /// With [`EngineConfig::auto_accept`] the first accept is armed right
    /// away; otherwise call [`AsyncSocket::accept`].
    pub fn listen(&self, addr: SocketAddr) -> Result<AsyncSocket> {
        self.ensure_running()?;
        let listener = mio::net::TcpListener::bind(addr)?;
        let socket = AsyncSocket::listening(Arc::clone(&self.shared), listener)?;
        debug!(conn = %socket.id(), %addr, "listening");
        if self.shared.config.auto_accept {
            socket.accept()?;
        }
        Ok(socket)
    }

    /// Binds a listening socket to a `tcp://host:port` address.
    pub fn bind(&self, address: &str) -> Result<AsyncSocket> {
        let address: Address = address.parse()?;
        self.listen(address.resolve()?)
    }

    /// Creates an idle socket, ready for [`AsyncSocket::connect`].
    pub fn socket(&self) -> AsyncSocket {
        AsyncSocket::idle(Arc::clone(&self.shared))
    }

    /// Takes the next event if one is ready.
    pub fn try_get_event(&self) -> Option<AsyncEvent> {
        self.shared.events.try_take()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        self.shared.events.take_timeout(timeout)
    }

    /// I/O contexts currently free in the pool.
    pub fn available_contexts(&self) -> usize {
        self.shared.contexts.available()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        !self.shared.is_stopped()
    }

    /// Stops the reactor and the workers.
    ///
    /// Sockets stay usable as handles but every operation on them fails
    /// with [`Error::EngineStopped`]. Calling this twice is harmless.
    pub fn shutdown(&mut self) {
        if self.shared.is_stopped() && self.reactor_thread.is_none() {
            return;
        }
        self.shared.stop();
        self.shutdown.shutdown();
        if let Some(handle) = self.reactor_thread.take() {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        // Joining the workers runs whatever completions were already queued.
        drop(self.pool.take());

        // Registered sockets and queued events hold handles back to the
        // engine internals.
        self.shared.registrar.clear();
        let dropped = self.shared.events.drain();
        debug!(dropped_events = dropped, "engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(Error::EngineStopped);
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
