use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use mio::{
    net::{TcpListener, TcpStream},
    Interest, Token,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    config::EngineConfig,
    context::{IoContext, Operation},
    error::{Error, Result},
    event::Readiness,
    handler::{EventHandler, SharedHandler},
    poll::Registrar,
    pool::ResourcePool,
    queue::{AsyncEvent, EventKind, EventQueue},
    thread_pool::Spawner,
    token::ConnectionId,
};

/// Engine internals every socket holds a reference to.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) contexts: ResourcePool<IoContext>,
    pub(crate) events: EventQueue,
    pub(crate) registrar: Arc<Registrar>,
    pub(crate) spawner: Spawner,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        config: EngineConfig,
        contexts: ResourcePool<IoContext>,
        registrar: Arc<Registrar>,
        spawner: Spawner,
    ) -> Self {
        Self {
            config,
            contexts,
            events: EventQueue::new(),
            registrar,
            spawner,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn borrow_context(&self, operation: Operation, owner: ConnectionId) -> Option<IoContext> {
        let mut ctx = self.contexts.pop()?;
        ctx.begin(operation, owner);
        Some(ctx)
    }

    fn recycle(&self, mut ctx: IoContext) {
        ctx.clear();
        self.contexts.push(ctx);
    }
}

/// Lifecycle of an [`AsyncSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created by [`Engine::socket`](crate::Engine::socket), not yet connected.
    Idle,
    Listening,
    Connecting,
    Open,
    /// Terminal. Every operation fails with [`Error::ConnectionClosed`].
    Closed,
}

enum Socket {
    None,
    Listener(TcpListener),
    Stream(TcpStream),
}

struct IoState {
    state: ConnectionState,
    socket: Socket,
    accept: Option<IoContext>,
    connect: Option<IoContext>,
    receives: VecDeque<IoContext>,
    sends: VecDeque<IoContext>,
    // Bytes read past the end of a message, fed to the next receive.
    carry: BytesMut,
    peer_addr: Option<SocketAddr>,
}

struct Connection {
    id: ConnectionId,
    accepting: AtomicBool,
    io: Mutex<IoState>,
    shared: Arc<Shared>,
}

/// Handle to one non-blocking TCP socket driven by an engine.
///
/// Every operation returns immediately. Completions are reported through the
/// engine's event queue, never through return values; the `Result` only
/// covers what can be checked on the spot (state, payload size, a connect
/// that fails synchronously).
///
/// When no I/O context is free, `accept`, `connect`, `send` and `receive`
/// drop the request and return `Ok(())`. No event will follow, so callers
/// that care must retry.
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Arc<Connection>,
}

impl AsyncSocket {
    fn new(
        shared: Arc<Shared>,
        state: ConnectionState,
        socket: Socket,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let id = ConnectionId::new(shared.registrar.next_token().0 as u64);
        let carry = BytesMut::with_capacity(shared.config.chunk_size);
        Self {
            inner: Arc::new(Connection {
                id,
                accepting: AtomicBool::new(false),
                io: Mutex::new(IoState {
                    state,
                    socket,
                    accept: None,
                    connect: None,
                    receives: VecDeque::new(),
                    sends: VecDeque::new(),
                    carry,
                    peer_addr,
                }),
                shared,
            }),
        }
    }

    pub(crate) fn idle(shared: Arc<Shared>) -> Self {
        Self::new(shared, ConnectionState::Idle, Socket::None, None)
    }

    pub(crate) fn listening(shared: Arc<Shared>, listener: TcpListener) -> Result<Self> {
        let socket = Self::new(
            shared,
            ConnectionState::Listening,
            Socket::Listener(listener),
            None,
        );
        socket.register(Interest::READABLE)?;
        Ok(socket)
    }

    /// Wraps a freshly accepted stream. Dropping it on error closes it.
    fn adopt(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<Self> {
        if shared.config.no_delay {
            stream.set_nodelay(true)?;
        }
        let socket = Self::new(
            shared,
            ConnectionState::Open,
            Socket::Stream(stream),
            Some(addr),
        );
        socket.register(Interest::READABLE | Interest::WRITABLE)?;
        Ok(socket)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.io.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner.io.lock().socket {
            Socket::Listener(listener) => Ok(listener.local_addr()?),
            Socket::Stream(stream) => Ok(stream.local_addr()?),
            Socket::None => Err(Error::NotConnected),
        }
    }

    /// Remote address once the connection is open.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.io.lock().peer_addr
    }

    /// Receive operations issued and not yet completed.
    pub fn pending_receives(&self) -> usize {
        self.inner.io.lock().receives.len()
    }

    /// Send operations issued and not yet fully written.
    pub fn pending_sends(&self) -> usize {
        self.inner.io.lock().sends.len()
    }

    /// Takes the next event from the engine's queue, if any. Events of every
    /// socket of the engine come out of the same queue.
    pub fn try_get_event(&self) -> Option<AsyncEvent> {
        self.inner.shared.events.try_take()
    }

    /// Waits up to `timeout` for the next event of the engine.
    pub fn next_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        self.inner.shared.events.take_timeout(timeout)
    }

    /// Arms one accept on a listening socket.
    ///
    /// At most one accept is outstanding per listener: calling this again
    /// before the previous one completed is a no-op. Completion publishes
    /// [`EventKind::NewConnection`] with the new peer.
    pub fn accept(&self) -> Result<()> {
        self.ensure_running()?;
        {
            let mut io = self.inner.io.lock();
            match io.state {
                ConnectionState::Listening => {}
                ConnectionState::Closed => return Err(Error::ConnectionClosed),
                _ => {
                    return Err(Error::InvalidOperation(
                        "accept requires a listening socket",
                    ))
                }
            }
            if !self.arm_accept(&mut io) {
                return Ok(());
            }
        }
        self.schedule()
    }

    /// Starts connecting an idle socket to `addr`.
    ///
    /// Completion publishes [`EventKind::ConnectionAccepted`]. A connect the
    /// OS rejects immediately is returned as [`Error::Io`] and leaves the
    /// socket idle.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.inner.shared;
        let mut guard = self.inner.io.lock();
        let io = &mut *guard;
        match io.state {
            ConnectionState::Idle => {}
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            ConnectionState::Listening => {
                return Err(Error::InvalidOperation("cannot connect a listening socket"))
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                return Err(Error::InvalidOperation("socket is already connected"))
            }
        }

        let Some(ctx) = shared.borrow_context(Operation::Connect, self.id()) else {
            debug!(conn = %self.id(), "no free I/O context, dropping connect");
            return Ok(());
        };

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                shared.recycle(ctx);
                return Err(e.into());
            }
        };

        io.socket = Socket::Stream(stream);
        if let Err(e) = self.register_locked(io, Interest::READABLE | Interest::WRITABLE) {
            io.socket = Socket::None;
            shared.recycle(ctx);
            return Err(e);
        }
        io.connect = Some(ctx);
        io.state = ConnectionState::Connecting;
        trace!(conn = %self.id(), %addr, "connecting");
        Ok(())
    }

    /// Queues one framed message for sending.
    ///
    /// The payload is copied into a pooled chunk before returning. Payloads
    /// larger than the configured chunk size are rejected. Completion
    /// publishes [`EventKind::DataSent`].
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.inner.shared;
        let max = shared.config.max_message_size();
        if payload.len() > max {
            return Err(Error::MessageTooLarge {
                len: payload.len(),
                max,
            });
        }

        {
            let mut io = self.inner.io.lock();
            Self::ensure_stream(io.state)?;

            let Some(mut ctx) = shared.borrow_context(Operation::Send, self.id()) else {
                debug!(conn = %self.id(), bytes = payload.len(), "no free I/O context, dropping send");
                return Ok(());
            };
            if let Err(e) = ctx.load(payload) {
                shared.recycle(ctx);
                return Err(e);
            }
            io.sends.push_back(ctx);
        }
        self.schedule()
    }

    /// Asks for the next message.
    ///
    /// Each call yields at most one [`EventKind::DataReceived`]. The context
    /// stays with the connection until its message is complete.
    pub fn receive(&self) -> Result<()> {
        self.ensure_running()?;
        let shared = &self.inner.shared;
        {
            let mut io = self.inner.io.lock();
            Self::ensure_stream(io.state)?;

            let Some(ctx) = shared.borrow_context(Operation::Receive, self.id()) else {
                debug!(conn = %self.id(), "no free I/O context, dropping receive");
                return Ok(());
            };
            io.receives.push_back(ctx);
        }
        self.schedule()
    }

    /// Closes the socket and returns every context it holds to the pool.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.io.lock();
        if guard.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.close_locked(&mut guard);
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shared.is_stopped() {
            return Err(Error::EngineStopped);
        }
        Ok(())
    }

    fn ensure_stream(state: ConnectionState) -> Result<()> {
        match state {
            ConnectionState::Connecting | ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            ConnectionState::Idle => Err(Error::NotConnected),
            ConnectionState::Listening => Err(Error::InvalidOperation(
                "a listening socket does not carry data",
            )),
        }
    }

    fn token(&self) -> Token {
        Token(self.inner.id.as_u64() as usize)
    }

    fn register(&self, interest: Interest) -> Result<()> {
        let mut io = self.inner.io.lock();
        self.register_locked(&mut io, interest)
    }

    fn register_locked(&self, io: &mut IoState, interest: Interest) -> Result<()> {
        let registrar = &self.inner.shared.registrar;
        let handler: SharedHandler = Arc::new(self.clone());
        match &mut io.socket {
            Socket::Listener(listener) => registrar.register(listener, self.token(), interest, handler),
            Socket::Stream(stream) => registrar.register(stream, self.token(), interest, handler),
            Socket::None => Err(Error::NotConnected),
        }
    }

    /// Takes the admission gate and an accept context. False when either is
    /// unavailable.
    fn arm_accept(&self, io: &mut IoState) -> bool {
        if self
            .inner
            .accepting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(conn = %self.id(), "accept already outstanding");
            return false;
        }
        match self.inner.shared.borrow_context(Operation::Accept, self.id()) {
            Some(ctx) => {
                io.accept = Some(ctx);
                true
            }
            None => {
                self.inner.accepting.store(false, Ordering::Release);
                debug!(conn = %self.id(), "no free I/O context, dropping accept");
                false
            }
        }
    }

    /// Runs pending operations on a worker thread.
    fn schedule(&self) -> Result<()> {
        let socket = self.clone();
        let token = self.token();
        self.inner
            .shared
            .spawner
            .exec(move || socket.drive(&Readiness::all(token)))
    }

    fn publish(&self, kind: EventKind, peer: AsyncSocket, payload: Option<Bytes>) {
        self.inner
            .shared
            .events
            .publish(AsyncEvent::new(kind, peer, payload));
    }

    /// Makes as much progress as the socket allows on every pending
    /// operation. Socket failures close the connection.
    fn drive(&self, readiness: &Readiness) {
        let mut guard = self.inner.io.lock();
        let io = &mut *guard;
        trace!(conn = %self.id(), ?readiness, state = ?io.state, "driving");

        let result = match io.state {
            ConnectionState::Listening => {
                self.drive_accept(io);
                Ok(())
            }
            ConnectionState::Connecting => match self.drive_connect(io) {
                Ok(()) if io.state == ConnectionState::Open => self
                    .drive_stream(io)
                    .and_then(|()| self.check_hangup(io, readiness)),
                other => other,
            },
            ConnectionState::Open => self
                .drive_stream(io)
                .and_then(|()| self.check_hangup(io, readiness)),
            ConnectionState::Idle | ConnectionState::Closed => Ok(()),
        };

        if let Err(e) = result {
            debug!(conn = %self.id(), error = %e, "closing connection");
            self.close_locked(io);
        }
    }

    fn drive_accept(&self, io: &mut IoState) {
        let shared = &self.inner.shared;
        while io.accept.is_some() {
            let Socket::Listener(listener) = &io.socket else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => {
                    self.finish_accept(io);
                    match Self::adopt(Arc::clone(shared), stream, addr) {
                        Ok(peer) => {
                            debug!(conn = %self.id(), peer = %peer.id(), %addr, "accepted");
                            self.publish(EventKind::NewConnection, peer, None);
                        }
                        Err(e) => {
                            warn!(conn = %self.id(), %addr, error = %e, "failed to set up accepted stream")
                        }
                    }
                    if shared.config.auto_accept {
                        self.arm_accept(io);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn = %self.id(), error = %e, "accept failed");
                    self.finish_accept(io);
                    return;
                }
            }
        }
    }

    fn finish_accept(&self, io: &mut IoState) {
        self.inner.accepting.store(false, Ordering::Release);
        if let Some(ctx) = io.accept.take() {
            self.inner.shared.recycle(ctx);
        }
    }

    fn drive_connect(&self, io: &mut IoState) -> Result<()> {
        let Socket::Stream(stream) = &io.socket else {
            return Err(Error::NotConnected);
        };
        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.inner.shared.config.no_delay {
            stream.set_nodelay(true)?;
        }

        io.state = ConnectionState::Open;
        io.peer_addr = Some(addr);
        if let Some(ctx) = io.connect.take() {
            self.inner.shared.recycle(ctx);
        }
        debug!(conn = %self.id(), %addr, "connected");
        self.publish(EventKind::ConnectionAccepted, self.clone(), None);
        Ok(())
    }

    fn drive_stream(&self, io: &mut IoState) -> Result<()> {
        self.flush_sends(io)?;
        self.fill_receives(io)
    }

    fn flush_sends(&self, io: &mut IoState) -> Result<()> {
        while let Some(ctx) = io.sends.front_mut() {
            let Socket::Stream(stream) = &mut io.socket else {
                return Ok(());
            };
            match ctx.write_to(stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            if let Some(ctx) = io.sends.pop_front() {
                trace!(conn = %self.id(), bytes = ctx.len(), "message sent");
                self.inner.shared.recycle(ctx);
            }
            self.publish(EventKind::DataSent, self.clone(), None);
        }
        Ok(())
    }

    fn fill_receives(&self, io: &mut IoState) -> Result<()> {
        while let Some(ctx) = io.receives.front_mut() {
            if !io.carry.is_empty() {
                let mut src: &[u8] = &io.carry;
                let done = ctx.decode(&mut src)?;
                let consumed = io.carry.len() - src.len();
                io.carry.advance(consumed);
                if done {
                    self.complete_receive(io);
                    continue;
                }
            }

            let Socket::Stream(stream) = &mut io.socket else {
                return Ok(());
            };
            let n = match stream.read(ctx.chunk_mut().as_mut_slice()) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            trace!(conn = %self.id(), bytes = n, "read");

            let (done, rest) = ctx.decode_chunk(n)?;
            if !rest.is_empty() {
                io.carry.extend_from_slice(rest);
            }
            if done {
                self.complete_receive(io);
            }
        }
        Ok(())
    }

    /// Notices a peer that went away while nothing was pending on the
    /// connection, so that sockets nobody holds a handle to still get closed.
    /// Unread bytes keep the connection open until a receive consumes them.
    fn check_hangup(&self, io: &IoState, readiness: &Readiness) -> Result<()> {
        let Socket::Stream(stream) = &io.socket else {
            return Ok(());
        };
        if readiness.is_error() {
            if let Some(e) = stream.take_error()? {
                return Err(e.into());
            }
        }
        if !readiness.is_read_closed()
            || !io.receives.is_empty()
            || !io.sends.is_empty()
            || !io.carry.is_empty()
        {
            return Ok(());
        }
        match stream.peek(&mut [0u8; 1]) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn complete_receive(&self, io: &mut IoState) {
        let Some(ctx) = io.receives.pop_front() else {
            return;
        };
        let payload = Bytes::copy_from_slice(ctx.token().incoming().payload());
        trace!(conn = %self.id(), bytes = payload.len(), "message received");
        self.inner.shared.recycle(ctx);
        self.publish(EventKind::DataReceived, self.clone(), Some(payload));
    }

    fn close_locked(&self, io: &mut IoState) {
        if io.state == ConnectionState::Closed {
            return;
        }
        let shared = &self.inner.shared;

        let token = self.token();
        let deregistered = match &mut io.socket {
            Socket::Listener(listener) => shared.registrar.deregister(listener, token),
            Socket::Stream(stream) => shared.registrar.deregister(stream, token),
            Socket::None => Ok(()),
        };
        if let Err(e) = deregistered {
            trace!(conn = %self.id(), error = %e, "deregister failed");
        }
        io.socket = Socket::None;

        let held = io
            .accept
            .take()
            .into_iter()
            .chain(io.connect.take())
            .chain(io.receives.drain(..))
            .chain(io.sends.drain(..));
        for ctx in held {
            shared.recycle(ctx);
        }
        io.carry.clear();
        self.inner.accepting.store(false, Ordering::Release);
        io.state = ConnectionState::Closed;
        debug!(conn = %self.id(), "closed");

        if shared.config.notify_closed {
            self.publish(EventKind::ConnectionClosed, self.clone(), None);
        }
    }
}

impl EventHandler for AsyncSocket {
    fn handle_event(&self, event: &Readiness) {
        self.drive(event);
    }
}

impl PartialEq for AsyncSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AsyncSocket {}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket").field("id", &self.id()).finish()
    }
}
