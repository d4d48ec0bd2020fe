//! Request/reply over the engine.
//!
//! A [`Replier`] listens, accepts every client and answers each message it
//! receives. A [`Requester`] connects to one replier and turns "send, then
//! wait for the answer" into a blocking call. A [`Router`] lets a replier
//! pick the answering handler by the tag a request starts with.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    connection::AsyncSocket,
    error::{Error, Result},
    net::address::Address,
    queue::EventKind,
    Engine,
};

/// How long consumer loops wait on the queue before re-checking their state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stops a running [`Replier`] from another thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The reply side of the request/reply pattern.
pub struct Replier {
    engine: Engine,
    listener: AsyncSocket,
    stop: StopHandle,
}

impl Replier {
    /// Starts an engine and listens on `address` (`tcp://host:port`).
    pub fn bind(address: &str, config: EngineConfig) -> Result<Self> {
        let engine = Engine::new(config)?;
        let listener = engine.bind(address)?;
        info!(address, "replier listening");
        Ok(Self {
            engine,
            listener,
            stop: StopHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Serves clients until the [`StopHandle`] fires.
    ///
    /// `reply` gets every received message; whatever it returns is sent back
    /// to the same peer. Returning `None` sends nothing. Failures on a single
    /// peer are logged and do not stop the loop.
    pub fn run<F>(&self, mut reply: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>>,
    {
        while !self.stop.is_stopped() {
            self.listener.accept()?;

            let Some(event) = self.engine.next_event(POLL_INTERVAL) else {
                continue;
            };
            let (kind, peer, payload) = event.into_parts();
            let outcome = match kind {
                EventKind::NewConnection => peer.receive(),
                EventKind::DataReceived => {
                    let request = payload.unwrap_or_default();
                    Self::answer(&peer, reply(&request[..])).and_then(|_| peer.receive())
                }
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                debug!(peer = %peer.id(), error = %e, "dropping peer");
            }
        }
        Ok(())
    }

    /// Serves clients with `router` until the [`StopHandle`] fires.
    pub fn serve(&self, mut router: Router) -> Result<()> {
        self.run(|request| router.dispatch(request))
    }

    fn answer(peer: &AsyncSocket, response: Option<Vec<u8>>) -> Result<()> {
        let Some(response) = response else {
            return Ok(());
        };
        match peer.send(&response) {
            Err(Error::MessageTooLarge { len, max }) => {
                warn!(peer = %peer.id(), len, max, "reply too large, not sent");
                Ok(())
            }
            other => other,
        }
    }
}

type Route = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Routes requests to handlers by tag.
///
/// A request is a tag, optionally followed by a single space and a body.
/// The handler mapped to the tag gets the body. Requests with an unknown tag
/// get no reply.
#[derive(Default)]
pub struct Router {
    routes: HashMap<Vec<u8>, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `tag` to `handler`, replacing any earlier handler for it.
    pub fn map<F>(mut self, tag: &str, handler: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.routes.insert(tag.as_bytes().to_vec(), Box::new(handler));
        self
    }

    pub fn dispatch(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let (tag, body) = match request.iter().position(|&b| b == b' ') {
            Some(i) => (&request[..i], &request[i + 1..]),
            None => (request, &[][..]),
        };
        match self.routes.get_mut(tag) {
            Some(handler) => handler(body),
            None => {
                debug!(tag = %String::from_utf8_lossy(tag), "no route for request");
                None
            }
        }
    }
}

/// The request side of the request/reply pattern.
///
/// One request is in flight at a time: [`request`](Self::request) blocks the
/// caller until the reply arrives or the timeout elapses. Replies are matched
/// to requests in order, so a reply that shows up after its request timed
/// out is discarded instead of answering the next one.
pub struct Requester {
    engine: Engine,
    socket: AsyncSocket,
    timeout: Duration,
    // Replies still owed to requests that already timed out.
    abandoned: AtomicUsize,
}

impl Requester {
    /// Connects to `address` (`tcp://host:port`), waiting at most `timeout`.
    pub fn connect(address: &str, config: EngineConfig, timeout: Duration) -> Result<Self> {
        let addr = address.parse::<Address>()?.resolve()?;
        let engine = Engine::new(config)?;
        let socket = engine.socket();
        socket.connect(addr)?;

        let requester = Self {
            engine,
            socket,
            timeout,
            abandoned: AtomicUsize::new(0),
        };
        requester.wait_for(EventKind::ConnectionAccepted, "connection")?;
        info!(%addr, "requester connected");
        Ok(requester)
    }

    pub fn socket(&self) -> &AsyncSocket {
        &self.socket
    }

    /// Sends `payload` and waits for the reply.
    pub fn request(&self, payload: &[u8]) -> Result<Bytes> {
        self.socket.receive()?;
        self.socket.send(payload)?;
        match self.wait_for(EventKind::DataReceived, "reply") {
            Ok(reply) => Ok(reply.unwrap_or_default()),
            Err(e @ Error::Timeout(_)) => {
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn close(self) -> Result<()> {
        self.socket.close()
    }

    fn wait_for(&self, wanted: EventKind, what: &'static str) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(what));
            }

            let wait = (deadline - now).min(POLL_INTERVAL);
            let Some(event) = self.engine.next_event(wait) else {
                if self.socket.is_closed() {
                    return Err(Error::ConnectionClosed);
                }
                continue;
            };
            let (kind, peer, payload) = event.into_parts();
            if peer != self.socket {
                continue;
            }
            match kind {
                EventKind::DataReceived if self.take_abandoned() => {
                    debug!(peer = %peer.id(), "discarding late reply");
                }
                k if k == wanted => return Ok(payload),
                EventKind::ConnectionClosed => return Err(Error::ConnectionClosed),
                _ => {}
            }
        }
    }

    fn take_abandoned(&self) -> bool {
        self.abandoned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .pool_size(8)
            .chunk_size(256)
            .workers(2)
            .poll_timeout(Duration::from_millis(20))
            .build()
    }

    #[test]
    fn test_stop_handle() {
        let stop = StopHandle::default();
        assert!(!stop.is_stopped());
        stop.clone().stop();
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_request_reply_round_trip() {
        let replier = Replier::bind("tcp://127.0.0.1:0", config()).unwrap();
        let addr = replier.local_addr().unwrap();
        let stop = replier.stop_handle();

        let server = thread::spawn(move || {
            replier
                .run(|request| {
                    let mut reply = request.to_vec();
                    reply.reverse();
                    Some(reply)
                })
                .unwrap();
        });

        let requester = Requester::connect(
            &format!("tcp://{addr}"),
            config(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(&requester.request(b"ping").unwrap()[..], b"gnip");
        assert_eq!(&requester.request(b"abc").unwrap()[..], b"cba");
        requester.close().unwrap();

        stop.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_request_times_out_without_reply() {
        let replier = Replier::bind("tcp://127.0.0.1:0", config()).unwrap();
        let addr = replier.local_addr().unwrap();
        let stop = replier.stop_handle();
        let server = thread::spawn(move || replier.run(|_| None).unwrap());

        let requester = Requester::connect(
            &format!("tcp://{addr}"),
            config(),
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(matches!(
            requester.request(b"anyone?"),
            Err(Error::Timeout("reply"))
        ));

        stop.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_late_reply_is_not_taken_for_the_next_one() {
        let replier = Replier::bind("tcp://127.0.0.1:0", config()).unwrap();
        let addr = replier.local_addr().unwrap();
        let stop = replier.stop_handle();
        let server = thread::spawn(move || {
            replier
                .run(|request| {
                    if request == b"slow" {
                        thread::sleep(Duration::from_millis(600));
                    }
                    Some(request.to_vec())
                })
                .unwrap();
        });

        let requester = Requester::connect(
            &format!("tcp://{addr}"),
            config(),
            Duration::from_millis(400),
        )
        .unwrap();
        assert!(matches!(
            requester.request(b"slow"),
            Err(Error::Timeout("reply"))
        ));
        assert_eq!(&requester.request(b"fast").unwrap()[..], b"fast");

        stop.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_router_dispatches_by_tag() {
        let mut router = Router::new()
            .map("echo", |body| Some(body.to_vec()))
            .map("len", |body| Some(body.len().to_string().into_bytes()));

        assert_eq!(router.dispatch(b"echo hello world"), Some(b"hello world".to_vec()));
        assert_eq!(router.dispatch(b"len abc"), Some(b"3".to_vec()));
        assert_eq!(router.dispatch(b"echo"), Some(Vec::new()));
        assert_eq!(router.dispatch(b"unknown body"), None);
    }

    #[test]
    fn test_replier_serves_router() {
        let replier = Replier::bind("tcp://127.0.0.1:0", config()).unwrap();
        let addr = replier.local_addr().unwrap();
        let stop = replier.stop_handle();
        let router = Router::new()
            .map("ping", |_| Some(b"pong".to_vec()))
            .map("upper", |body| Some(body.to_ascii_uppercase()));
        let server = thread::spawn(move || replier.serve(router).unwrap());

        let requester = Requester::connect(
            &format!("tcp://{addr}"),
            config(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(&requester.request(b"ping").unwrap()[..], b"pong");
        assert_eq!(&requester.request(b"upper shout").unwrap()[..], b"SHOUT");

        stop.stop();
        server.join().unwrap();
    }
}
