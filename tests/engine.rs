use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use mill_socket::{
    error::Error, protocol::encode, AsyncEvent, AsyncSocket, ConnectionState, Engine,
    EngineConfig, EventKind,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig::builder()
        .pool_size(8)
        .chunk_size(256)
        .workers(2)
        .poll_timeout(Duration::from_millis(20))
        .build()
}

fn listen(engine: &Engine) -> (AsyncSocket, SocketAddr) {
    let listener = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Returns the first event of `kind`, discarding anything else.
fn expect_event(engine: &Engine, kind: EventKind) -> AsyncEvent {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(event) = engine.next_event(Duration::from_millis(50)) {
            if event.kind() == kind {
                return event;
            }
        }
    }
    panic!("no {kind:?} event within {WAIT:?}");
}

fn expect_no_event(engine: &Engine, kind: EventKind, wait: Duration) {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if let Some(event) = engine.next_event(Duration::from_millis(20)) {
            assert_ne!(event.kind(), kind, "unexpected {event:?}");
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {WAIT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Accepts one raw client and returns both ends.
fn accept_raw(engine: &Engine, listener: &AsyncSocket, addr: SocketAddr) -> (AsyncSocket, TcpStream) {
    listener.accept().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    client.set_nodelay(true).unwrap();
    let peer = expect_event(engine, EventKind::NewConnection).peer().clone();
    (peer, client)
}

#[test]
fn test_ping_round_trip_between_engines() {
    let server = Engine::new(config()).unwrap();
    let client_engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&server);
    listener.accept().unwrap();

    let client = client_engine.socket();
    client.connect(addr).unwrap();
    let connected = expect_event(&client_engine, EventKind::ConnectionAccepted);
    assert_eq!(connected.peer(), &client);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.peer_addr(), Some(addr));

    client.receive().unwrap();
    client.send(b"ping").unwrap();

    let new_peer = expect_event(&server, EventKind::NewConnection);
    let peer = new_peer.peer().clone();
    peer.receive().unwrap();
    let request = expect_event(&server, EventKind::DataReceived);
    assert_eq!(request.peer(), &peer);
    assert_eq!(&request.payload().unwrap()[..], b"ping");

    peer.send(b"ping").unwrap();
    expect_event(&client_engine, EventKind::DataSent);
    let reply = expect_event(&client_engine, EventKind::DataReceived);
    assert_eq!(&reply.payload().unwrap()[..], b"ping");

    wait_until(|| server.available_contexts() == 8 && client_engine.available_contexts() == 8);
}

#[test]
fn test_fragmented_message_is_reassembled() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);
    peer.receive().unwrap();

    client.write_all(&[0x00, 0x00, 0x00, 0x05]).unwrap();
    for byte in b"abcd" {
        thread::sleep(Duration::from_millis(20));
        client.write_all(&[*byte]).unwrap();
    }
    expect_no_event(&engine, EventKind::DataReceived, Duration::from_millis(100));
    assert_eq!(peer.pending_receives(), 1);

    client.write_all(b"e").unwrap();
    let event = expect_event(&engine, EventKind::DataReceived);
    assert_eq!(&event.payload().unwrap()[..], b"abcde");
    assert_eq!(peer.pending_receives(), 0);
}

#[test]
fn test_two_messages_in_one_write() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);

    let mut wire = encode(b"first").unwrap();
    wire.extend(encode(b"second").unwrap());
    wire.extend(encode(b"third").unwrap());

    peer.receive().unwrap();
    peer.receive().unwrap();
    client.write_all(&wire).unwrap();

    let first = expect_event(&engine, EventKind::DataReceived);
    let second = expect_event(&engine, EventKind::DataReceived);
    assert_eq!(&first.payload().unwrap()[..], b"first");
    assert_eq!(&second.payload().unwrap()[..], b"second");

    // The third message is already buffered; a later receive picks it up
    // without any new data on the socket.
    expect_no_event(&engine, EventKind::DataReceived, Duration::from_millis(50));
    peer.receive().unwrap();
    let third = expect_event(&engine, EventKind::DataReceived);
    assert_eq!(&third.payload().unwrap()[..], b"third");
}

#[test]
fn test_receive_dropped_when_pool_is_empty() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);
    wait_until(|| engine.available_contexts() == 8);

    for _ in 0..9 {
        peer.receive().unwrap();
    }
    assert_eq!(peer.pending_receives(), 8);
    assert_eq!(engine.available_contexts(), 0);

    client.write_all(&encode(b"one").unwrap()).unwrap();
    expect_event(&engine, EventKind::DataReceived);
    assert_eq!(peer.pending_receives(), 7);
    assert_eq!(engine.available_contexts(), 1);
}

#[test]
fn test_second_accept_is_a_no_op() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);

    listener.accept().unwrap();
    listener.accept().unwrap();
    assert_eq!(engine.available_contexts(), 7);

    let _first = TcpStream::connect(addr).unwrap();
    let _second = TcpStream::connect(addr).unwrap();
    expect_event(&engine, EventKind::NewConnection);
    expect_no_event(&engine, EventKind::NewConnection, Duration::from_millis(150));
    assert_eq!(engine.available_contexts(), 8);

    // The next accept picks up the client still waiting in the backlog.
    listener.accept().unwrap();
    expect_event(&engine, EventKind::NewConnection);
}

#[test]
fn test_auto_accept_keeps_accepting() {
    let engine = Engine::new(EngineConfig {
        auto_accept: true,
        ..config()
    })
    .unwrap();
    let (_listener, addr) = listen(&engine);

    let _clients: Vec<_> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    for _ in 0..3 {
        expect_event(&engine, EventKind::NewConnection);
    }
    // One accept stays armed.
    wait_until(|| engine.available_contexts() == 7);
}

#[test]
fn test_oversized_prefix_closes_connection() {
    let engine = Engine::new(EngineConfig {
        notify_closed: true,
        ..config()
    })
    .unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);
    peer.receive().unwrap();

    client.write_all(&1000u32.to_be_bytes()).unwrap();
    let closed = expect_event(&engine, EventKind::ConnectionClosed);
    assert_eq!(closed.peer(), &peer);
    assert_eq!(peer.state(), ConnectionState::Closed);
    assert_eq!(engine.available_contexts(), 8);

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_peer_hangup_closes_connection() {
    let engine = Engine::new(EngineConfig {
        notify_closed: true,
        ..config()
    })
    .unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, client) = accept_raw(&engine, &listener, addr);
    peer.receive().unwrap();

    drop(client);
    expect_event(&engine, EventKind::ConnectionClosed);
    assert!(peer.is_closed());
    assert_eq!(peer.pending_receives(), 0);
}

#[test]
fn test_operations_after_close_fail() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, _client) = accept_raw(&engine, &listener, addr);
    peer.receive().unwrap();
    peer.receive().unwrap();

    peer.close().unwrap();
    assert_eq!(engine.available_contexts(), 8);
    assert!(matches!(peer.send(b"x"), Err(Error::ConnectionClosed)));
    assert!(matches!(peer.receive(), Err(Error::ConnectionClosed)));
    assert!(matches!(peer.close(), Err(Error::ConnectionClosed)));

    listener.close().unwrap();
    assert!(matches!(listener.accept(), Err(Error::ConnectionClosed)));
}

#[test]
fn test_wrong_state_operations() {
    let engine = Engine::new(config()).unwrap();
    let (listener, _) = listen(&engine);
    let idle = engine.socket();

    assert_eq!(idle.state(), ConnectionState::Idle);
    assert!(matches!(idle.send(b"x"), Err(Error::NotConnected)));
    assert!(matches!(idle.receive(), Err(Error::NotConnected)));
    assert!(matches!(idle.accept(), Err(Error::InvalidOperation(_))));
    assert!(matches!(idle.local_addr(), Err(Error::NotConnected)));
    assert!(matches!(listener.receive(), Err(Error::InvalidOperation(_))));
    assert_eq!(engine.available_contexts(), 8);
}

#[test]
fn test_send_rejects_oversized_payload() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, _client) = accept_raw(&engine, &listener, addr);

    assert!(matches!(
        peer.send(&[0u8; 257]),
        Err(Error::MessageTooLarge { len: 257, max: 256 })
    ));
    assert_eq!(peer.pending_sends(), 0);
}

#[test]
fn test_full_size_message_is_framed_on_the_wire() {
    let engine = Engine::new(config()).unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);

    let payload: Vec<u8> = (0..=255u8).collect();
    peer.send(&payload).unwrap();
    expect_event(&engine, EventKind::DataSent);

    let mut wire = vec![0u8; 4 + payload.len()];
    client.read_exact(&mut wire).unwrap();
    assert_eq!(&wire[..4], &256u32.to_be_bytes());
    assert_eq!(&wire[4..], &payload[..]);
}

#[test]
fn test_connect_refused_closes_socket() {
    let engine = Engine::new(EngineConfig {
        notify_closed: true,
        ..config()
    })
    .unwrap();
    // Bind and drop to get a port nobody listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let socket = engine.socket();
    match socket.connect(addr) {
        Ok(()) => {
            expect_event(&engine, EventKind::ConnectionClosed);
            assert!(socket.is_closed());
        }
        Err(Error::Io(_)) => assert_eq!(socket.state(), ConnectionState::Idle),
        Err(e) => panic!("unexpected error {e}"),
    }
    wait_until(|| engine.available_contexts() == 8);
}

#[test]
fn test_hangup_after_final_message_keeps_it_readable() {
    let engine = Engine::new(EngineConfig {
        notify_closed: true,
        ..config()
    })
    .unwrap();
    let (listener, addr) = listen(&engine);
    let (peer, mut client) = accept_raw(&engine, &listener, addr);

    client.write_all(&encode(b"last words").unwrap()).unwrap();
    drop(client);
    expect_no_event(&engine, EventKind::ConnectionClosed, Duration::from_millis(150));
    assert_eq!(peer.state(), ConnectionState::Open);

    peer.receive().unwrap();
    let event = expect_event(&engine, EventKind::DataReceived);
    assert_eq!(&event.payload().unwrap()[..], b"last words");

    peer.receive().unwrap();
    expect_event(&engine, EventKind::ConnectionClosed);
    assert!(peer.is_closed());
}

/// Parks every context of the pool in receives on one accepted peer.
fn exhaust_pool(engine: &Engine) -> (AsyncSocket, AsyncSocket, TcpStream, SocketAddr) {
    let (listener, addr) = listen(engine);
    let (hog, client) = accept_raw(engine, &listener, addr);
    wait_until(|| engine.available_contexts() == 8);
    for _ in 0..8 {
        hog.receive().unwrap();
    }
    assert_eq!(engine.available_contexts(), 0);
    (listener, hog, client, addr)
}

#[test]
fn test_send_dropped_when_pool_is_empty() {
    let engine = Engine::new(config()).unwrap();
    let (_listener, hog, mut client, _) = exhaust_pool(&engine);

    hog.send(b"never").unwrap();
    assert_eq!(hog.pending_sends(), 0);
    expect_no_event(&engine, EventKind::DataSent, Duration::from_millis(150));

    client
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 16];
    let err = client.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));
}

#[test]
fn test_connect_dropped_when_pool_is_empty() {
    let engine = Engine::new(config()).unwrap();
    let (_listener, _hog, _client, addr) = exhaust_pool(&engine);

    // The listener backlog would complete the handshake if the connect ran.
    let socket = engine.socket();
    socket.connect(addr).unwrap();
    assert_eq!(socket.state(), ConnectionState::Idle);
    expect_no_event(&engine, EventKind::ConnectionAccepted, Duration::from_millis(150));
    assert_eq!(socket.state(), ConnectionState::Idle);
}

#[test]
fn test_accept_dropped_when_pool_is_empty_releases_gate() {
    let engine = Engine::new(config()).unwrap();
    let (listener, hog, _hog_client, addr) = exhaust_pool(&engine);

    listener.accept().unwrap();
    let _waiting = TcpStream::connect(addr).unwrap();
    expect_no_event(&engine, EventKind::NewConnection, Duration::from_millis(150));

    hog.close().unwrap();
    assert_eq!(engine.available_contexts(), 8);
    listener.accept().unwrap();
    expect_event(&engine, EventKind::NewConnection);
}
