//! Integration tests over real sockets.
//!
//! Each test builds an event loop, runs it on a background thread, and
//! drives it with plain std TCP/UNIX peers.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netline::{
    Config, Data, Error, EventHandler, EventLoop, LoopCtx, ReadyState, ServerToken,
    ShutdownHandle, StreamToken,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    let mut config = Config::default();
    config.max_streams = 64;
    config.backlog = 16;
    config
}

type Join = thread::JoinHandle<Result<(), Error>>;

fn start<H: EventHandler>(event_loop: EventLoop<H>) -> (ShutdownHandle, Join) {
    let handle = event_loop.shutdown_handle();
    let mut event_loop = event_loop;
    let join = thread::spawn(move || event_loop.run());
    (handle, join)
}

fn stop(handle: ShutdownHandle, join: Join) {
    handle.shutdown();
    join.join().unwrap().unwrap();
}

/// Spin until `cond` holds, panicking after five seconds.
fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = vec![0u8; len];
    let mut total = 0;
    while total < len {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

// ── Echo round-trip (TCP) ───────────────────────────────────────────

struct Echo;

impl EventHandler for Echo {
    fn on_connection(&mut self, _ctx: &mut LoopCtx, _server: ServerToken, _stream: StreamToken) {}

    fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data) {
        let _ = ctx.write(stream, data.as_bytes());
    }
}

#[test]
fn echo_round_trip() {
    let mut event_loop = EventLoop::new(&test_config(), Echo).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello").unwrap();
    let echoed = read_exact_timeout(&mut client, 5);
    assert_eq!(echoed, b"hello");

    drop(client);
    stop(handle, join);
}

#[test]
fn echo_large_payload() {
    let mut event_loop = EventLoop::new(&test_config(), Echo).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(addr).unwrap();
    let expected = payload.clone();
    let mut writer = client.try_clone().unwrap();
    let feeder = thread::spawn(move || writer.write_all(&payload));
    let echoed = read_exact_timeout(&mut client, expected.len());
    feeder.join().unwrap().unwrap();
    assert_eq!(echoed, expected);

    drop(client);
    stop(handle, join);
}

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("server did not start on {addr}: {e}"),
        }
    }
}

#[test]
fn builder_launches_listener() {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let (handle, join) = netline::Builder::new(test_config())
        .listen(addr)
        .launch(Echo)
        .unwrap();

    let mut client = wait_for_server(addr);
    client.write_all(b"via builder").unwrap();
    let echoed = read_exact_timeout(&mut client, 11);
    assert_eq!(echoed, b"via builder");

    drop(client);
    stop(handle, join);
}

// ── Pause / resume ──────────────────────────────────────────────────

struct PausingEcho;

impl EventHandler for PausingEcho {
    fn on_connection(&mut self, ctx: &mut LoopCtx, _server: ServerToken, stream: StreamToken) {
        // Redundant pauses collapse; one resume restores delivery.
        ctx.pause(stream).unwrap();
        ctx.pause(stream).unwrap();
        ctx.resume(stream).unwrap();
    }

    fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data) {
        let _ = ctx.write(stream, data.as_bytes());
    }
}

#[test]
fn pause_pause_resume_still_delivers() {
    let mut event_loop = EventLoop::new(&test_config(), PausingEcho).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"paused?").unwrap();
    let echoed = read_exact_timeout(&mut client, 7);
    assert_eq!(echoed, b"paused?");

    drop(client);
    stop(handle, join);
}

// ── Idle timeout ────────────────────────────────────────────────────

struct IdleServer {
    log: Arc<Mutex<Vec<String>>>,
}

impl EventHandler for IdleServer {
    fn on_connection(&mut self, ctx: &mut LoopCtx, _server: ServerToken, stream: StreamToken) {
        ctx.set_timeout(stream, 1500).unwrap();
    }

    fn on_data(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _data: Data) {}

    fn on_timeout(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken) {
        self.log.lock().unwrap().push("timeout".into());
    }

    fn on_error(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, error: &Error) {
        self.log.lock().unwrap().push(format!("error:{error}"));
    }

    fn on_close(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, had_error: bool) {
        self.log.lock().unwrap().push(format!("close:{had_error}"));
    }
}

#[test]
fn idle_timeout_fires() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = IdleServer { log: log.clone() };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    // 1500 rounds down to the 1000 ms bucket.
    let started = Instant::now();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from the idle teardown");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "fired after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "fired after {elapsed:?}");

    wait_for("close event", || log.lock().unwrap().len() >= 3);
    let log = log.lock().unwrap();
    assert_eq!(
        &log[..],
        &["timeout", "error:idle timeout", "close:true"]
    );

    stop(handle, join);
}

// ── Backpressure ────────────────────────────────────────────────────

struct Flooder {
    total_queued: Arc<AtomicUsize>,
    saw_backpressure: Arc<AtomicBool>,
    drains: Arc<AtomicUsize>,
}

const CHUNK: usize = 64 * 1024;
const MAX_CHUNKS: usize = 256;

impl EventHandler for Flooder {
    fn on_connection(&mut self, ctx: &mut LoopCtx, _server: ServerToken, stream: StreamToken) {
        let chunk = vec![0xabu8; CHUNK];
        for _ in 0..MAX_CHUNKS {
            let flushed = ctx.write(stream, &chunk).unwrap();
            self.total_queued.fetch_add(CHUNK, Ordering::SeqCst);
            if !flushed {
                self.saw_backpressure.store(true, Ordering::SeqCst);
                assert!(ctx.queued_bytes(stream).unwrap() > 0);
                break;
            }
        }
    }

    fn on_data(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _data: Data) {}

    fn on_drain(&mut self, ctx: &mut LoopCtx, stream: StreamToken) {
        self.drains.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ctx.queued_bytes(stream).unwrap(), 0);
        ctx.close(stream).unwrap();
    }
}

#[test]
fn backpressure_queues_and_drains_in_order() {
    let total_queued = Arc::new(AtomicUsize::new(0));
    let saw_backpressure = Arc::new(AtomicBool::new(false));
    let drains = Arc::new(AtomicUsize::new(0));
    let handler = Flooder {
        total_queued: total_queued.clone(),
        saw_backpressure: saw_backpressure.clone(),
        drains: drains.clone(),
    };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    // Let the flood hit the kernel buffers before draining.
    wait_for("backpressure", || saw_backpressure.load(Ordering::SeqCst));

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assert!(buf[..n].iter().all(|&b| b == 0xab));
                received += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    assert_eq!(received, total_queued.load(Ordering::SeqCst));
    assert_eq!(drains.load(Ordering::SeqCst), 1);

    stop(handle, join);
}

// ── Half-close ──────────────────────────────────────────────────────

struct HalfClose {
    states: Arc<Mutex<Vec<ReadyState>>>,
    closes: Arc<Mutex<Vec<bool>>>,
}

impl EventHandler for HalfClose {
    fn on_connection(&mut self, _ctx: &mut LoopCtx, _server: ServerToken, _stream: StreamToken) {}

    fn on_data(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _data: Data) {}

    fn on_end(&mut self, ctx: &mut LoopCtx, stream: StreamToken) {
        // Peer shut its write side; ours still flows.
        self.states.lock().unwrap().push(ctx.ready_state(stream));
        ctx.write(stream, b"later").unwrap();
        ctx.close(stream).unwrap();
    }

    fn on_close(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, had_error: bool) {
        self.closes.lock().unwrap().push(had_error);
    }
}

#[test]
fn half_close_write_side_stays_open() {
    let states = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(Vec::new()));
    let handler = HalfClose {
        states: states.clone(),
        closes: closes.clone(),
    };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"bye").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut out = Vec::new();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"later");

    wait_for("close event", || !closes.lock().unwrap().is_empty());
    assert_eq!(&states.lock().unwrap()[..], &[ReadyState::WriteOnly]);
    assert_eq!(&closes.lock().unwrap()[..], &[false]);

    stop(handle, join);
}

// ── Graceful close with an empty queue ──────────────────────────────

struct CloseOnAccept {
    states: Arc<Mutex<Vec<ReadyState>>>,
    write_errors: Arc<Mutex<Vec<Error>>>,
}

impl EventHandler for CloseOnAccept {
    fn on_connection(&mut self, ctx: &mut LoopCtx, _server: ServerToken, stream: StreamToken) {
        ctx.close(stream).unwrap();
        // Shutdown happened immediately: read side only now.
        self.states.lock().unwrap().push(ctx.ready_state(stream));
        if let Err(e) = ctx.write(stream, b"nope") {
            self.write_errors.lock().unwrap().push(e);
        }
    }

    fn on_data(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _data: Data) {}
}

#[test]
fn close_with_empty_queue_shuts_down_immediately() {
    let states = Arc::new(Mutex::new(Vec::new()));
    let write_errors = Arc::new(Mutex::new(Vec::new()));
    let handler = CloseOnAccept {
        states: states.clone(),
        write_errors: write_errors.clone(),
    };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    wait_for("misuse error", || !write_errors.lock().unwrap().is_empty());
    assert_eq!(&states.lock().unwrap()[..], &[ReadyState::ReadOnly]);
    assert!(matches!(
        write_errors.lock().unwrap()[0],
        Error::NotWritable
    ));

    stop(handle, join);
}

// ── Accept drain ────────────────────────────────────────────────────

struct Counter {
    connections: Arc<AtomicUsize>,
}

impl EventHandler for Counter {
    fn on_connection(&mut self, _ctx: &mut LoopCtx, _server: ServerToken, _stream: StreamToken) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_data(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _data: Data) {}
}

#[test]
fn accept_drains_simultaneous_connects() {
    let connections = Arc::new(AtomicUsize::new(0));
    let handler = Counter {
        connections: connections.clone(),
    };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let clients: Vec<TcpStream> = (0..10).map(|_| TcpStream::connect(addr).unwrap()).collect();
    wait_for("ten connections", || {
        connections.load(Ordering::SeqCst) == 10
    });

    drop(clients);
    stop(handle, join);
}

// ── UNIX domain ─────────────────────────────────────────────────────

#[test]
fn unix_stale_file_is_replaced() {
    let path = std::env::temp_dir().join(format!("netline-echo-{}.sock", std::process::id()));
    std::fs::write(&path, b"stale marker").unwrap();

    let mut event_loop = EventLoop::new(&test_config(), Echo).unwrap();
    event_loop.listen_unix(&path).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(b"over unix").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = vec![0u8; 9];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"over unix");

    drop(client);
    stop(handle, join);
    // close() unlinked the path again.
    assert!(!path.exists());
}

#[test]
fn unix_listen_refuses_directory() {
    let path = std::env::temp_dir().join(format!("netline-dir-{}", std::process::id()));
    std::fs::create_dir(&path).unwrap();

    let mut event_loop = EventLoop::new(&test_config(), Echo).unwrap();
    let err = event_loop.listen_unix(&path).unwrap_err();
    assert!(matches!(err, Error::PathNotFile(_)));
    // Refused without unlinking.
    assert!(path.exists());
    std::fs::remove_dir(&path).unwrap();
}

// ── Outbound connect ────────────────────────────────────────────────

struct Dialer {
    log: Arc<Mutex<Vec<String>>>,
}

impl EventHandler for Dialer {
    fn on_connection(&mut self, _ctx: &mut LoopCtx, _server: ServerToken, _stream: StreamToken) {}

    fn on_connect(&mut self, ctx: &mut LoopCtx, stream: StreamToken) {
        assert_eq!(ctx.ready_state(stream), ReadyState::Open);
        self.log.lock().unwrap().push("connect".into());
        ctx.write(stream, b"ping").unwrap();
    }

    fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data) {
        self.log
            .lock()
            .unwrap()
            .push(format!("data:{}", String::from_utf8_lossy(data.as_bytes())));
        ctx.close(stream).unwrap();
    }

    fn on_close(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, had_error: bool) {
        self.log.lock().unwrap().push(format!("close:{had_error}"));
    }
}

#[test]
fn outbound_connect_and_events_in_order() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let peer = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").unwrap();
        // Wait for the loop's shutdown-write, then drop.
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest);
    });

    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = Dialer { log: log.clone() };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    let stream = event_loop.connect_addr(addr).unwrap();
    // Not yet connected from the caller's point of view.
    assert_eq!(event_loop.ctx().ready_state(stream), ReadyState::Opening);
    let (handle, join) = start(event_loop);

    wait_for("close event", || {
        log.lock().unwrap().iter().any(|e| e.starts_with("close"))
    });
    peer.join().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(&log[..], &["connect", "data:pong", "close:false"]);

    stop(handle, join);
}

// ── Hostname connect through the resolver adapter ───────────────────

#[test]
fn hostname_connect_defers_to_next_turn() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let peer = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        conn.write_all(b"pong").unwrap();
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest);
    });

    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = Dialer { log: log.clone() };
    let mut event_loop = EventLoop::new(&test_config(), handler).unwrap();
    // A literal host still defers: the stream is resolving until the loop turns.
    let stream = event_loop.connect("127.0.0.1", addr.port()).unwrap();
    assert_eq!(event_loop.ctx().ready_state(stream), ReadyState::Opening);
    let (handle, join) = start(event_loop);

    wait_for("close event", || {
        log.lock().unwrap().iter().any(|e| e.starts_with("close"))
    });
    peer.join().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(&log[..], &["connect", "data:pong", "close:false"]);

    stop(handle, join);
}

// ── Text decoding ───────────────────────────────────────────────────

struct TextEcho;

impl EventHandler for TextEcho {
    fn on_connection(&mut self, ctx: &mut LoopCtx, _server: ServerToken, stream: StreamToken) {
        ctx.set_encoding(stream, Some(netline::Encoding::Utf8)).unwrap();
    }

    fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data) {
        match data {
            Data::Text(s) => {
                let upper = s.to_uppercase();
                let _ = ctx.write_str(stream, &upper, netline::Encoding::Utf8);
            }
            Data::Slice(_) => panic!("expected decoded text"),
        }
    }
}

#[test]
fn configured_encoding_delivers_text() {
    let mut event_loop = EventLoop::new(&test_config(), TextEcho).unwrap();
    let server = event_loop.listen_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = event_loop.server_local_addr(server).unwrap();
    let (handle, join) = start(event_loop);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"shout").unwrap();
    let echoed = read_exact_timeout(&mut client, 5);
    assert_eq!(echoed, b"SHOUT");

    drop(client);
    stop(handle, join);
}
