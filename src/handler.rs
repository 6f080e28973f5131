use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::{Buf, Bytes};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::config::Config;
use crate::encoding::Encoding;
use crate::error::Error;
use crate::pool::ReadPool;
use crate::resolve;
use crate::server::{ServerTable, ServerToken, prepare_unix_path};
use crate::stream::{ReadyState, StreamTable, StreamToken, Transport, WriteItem};
use crate::sys;
use crate::timeout::IdleScheduler;

/// Poller token space: streams use their slot index, servers are offset.
pub(crate) const SERVER_TOKEN_BASE: usize = 1 << 31;
/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Inbound payload for a `data` delivery.
pub enum Data {
    /// Raw slice of the shared read slab.
    Slice(Bytes),
    /// Text decoded per the stream's configured encoding.
    Text(String),
}

impl Data {
    /// Payload bytes regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Slice(b) => &b[..],
            Data::Text(s) => s.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Callbacks driven by the event loop. One handler per loop.
///
/// All callbacks run to completion on the loop thread; observable state
/// cannot change underneath a callback.
pub trait EventHandler: Send + 'static {
    /// A server finished binding and is accepting.
    fn on_listening(&mut self, _ctx: &mut LoopCtx, _server: ServerToken) {}

    /// A stream was accepted. Its read side is already armed.
    fn on_connection(&mut self, ctx: &mut LoopCtx, server: ServerToken, stream: StreamToken);

    /// A server finished shutting down.
    fn on_server_close(&mut self, _ctx: &mut LoopCtx, _server: ServerToken) {}

    /// An outbound connect completed successfully.
    fn on_connect(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken) {}

    /// Inbound bytes arrived.
    fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data);

    /// The peer half-closed; no more data will arrive.
    fn on_end(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken) {}

    /// The write queue fully flushed after backpressure.
    fn on_drain(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken) {}

    /// The idle timeout elapsed. Teardown follows.
    fn on_timeout(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken) {}

    /// Teardown had a cause. Fires immediately before `on_close`.
    fn on_error(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _error: &Error) {}

    /// Terminal. `had_error` is true when `on_error` preceded.
    fn on_close(&mut self, _ctx: &mut LoopCtx, _stream: StreamToken, _had_error: bool) {}
}

/// Work deferred to the next loop turn, after the current stack unwinds and
/// before further I/O is polled.
pub(crate) enum Deferred {
    Listening {
        idx: u32,
        generation: u32,
    },
    Close {
        idx: u32,
        generation: u32,
        error: Option<Error>,
    },
    Drain {
        idx: u32,
        generation: u32,
    },
    Resolve {
        idx: u32,
        generation: u32,
        host: String,
        port: u16,
    },
    ServerClose {
        idx: u32,
        generation: u32,
    },
}

/// The context provided to handler callbacks for issuing operations.
///
/// This is a short-lived borrow into the event loop's internal state.
pub struct LoopCtx<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) streams: &'a mut StreamTable,
    pub(crate) servers: &'a mut ServerTable,
    pub(crate) pool: &'a mut ReadPool,
    pub(crate) idle: &'a mut IdleScheduler,
    pub(crate) deferred: &'a mut VecDeque<Deferred>,
    pub(crate) config: &'a Config,
    pub(crate) shutdown_requested: &'a mut bool,
}

impl<'a> LoopCtx<'a> {
    /// Request shutdown of the event loop after the current iteration.
    pub fn request_shutdown(&mut self) {
        *self.shutdown_requested = true;
    }

    // ── Servers ──────────────────────────────────────────────────────

    /// Bind and listen on a TCP address. `listening` fires next turn.
    pub fn listen_addr(&mut self, addr: SocketAddr) -> Result<ServerToken, Error> {
        let idx = self
            .servers
            .allocate(Transport::Tcp)
            .ok_or(Error::ServerLimitReached)?;
        let family = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = match sys::socket_stream(family) {
            Ok(fd) => fd,
            Err(e) => {
                self.servers.release(idx);
                return Err(Error::Io(e));
            }
        };
        if let Err(e) = sys::bind_tcp(fd, addr).and_then(|_| sys::listen(fd, self.config.backlog))
        {
            sys::close(fd);
            self.servers.release(idx);
            return Err(Error::Io(e));
        }
        self.finish_listen(idx, fd, None)
    }

    /// Listen on an ephemeral TCP port on all interfaces.
    pub fn listen(&mut self) -> Result<ServerToken, Error> {
        self.listen_addr(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Bind and listen on a UNIX-domain path.
    ///
    /// A stale socket or regular file at the path is unlinked first; any
    /// other occupant is refused without touching it.
    pub fn listen_unix(&mut self, path: &Path) -> Result<ServerToken, Error> {
        prepare_unix_path(path)?;
        let idx = self
            .servers
            .allocate(Transport::Unix)
            .ok_or(Error::ServerLimitReached)?;
        let fd = match sys::socket_stream(libc::AF_UNIX) {
            Ok(fd) => fd,
            Err(e) => {
                self.servers.release(idx);
                return Err(Error::Io(e));
            }
        };
        if let Err(e) =
            sys::bind_unix(fd, path).and_then(|_| sys::listen(fd, self.config.backlog))
        {
            sys::close(fd);
            self.servers.release(idx);
            return Err(Error::Io(e));
        }
        self.finish_listen(idx, fd, Some(path.to_path_buf()))
    }

    fn finish_listen(
        &mut self,
        idx: u32,
        fd: RawFd,
        unix_path: Option<PathBuf>,
    ) -> Result<ServerToken, Error> {
        let token = Token(SERVER_TOKEN_BASE + idx as usize);
        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            sys::close(fd);
            self.servers.release(idx);
            return Err(Error::Io(e));
        }
        let slot = self.servers.slot_mut(idx);
        slot.fd = Some(fd);
        slot.unix_path = unix_path;
        slot.max_connections = self.config.max_connections_per_server;
        let token = self.servers.token(idx);
        self.deferred.push_back(Deferred::Listening {
            idx,
            generation: token.generation,
        });
        Ok(token)
    }

    /// The kernel's view of a server's bound endpoint.
    pub fn server_local_addr(&self, server: ServerToken) -> Result<SocketAddr, Error> {
        let slot = self.servers.get(server).ok_or(Error::InvalidServer)?;
        let fd = slot.fd.ok_or(Error::InvalidServer)?;
        sys::local_addr(fd).map_err(Error::Io)
    }

    /// Stop accepting, close the listener, and unlink a UNIX path.
    /// `server_close` fires next turn.
    pub fn server_close(&mut self, server: ServerToken) -> Result<(), Error> {
        let slot = self.servers.get_mut(server).ok_or(Error::InvalidServer)?;
        if let Some(fd) = slot.fd.take() {
            let _ = self.registry.deregister(&mut SourceFd(&fd));
            sys::close(fd);
        }
        if let Some(path) = slot.unix_path.take() {
            let _ = std::fs::remove_file(path);
        }
        self.deferred.push_back(Deferred::ServerClose {
            idx: server.index,
            generation: server.generation,
        });
        Ok(())
    }

    // ── Connecting ───────────────────────────────────────────────────

    /// Wrap an existing open descriptor in a stream.
    ///
    /// The descriptor must already be non-blocking and connected; both
    /// directions are considered open and the read watcher is armed.
    pub fn open(&mut self, fd: RawFd, kind: Transport) -> Result<StreamToken, Error> {
        let idx = self
            .streams
            .allocate(kind)
            .ok_or(Error::StreamLimitReached)?;
        {
            let slot = self.streams.slot_mut(idx);
            slot.fd = Some(fd);
            slot.readable = true;
            slot.writable = true;
            slot.read_interest = true;
        }
        crate::metrics::STREAMS_ACTIVE.increment();
        if let Err(e) = update_stream_interest(self.registry, self.streams, idx) {
            let slot = self.streams.slot_mut(idx);
            slot.fd = None;
            slot.readable = false;
            slot.writable = false;
            slot.read_interest = false;
            crate::metrics::STREAMS_ACTIVE.decrement();
            self.streams.release(idx);
            return Err(Error::Io(e));
        }
        Ok(self.streams.token(idx))
    }

    /// Start a non-blocking TCP connect to a literal address.
    pub fn connect_addr(&mut self, addr: SocketAddr) -> Result<StreamToken, Error> {
        let idx = self
            .streams
            .allocate(Transport::Tcp)
            .ok_or(Error::StreamLimitReached)?;
        if let Err(e) = start_connect(
            self.registry,
            self.streams,
            idx,
            addr,
            self.config.tcp_nodelay,
        ) {
            self.streams.release(idx);
            return Err(e);
        }
        Ok(self.streams.token(idx))
    }

    /// Connect to `host:port`, resolving the host if it is not a literal
    /// address. The lookup continuation always runs on the next turn, so
    /// the stream is observably `opening` when this returns.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<StreamToken, Error> {
        let idx = self
            .streams
            .allocate(Transport::Tcp)
            .ok_or(Error::StreamLimitReached)?;
        self.streams.slot_mut(idx).resolving = true;
        let token = self.streams.token(idx);
        self.deferred.push_back(Deferred::Resolve {
            idx,
            generation: token.generation,
            host: host.to_string(),
            port,
        });
        Ok(token)
    }

    /// Start a non-blocking connect to a UNIX-domain path.
    pub fn connect_unix(&mut self, path: &Path) -> Result<StreamToken, Error> {
        let idx = self
            .streams
            .allocate(Transport::Unix)
            .ok_or(Error::StreamLimitReached)?;
        let fd = match sys::socket_stream(libc::AF_UNIX) {
            Ok(fd) => fd,
            Err(e) => {
                self.streams.release(idx);
                return Err(Error::Io(e));
            }
        };
        if let Err(e) = sys::connect_unix(fd, path) {
            sys::close(fd);
            self.streams.release(idx);
            return Err(Error::Io(e));
        }
        let slot = self.streams.slot_mut(idx);
        slot.fd = Some(fd);
        slot.connecting = true;
        slot.write_interest = true;
        crate::metrics::STREAMS_ACTIVE.increment();
        if let Err(e) = update_stream_interest(self.registry, self.streams, idx) {
            let slot = self.streams.slot_mut(idx);
            if let Some(fd) = slot.fd.take() {
                sys::close(fd);
            }
            crate::metrics::STREAMS_ACTIVE.decrement();
            self.streams.release(idx);
            return Err(Error::Io(e));
        }
        Ok(self.streams.token(idx))
    }

    // ── Writing ──────────────────────────────────────────────────────

    /// Write raw bytes. Returns true iff everything reached the OS
    /// synchronously; false means the residual was queued and write
    /// readiness re-armed.
    pub fn write(&mut self, stream: StreamToken, data: &[u8]) -> Result<bool, Error> {
        let idx = stream.index;
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        if slot.eof_queued() {
            return Err(Error::WriteAfterClose);
        }
        if !slot.writable {
            return Err(Error::NotWritable);
        }
        if data.is_empty() {
            return Ok(true);
        }
        let Some(fd) = slot.fd else {
            return Err(Error::InvalidStream);
        };

        if !slot.write_queue.is_empty() {
            slot.write_queue
                .push_back(WriteItem::Data(Bytes::copy_from_slice(data)));
            slot.queued_bytes += data.len();
            return Ok(false);
        }

        match sys::write(fd, data) {
            Ok(Some(n)) if n == data.len() => {
                crate::metrics::BYTES_SENT.add(n as u64);
                self.idle.active(self.streams, idx, Instant::now());
                Ok(true)
            }
            Ok(Some(n)) => {
                crate::metrics::BYTES_SENT.add(n as u64);
                self.queue_residual(idx, Bytes::copy_from_slice(&data[n..]));
                self.idle.active(self.streams, idx, Instant::now());
                Ok(false)
            }
            Ok(None) => {
                self.queue_residual(idx, Bytes::copy_from_slice(data));
                Ok(false)
            }
            Err(e) => {
                force_close_stream(
                    self.registry,
                    self.streams,
                    self.idle,
                    self.deferred,
                    idx,
                    Some(Error::Io(e)),
                );
                Ok(false)
            }
        }
    }

    /// Write a string through the shared pool when the encoded form fits,
    /// else through a private exactly-sized buffer.
    pub fn write_str(
        &mut self,
        stream: StreamToken,
        s: &str,
        enc: Encoding,
    ) -> Result<bool, Error> {
        let idx = stream.index;
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        if slot.eof_queued() {
            return Err(Error::WriteAfterClose);
        }
        if !slot.writable {
            return Err(Error::NotWritable);
        }
        if s.is_empty() {
            return Ok(true);
        }
        let Some(fd) = slot.fd else {
            return Err(Error::InvalidStream);
        };

        if !slot.write_queue.is_empty() {
            let buf = enc.encode(s);
            slot.queued_bytes += buf.len();
            slot.write_queue.push_back(WriteItem::Data(buf));
            return Ok(false);
        }

        self.pool.ensure();
        if let Some(len) = self.pool.try_encode(s, enc) {
            match sys::write(fd, self.pool.pending()) {
                Ok(Some(n)) if n == len => {
                    // Fully flushed: rewind the reservation for reuse.
                    self.pool.rewind();
                    crate::metrics::BYTES_SENT.add(n as u64);
                    self.idle.active(self.streams, idx, Instant::now());
                    Ok(true)
                }
                Ok(Some(n)) => {
                    crate::metrics::BYTES_SENT.add(n as u64);
                    let residual = self.pool.take().slice(n..);
                    self.queue_residual(idx, residual);
                    self.idle.active(self.streams, idx, Instant::now());
                    Ok(false)
                }
                Ok(None) => {
                    let residual = self.pool.take();
                    self.queue_residual(idx, residual);
                    Ok(false)
                }
                Err(e) => {
                    self.pool.rewind();
                    force_close_stream(
                        self.registry,
                        self.streams,
                        self.idle,
                        self.deferred,
                        idx,
                        Some(Error::Io(e)),
                    );
                    Ok(false)
                }
            }
        } else {
            // Oversized for the slab: private buffer, raw write path.
            let buf = enc.encode(s);
            self.write_private(idx, fd, buf)
        }
    }

    fn write_private(&mut self, idx: u32, fd: RawFd, mut buf: Bytes) -> Result<bool, Error> {
        match sys::write(fd, &buf[..]) {
            Ok(Some(n)) if n == buf.len() => {
                crate::metrics::BYTES_SENT.add(n as u64);
                self.idle.active(self.streams, idx, Instant::now());
                Ok(true)
            }
            Ok(Some(n)) => {
                crate::metrics::BYTES_SENT.add(n as u64);
                buf.advance(n);
                self.queue_residual(idx, buf);
                self.idle.active(self.streams, idx, Instant::now());
                Ok(false)
            }
            Ok(None) => {
                self.queue_residual(idx, buf);
                Ok(false)
            }
            Err(e) => {
                force_close_stream(
                    self.registry,
                    self.streams,
                    self.idle,
                    self.deferred,
                    idx,
                    Some(Error::Io(e)),
                );
                Ok(false)
            }
        }
    }

    /// Push a partial-write residual at the queue front and re-arm write
    /// readiness.
    fn queue_residual(&mut self, idx: u32, residual: Bytes) {
        crate::metrics::WRITE_RESIDUALS.increment();
        let slot = self.streams.slot_mut(idx);
        slot.queued_bytes += residual.len();
        slot.write_queue.push_front(WriteItem::Data(residual));
        slot.write_interest = true;
        let _ = update_stream_interest(self.registry, self.streams, idx);
    }

    /// Drain the write queue as far as the OS allows. Returns true iff the
    /// queue fully drained (or reached its end-of-stream marker).
    pub fn flush(&mut self, stream: StreamToken) -> Result<bool, Error> {
        let idx = stream.index;
        self.streams.get(stream).ok_or(Error::InvalidStream)?;
        Ok(flush_stream(
            self.registry,
            self.streams,
            self.idle,
            self.deferred,
            idx,
        ))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Graceful close: queue the end-of-stream marker and flush. The write
    /// side shuts down once everything before the marker drains.
    pub fn close(&mut self, stream: StreamToken) -> Result<(), Error> {
        let idx = stream.index;
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        if slot.eof_queued() {
            return Ok(());
        }
        if !slot.writable && !slot.connecting && !slot.resolving {
            // Write side already shut; nothing to wind down.
            return Ok(());
        }
        slot.write_queue.push_back(WriteItem::Eof);
        if !slot.connecting && !slot.resolving {
            flush_stream(self.registry, self.streams, self.idle, self.deferred, idx);
        }
        Ok(())
    }

    /// Immediate teardown: detach both watchers, leave the idle bucket,
    /// drop the write queue, close the fd, and emit `error`/`close` on the
    /// next turn.
    pub fn force_close(&mut self, stream: StreamToken) -> Result<(), Error> {
        let idx = stream.index;
        self.streams.get(stream).ok_or(Error::InvalidStream)?;
        force_close_stream(
            self.registry,
            self.streams,
            self.idle,
            self.deferred,
            idx,
            None,
        );
        Ok(())
    }

    // ── Tuning ───────────────────────────────────────────────────────

    /// Configure text decoding for subsequent `data` deliveries.
    /// `None` restores raw slice delivery.
    pub fn set_encoding(&mut self, stream: StreamToken, enc: Option<Encoding>) -> Result<(), Error> {
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        slot.encoding = enc;
        Ok(())
    }

    /// Set the idle timeout. Values under a second round up to one second,
    /// larger values round down to whole seconds; zero disables.
    pub fn set_timeout(&mut self, stream: StreamToken, ms: u64) -> Result<(), Error> {
        let idx = stream.index;
        self.streams.get(stream).ok_or(Error::InvalidStream)?;
        self.idle.enroll(self.streams, idx, ms);
        let slot = self.streams.slot(idx);
        if slot.fd.is_some() && (slot.readable || slot.writable) {
            self.idle.active(self.streams, idx, Instant::now());
        }
        Ok(())
    }

    /// Stop the read watcher.
    pub fn pause(&mut self, stream: StreamToken) -> Result<(), Error> {
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        slot.read_interest = false;
        update_stream_interest(self.registry, self.streams, stream.index).map_err(Error::Io)
    }

    /// Restart the read watcher.
    pub fn resume(&mut self, stream: StreamToken) -> Result<(), Error> {
        let slot = self.streams.get_mut(stream).ok_or(Error::InvalidStream)?;
        slot.read_interest = slot.readable;
        update_stream_interest(self.registry, self.streams, stream.index).map_err(Error::Io)
    }

    /// Set TCP_NODELAY. No-op on UNIX streams.
    pub fn set_nodelay(&mut self, stream: StreamToken, enable: bool) -> Result<(), Error> {
        let slot = self.streams.get(stream).ok_or(Error::InvalidStream)?;
        match (slot.kind, slot.fd) {
            (Transport::Tcp, Some(fd)) => sys::set_nodelay(fd, enable).map_err(Error::Io),
            _ => Ok(()),
        }
    }

    /// Set SO_KEEPALIVE. No-op on UNIX streams.
    pub fn set_keep_alive(&mut self, stream: StreamToken, enable: bool) -> Result<(), Error> {
        let slot = self.streams.get(stream).ok_or(Error::InvalidStream)?;
        match (slot.kind, slot.fd) {
            (Transport::Tcp, Some(fd)) => sys::set_keepalive(fd, enable).map_err(Error::Io),
            _ => Ok(()),
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Derived lifecycle state. Stale tokens read as closed.
    pub fn ready_state(&self, stream: StreamToken) -> ReadyState {
        match self.streams.get(stream) {
            Some(slot) => slot.ready_state(),
            None => ReadyState::Closed,
        }
    }

    /// The kernel's view of the local endpoint.
    pub fn local_addr(&self, stream: StreamToken) -> Result<SocketAddr, Error> {
        let slot = self.streams.get(stream).ok_or(Error::InvalidStream)?;
        let fd = slot.fd.ok_or(Error::InvalidStream)?;
        sys::local_addr(fd).map_err(Error::Io)
    }

    /// Peer address recorded at accept or connect time (TCP only).
    pub fn peer_addr(&self, stream: StreamToken) -> Option<SocketAddr> {
        self.streams.get(stream).and_then(|s| s.peer_addr)
    }

    /// Bytes sitting in the write queue.
    pub fn queued_bytes(&self, stream: StreamToken) -> Result<usize, Error> {
        let slot = self.streams.get(stream).ok_or(Error::InvalidStream)?;
        Ok(slot.queued_bytes)
    }
}

// ── Shared state-machine helpers ────────────────────────────────────
//
// These operate on split borrows so both LoopCtx methods and the event
// loop's dispatch paths can reach them.

/// Sync a stream's poller registration with its interest flags.
pub(crate) fn update_stream_interest(
    registry: &Registry,
    streams: &mut StreamTable,
    idx: u32,
) -> io::Result<()> {
    let slot = streams.slot_mut(idx);
    let Some(fd) = slot.fd else {
        return Ok(());
    };
    let interest = match (slot.read_interest, slot.write_interest) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    };
    let token = Token(idx as usize);
    match (slot.registered, interest) {
        (false, Some(interest)) => {
            registry.register(&mut SourceFd(&fd), token, interest)?;
            slot.registered = true;
        }
        (true, Some(interest)) => {
            registry.reregister(&mut SourceFd(&fd), token, interest)?;
        }
        (true, None) => {
            registry.deregister(&mut SourceFd(&fd))?;
            slot.registered = false;
        }
        (false, None) => {}
    }
    Ok(())
}

/// Create the socket and start the non-blocking connect for a TCP stream.
/// On error the slot is left fd-less for the caller to dispose of.
pub(crate) fn start_connect(
    registry: &Registry,
    streams: &mut StreamTable,
    idx: u32,
    addr: SocketAddr,
    tcp_nodelay: bool,
) -> Result<(), Error> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = sys::socket_stream(family).map_err(Error::Io)?;
    if tcp_nodelay {
        let _ = sys::set_nodelay(fd, true);
    }
    // EINPROGRESS and instant completion both continue through the write
    // watcher's SO_ERROR check.
    if let Err(e) = sys::connect_tcp(fd, addr) {
        sys::close(fd);
        return Err(Error::Io(e));
    }
    let slot = streams.slot_mut(idx);
    slot.fd = Some(fd);
    slot.connecting = true;
    slot.resolving = false;
    slot.peer_addr = Some(addr);
    slot.write_interest = true;
    crate::metrics::STREAMS_ACTIVE.increment();
    if let Err(e) = update_stream_interest(registry, streams, idx) {
        let slot = streams.slot_mut(idx);
        if let Some(fd) = slot.fd.take() {
            sys::close(fd);
        }
        slot.connecting = false;
        slot.write_interest = false;
        crate::metrics::STREAMS_ACTIVE.decrement();
        return Err(Error::Io(e));
    }
    Ok(())
}

/// Drain a stream's write queue as far as the OS allows.
///
/// Stops at the first residual (re-arming write readiness) or performs the
/// shutdown-write when the end-of-stream marker is reached. Returns true
/// iff the queue fully drained. A `drain` delivery is deferred when the
/// queue transitioned from non-empty to empty while writable.
pub(crate) fn flush_stream(
    registry: &Registry,
    streams: &mut StreamTable,
    idle: &mut IdleScheduler,
    deferred: &mut VecDeque<Deferred>,
    idx: u32,
) -> bool {
    enum Head {
        Empty,
        Eof,
        Data,
    }

    let had_pending = !streams.slot(idx).write_queue.is_empty();
    loop {
        let (head, fd) = {
            let slot = streams.slot(idx);
            if slot.closing || slot.connecting || slot.resolving {
                return false;
            }
            let Some(fd) = slot.fd else {
                return false;
            };
            let head = match slot.write_queue.front() {
                None => Head::Empty,
                Some(WriteItem::Eof) => Head::Eof,
                Some(WriteItem::Data(_)) => Head::Data,
            };
            (head, fd)
        };

        match head {
            Head::Empty => {
                streams.slot_mut(idx).write_interest = false;
                let _ = update_stream_interest(registry, streams, idx);
                let slot = streams.slot(idx);
                if had_pending && slot.writable {
                    let generation = slot.generation;
                    deferred.push_back(Deferred::Drain { idx, generation });
                }
                return true;
            }
            Head::Eof => {
                if let Err(e) = sys::shutdown_write(fd) {
                    force_close_stream(registry, streams, idle, deferred, idx, Some(Error::Io(e)));
                    return false;
                }
                {
                    let slot = streams.slot_mut(idx);
                    slot.write_queue.pop_front();
                    slot.writable = false;
                    slot.write_interest = false;
                }
                let _ = update_stream_interest(registry, streams, idx);
                if !streams.slot(idx).readable {
                    force_close_stream(registry, streams, idle, deferred, idx, None);
                }
                return true;
            }
            Head::Data => {
                let result = match streams.slot(idx).write_queue.front() {
                    Some(WriteItem::Data(buf)) => sys::write(fd, &buf[..]),
                    _ => continue,
                };
                match result {
                    Ok(Some(n)) => {
                        let fully_written = {
                            let slot = streams.slot_mut(idx);
                            slot.queued_bytes -= n;
                            let done = match slot.write_queue.front_mut() {
                                Some(WriteItem::Data(buf)) if n < buf.len() => {
                                    // Short write: the residual stays at the front.
                                    buf.advance(n);
                                    false
                                }
                                _ => true,
                            };
                            if done {
                                slot.write_queue.pop_front();
                                slot.write_interest = !slot.write_queue.is_empty();
                            } else {
                                slot.write_interest = true;
                            }
                            done
                        };
                        crate::metrics::BYTES_SENT.add(n as u64);
                        idle.active(streams, idx, Instant::now());
                        if fully_written {
                            continue;
                        }
                        crate::metrics::WRITE_RESIDUALS.increment();
                        let _ = update_stream_interest(registry, streams, idx);
                        return false;
                    }
                    Ok(None) => {
                        streams.slot_mut(idx).write_interest = true;
                        let _ = update_stream_interest(registry, streams, idx);
                        return false;
                    }
                    Err(e) => {
                        force_close_stream(
                            registry,
                            streams,
                            idle,
                            deferred,
                            idx,
                            Some(Error::Io(e)),
                        );
                        return false;
                    }
                }
            }
        }
    }
}

/// Immediate stream teardown, idempotent.
///
/// Detaches the watchers, leaves the idle bucket, drops queued writes,
/// closes the fd exactly once, and defers `error`/`close` delivery to the
/// next loop turn.
pub(crate) fn force_close_stream(
    registry: &Registry,
    streams: &mut StreamTable,
    idle: &mut IdleScheduler,
    deferred: &mut VecDeque<Deferred>,
    idx: u32,
    error: Option<Error>,
) {
    {
        let slot = streams.slot_mut(idx);
        if !slot.active || slot.closing {
            return;
        }
        slot.closing = true;
        slot.resolving = false;
        slot.connecting = false;
        slot.readable = false;
        slot.writable = false;
        slot.read_interest = false;
        slot.write_interest = false;
        slot.write_queue.clear();
        slot.queued_bytes = 0;
        if let Some(fd) = slot.fd.take() {
            if slot.registered {
                let _ = registry.deregister(&mut SourceFd(&fd));
                slot.registered = false;
            }
            sys::close(fd);
            crate::metrics::STREAMS_ACTIVE.decrement();
        }
    }
    idle.unenroll(streams, idx);
    crate::metrics::STREAMS_CLOSED.increment();
    let generation = streams.slot(idx).generation;
    deferred.push_back(Deferred::Close {
        idx,
        generation,
        error,
    });
}

/// Resolve continuation for `connect(host, port)`. No-ops when the stream
/// was force-closed while the lookup was pending.
pub(crate) fn finish_resolve(
    registry: &Registry,
    streams: &mut StreamTable,
    idle: &mut IdleScheduler,
    deferred: &mut VecDeque<Deferred>,
    config: &Config,
    idx: u32,
    generation: u32,
    host: &str,
    port: u16,
) {
    {
        let slot = streams.slot(idx);
        if !slot.active || slot.generation != generation || !slot.resolving {
            return;
        }
    }
    match resolve::lookup(host, port) {
        Ok(addr) => {
            if let Err(e) = start_connect(registry, streams, idx, addr, config.tcp_nodelay) {
                force_close_stream(registry, streams, idle, deferred, idx, Some(e));
            }
        }
        Err(e) => {
            force_close_stream(registry, streams, idle, deferred, idx, Some(e));
        }
    }
}
