//! The readiness dispatch loop.
//!
//! One thread multiplexes every stream and server: poll for readiness,
//! dispatch read/write/accept callbacks, deliver deferred (next-turn)
//! events, then expire idle buckets. Deferred work runs after the current
//! stack unwinds and before further I/O is polled, so `error`/`close`
//! pairs land behind the call that caused them.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mio::{Events, Poll, Registry, Waker};

use crate::config::Config;
use crate::error::Error;
use crate::handler::{
    Data, Deferred, EventHandler, LoopCtx, SERVER_TOKEN_BASE, WAKER_TOKEN, finish_resolve,
    flush_stream, force_close_stream, update_stream_interest,
};
use crate::pool::ReadPool;
use crate::runtime::ShutdownHandle;
use crate::server::{ServerTable, ServerToken};
use crate::stream::{StreamTable, StreamToken, Transport};
use crate::sys;
use crate::timeout::IdleScheduler;

/// All loop state except the poller and the handler, split out so handler
/// callbacks can borrow it as a [`LoopCtx`] while the handler itself stays
/// borrowed by the dispatch code.
struct Inner {
    registry: Registry,
    config: Config,
    streams: StreamTable,
    servers: ServerTable,
    pool: ReadPool,
    idle: IdleScheduler,
    deferred: VecDeque<Deferred>,
    /// Readiness batch copied out of `Events` before dispatch.
    event_batch: Vec<(usize, bool, bool)>,
    /// Scratch for expired-stream indices.
    fired: Vec<u32>,
    shutdown_local: bool,
    shutdown_flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Inner {
    fn ctx(&mut self) -> LoopCtx<'_> {
        LoopCtx {
            registry: &self.registry,
            streams: &mut self.streams,
            servers: &mut self.servers,
            pool: &mut self.pool,
            idle: &mut self.idle,
            deferred: &mut self.deferred,
            config: &self.config,
            shutdown_requested: &mut self.shutdown_local,
        }
    }
}

/// A single-threaded evented runtime for TCP and UNIX stream sockets.
///
/// Create one with a [`Config`] and an [`EventHandler`], set up listeners
/// or outbound connects, then call [`run`](Self::run).
pub struct EventLoop<H: EventHandler> {
    poll: Poll,
    events: Events,
    handler: H,
    inner: Inner,
}

impl<H: EventHandler> EventLoop<H> {
    /// Create an event loop with the given configuration and handler.
    pub fn new(config: &Config, handler: H) -> Result<Self, Error> {
        config.validate()?;
        let poll = Poll::new().map_err(Error::Io)?;
        let registry = poll.registry().try_clone().map_err(Error::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);
        let events = Events::with_capacity(config.events_capacity);

        Ok(EventLoop {
            poll,
            events,
            handler,
            inner: Inner {
                registry,
                config: config.clone(),
                streams: StreamTable::new(config.max_streams, config.freelist_capacity),
                servers: ServerTable::new(config.max_servers),
                pool: ReadPool::new(config.pool_capacity, config.pool_low_water),
                idle: IdleScheduler::new(),
                deferred: VecDeque::new(),
                event_batch: Vec::with_capacity(config.events_capacity),
                fired: Vec::new(),
                shutdown_local: false,
                shutdown_flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    /// Operations context for setup before [`run`](Self::run).
    pub fn ctx(&mut self) -> LoopCtx<'_> {
        self.inner.ctx()
    }

    /// Bind and listen on a TCP address.
    pub fn listen_addr(&mut self, addr: SocketAddr) -> Result<ServerToken, Error> {
        self.inner.ctx().listen_addr(addr)
    }

    /// Listen on an ephemeral TCP port on all interfaces.
    pub fn listen(&mut self) -> Result<ServerToken, Error> {
        self.inner.ctx().listen()
    }

    /// Bind and listen on a UNIX-domain path.
    pub fn listen_unix(&mut self, path: &Path) -> Result<ServerToken, Error> {
        self.inner.ctx().listen_unix(path)
    }

    /// Start an outbound TCP connect to a literal address.
    pub fn connect_addr(&mut self, addr: SocketAddr) -> Result<StreamToken, Error> {
        self.inner.ctx().connect_addr(addr)
    }

    /// Start an outbound connect to `host:port`, resolving if needed.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<StreamToken, Error> {
        self.inner.ctx().connect(host, port)
    }

    /// Start an outbound connect to a UNIX-domain path.
    pub fn connect_unix(&mut self, path: &Path) -> Result<StreamToken, Error> {
        self.inner.ctx().connect_unix(path)
    }

    /// The kernel's view of a server's bound endpoint.
    pub fn server_local_addr(&mut self, server: ServerToken) -> Result<SocketAddr, Error> {
        self.inner.ctx().server_local_addr(server)
    }

    /// Handle for stopping the loop from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.inner.shutdown_flag.clone(), self.inner.waker.clone())
    }

    /// Run until shutdown is requested.
    ///
    /// Every callback (readiness, accept, timer, deferred) runs to
    /// completion on this thread.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.run_deferred();

            if self.inner.shutdown_local || self.inner.shutdown_flag.load(Ordering::Acquire) {
                self.teardown();
                return Ok(());
            }

            let timeout = self
                .inner
                .idle
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }

            self.inner.event_batch.clear();
            for event in self.events.iter() {
                // Error and hangup conditions surface through the normal
                // read/write paths, which observe the failing syscall.
                let readable = event.is_readable() || event.is_read_closed();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                self.inner
                    .event_batch
                    .push((event.token().0, readable, writable));
            }

            for i in 0..self.inner.event_batch.len() {
                let (token, readable, writable) = self.inner.event_batch[i];
                if token == WAKER_TOKEN.0 {
                    continue;
                }
                if token >= SERVER_TOKEN_BASE {
                    if readable {
                        self.handle_accept((token - SERVER_TOKEN_BASE) as u32);
                    }
                    continue;
                }
                let idx = token as u32;
                // Writable first: connect completion opens the stream that
                // the read path then drains.
                if writable {
                    self.handle_writable(idx);
                }
                if readable {
                    self.handle_readable(idx);
                }
            }

            self.run_timers();
        }
    }

    /// Deliver deferred events until the queue runs dry.
    fn run_deferred(&mut self) {
        while let Some(item) = self.inner.deferred.pop_front() {
            match item {
                Deferred::Listening { idx, generation } => {
                    let token = ServerToken::new(idx, generation);
                    if self.inner.servers.get(token).is_none() {
                        continue;
                    }
                    let mut ctx = self.inner.ctx();
                    self.handler.on_listening(&mut ctx, token);
                }
                Deferred::ServerClose { idx, generation } => {
                    let token = ServerToken::new(idx, generation);
                    if self.inner.servers.get(token).is_none() {
                        continue;
                    }
                    let mut ctx = self.inner.ctx();
                    self.handler.on_server_close(&mut ctx, token);
                    self.inner.servers.release(idx);
                }
                Deferred::Drain { idx, generation } => {
                    let token = StreamToken::new(idx, generation);
                    let live = matches!(self.inner.streams.get(token), Some(s) if !s.closing);
                    if !live {
                        continue;
                    }
                    let mut ctx = self.inner.ctx();
                    self.handler.on_drain(&mut ctx, token);
                }
                Deferred::Close {
                    idx,
                    generation,
                    error,
                } => {
                    let token = StreamToken::new(idx, generation);
                    if self.inner.streams.get(token).is_none() {
                        continue;
                    }
                    let had_error = error.is_some();
                    if let Some(err) = &error {
                        let mut ctx = self.inner.ctx();
                        self.handler.on_error(&mut ctx, token, err);
                    }
                    let mut ctx = self.inner.ctx();
                    self.handler.on_close(&mut ctx, token, had_error);
                    if let Some(sidx) = self.inner.streams.slot(idx).server {
                        let server = self.inner.servers.slot_mut(sidx);
                        server.connections = server.connections.saturating_sub(1);
                    }
                    self.inner.streams.release(idx);
                }
                Deferred::Resolve {
                    idx,
                    generation,
                    host,
                    port,
                } => {
                    let inner = &mut self.inner;
                    finish_resolve(
                        &inner.registry,
                        &mut inner.streams,
                        &mut inner.idle,
                        &mut inner.deferred,
                        &inner.config,
                        idx,
                        generation,
                        &host,
                        port,
                    );
                }
            }
        }
    }

    /// Drain the accept queue until the kernel reports would-block.
    fn handle_accept(&mut self, sidx: u32) {
        loop {
            let server = self.inner.servers.slot(sidx);
            if !server.active {
                return;
            }
            let Some(listen_fd) = server.fd else {
                return;
            };
            let kind = server.kind;
            let cap = server.max_connections;

            match sys::accept(listen_fd) {
                Ok(None) => return,
                Err(_) => {
                    // Listener failure is fatal to the server.
                    let token = self.inner.servers.token(sidx);
                    let mut ctx = self.inner.ctx();
                    let _ = ctx.server_close(token);
                    return;
                }
                Ok(Some((fd, peer))) => {
                    if cap > 0 && self.inner.servers.slot(sidx).connections >= cap {
                        sys::close(fd);
                        continue;
                    }
                    let Some(idx) = self.inner.streams.allocate(kind) else {
                        sys::close(fd);
                        continue;
                    };
                    if kind == Transport::Tcp && self.inner.config.tcp_nodelay {
                        let _ = sys::set_nodelay(fd, true);
                    }
                    {
                        let slot = self.inner.streams.slot_mut(idx);
                        slot.fd = Some(fd);
                        slot.readable = true;
                        slot.writable = true;
                        slot.read_interest = true;
                        slot.peer_addr = peer;
                        slot.server = Some(sidx);
                    }
                    if update_stream_interest(&self.inner.registry, &mut self.inner.streams, idx)
                        .is_err()
                    {
                        let slot = self.inner.streams.slot_mut(idx);
                        slot.fd = None;
                        slot.readable = false;
                        slot.writable = false;
                        slot.read_interest = false;
                        sys::close(fd);
                        self.inner.streams.release(idx);
                        continue;
                    }
                    self.inner.servers.slot_mut(sidx).connections += 1;
                    crate::metrics::STREAMS_ACCEPTED.increment();
                    crate::metrics::STREAMS_ACTIVE.increment();
                    let stream_token = self.inner.streams.token(idx);
                    let server_token = self.inner.servers.token(sidx);
                    let mut ctx = self.inner.ctx();
                    self.handler.on_connection(&mut ctx, server_token, stream_token);
                }
            }
        }
    }

    /// Read until would-block, delivering one `data` event per chunk.
    fn handle_readable(&mut self, idx: u32) {
        loop {
            let slot = self.inner.streams.slot(idx);
            if !slot.active || slot.closing || !slot.readable || !slot.read_interest {
                return;
            }
            let Some(fd) = slot.fd else {
                return;
            };
            let encoding = slot.encoding;

            self.inner.pool.ensure();
            match sys::read(fd, self.inner.pool.spare()) {
                Err(e) => {
                    let inner = &mut self.inner;
                    force_close_stream(
                        &inner.registry,
                        &mut inner.streams,
                        &mut inner.idle,
                        &mut inner.deferred,
                        idx,
                        Some(Error::Io(e)),
                    );
                    return;
                }
                Ok(None) => return,
                Ok(Some(0)) => {
                    {
                        let slot = self.inner.streams.slot_mut(idx);
                        slot.readable = false;
                        slot.read_interest = false;
                    }
                    let _ = update_stream_interest(
                        &self.inner.registry,
                        &mut self.inner.streams,
                        idx,
                    );
                    let token = self.inner.streams.token(idx);
                    let mut ctx = self.inner.ctx();
                    self.handler.on_end(&mut ctx, token);
                    let slot = self.inner.streams.slot(idx);
                    if slot.active && !slot.closing && !slot.writable {
                        let inner = &mut self.inner;
                        force_close_stream(
                            &inner.registry,
                            &mut inner.streams,
                            &mut inner.idle,
                            &mut inner.deferred,
                            idx,
                            None,
                        );
                    }
                    return;
                }
                Ok(Some(n)) => {
                    self.inner
                        .idle
                        .active(&mut self.inner.streams, idx, Instant::now());
                    crate::metrics::BYTES_RECEIVED.add(n as u64);
                    let chunk = unsafe { self.inner.pool.commit(n) };
                    let data = match encoding {
                        Some(enc) => Data::Text(enc.decode(&chunk)),
                        None => Data::Slice(chunk),
                    };
                    let token = self.inner.streams.token(idx);
                    let mut ctx = self.inner.ctx();
                    self.handler.on_data(&mut ctx, token, data);
                }
            }
        }
    }

    /// Write readiness: finish a pending connect or flush the queue.
    fn handle_writable(&mut self, idx: u32) {
        let (active, closing, connecting, fd) = {
            let slot = self.inner.streams.slot(idx);
            (slot.active, slot.closing, slot.connecting, slot.fd)
        };
        if !active || closing {
            return;
        }
        if !connecting {
            let inner = &mut self.inner;
            flush_stream(
                &inner.registry,
                &mut inner.streams,
                &mut inner.idle,
                &mut inner.deferred,
                idx,
            );
            return;
        }

        let Some(fd) = fd else {
            return;
        };
        let errno = match sys::socket_error(fd) {
            Ok(errno) => errno,
            Err(e) => {
                let inner = &mut self.inner;
                force_close_stream(
                    &inner.registry,
                    &mut inner.streams,
                    &mut inner.idle,
                    &mut inner.deferred,
                    idx,
                    Some(Error::Io(e)),
                );
                return;
            }
        };
        if errno == 0 {
            {
                let slot = self.inner.streams.slot_mut(idx);
                slot.connecting = false;
                slot.readable = true;
                slot.writable = true;
                slot.read_interest = true;
                slot.write_interest = !slot.write_queue.is_empty();
            }
            let _ = update_stream_interest(&self.inner.registry, &mut self.inner.streams, idx);
            self.inner
                .idle
                .active(&mut self.inner.streams, idx, Instant::now());
            crate::metrics::STREAMS_CONNECTED.increment();
            let token = self.inner.streams.token(idx);
            let mut ctx = self.inner.ctx();
            self.handler.on_connect(&mut ctx, token);
            // close() during connect queued the end marker; reach it now.
            let slot = self.inner.streams.slot(idx);
            if slot.active && !slot.closing && !slot.write_queue.is_empty() {
                let inner = &mut self.inner;
                flush_stream(
                    &inner.registry,
                    &mut inner.streams,
                    &mut inner.idle,
                    &mut inner.deferred,
                    idx,
                );
            }
        } else if errno == libc::EINPROGRESS {
            // Still in flight; the write watcher stays armed.
        } else {
            let inner = &mut self.inner;
            force_close_stream(
                &inner.registry,
                &mut inner.streams,
                &mut inner.idle,
                &mut inner.deferred,
                idx,
                Some(Error::Io(sys::errno_error(errno))),
            );
        }
    }

    /// Expire idle buckets: `timeout` then forced teardown, oldest first.
    fn run_timers(&mut self) {
        let now = Instant::now();
        if self.inner.idle.next_deadline().is_none_or(|d| d > now) {
            return;
        }
        let mut fired = std::mem::take(&mut self.inner.fired);
        fired.clear();
        self.inner
            .idle
            .expire(&mut self.inner.streams, now, &mut fired);
        for &idx in &fired {
            let slot = self.inner.streams.slot(idx);
            if !slot.active || slot.closing {
                continue;
            }
            crate::metrics::IDLE_TIMEOUTS.increment();
            let token = self.inner.streams.token(idx);
            let mut ctx = self.inner.ctx();
            self.handler.on_timeout(&mut ctx, token);
            let inner = &mut self.inner;
            force_close_stream(
                &inner.registry,
                &mut inner.streams,
                &mut inner.idle,
                &mut inner.deferred,
                idx,
                Some(Error::IdleTimeout),
            );
        }
        self.inner.fired = fired;
    }

    /// Close everything and deliver the final events.
    fn teardown(&mut self) {
        for idx in self.inner.streams.active_indices() {
            let inner = &mut self.inner;
            force_close_stream(
                &inner.registry,
                &mut inner.streams,
                &mut inner.idle,
                &mut inner.deferred,
                idx,
                None,
            );
        }
        for sidx in self.inner.servers.active_indices() {
            let token = self.inner.servers.token(sidx);
            let mut ctx = self.inner.ctx();
            let _ = ctx.server_close(token);
        }
        self.run_deferred();
    }
}
