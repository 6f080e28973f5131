use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use mio::Waker;

use crate::config::Config;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::handler::EventHandler;

/// Result type for `Builder::launch` to avoid type-complexity warnings.
type LaunchResult = Result<
    (
        ShutdownHandle,
        thread::JoinHandle<Result<(), Error>>,
    ),
    Error,
>;

/// Handle returned by `launch()` (or [`EventLoop::shutdown_handle`]) to
/// stop the loop from another thread.
pub struct ShutdownHandle {
    shutdown_flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(shutdown_flag: Arc<AtomicBool>, waker: Arc<Waker>) -> Self {
        ShutdownHandle {
            shutdown_flag,
            waker,
        }
    }

    /// Signal the loop to shut down.
    ///
    /// The loop closes every stream, delivers the final `close` events,
    /// shuts its servers, and returns `Ok(())` from `run`.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Builder for launching an event loop on its own thread.
///
/// Create a builder with [`Builder::new(config)`](Self::new), optionally
/// add listeners with [`.listen(addr)`](Self::listen) or
/// [`.listen_unix(path)`](Self::listen_unix), then call
/// [`.launch(handler)`](Self::launch) to bind them and start the loop
/// thread. Without listeners the loop runs in client-only mode and the
/// handler initiates outbound connects.
pub struct Builder {
    config: Config,
    tcp_listens: Vec<SocketAddr>,
    unix_listens: Vec<PathBuf>,
}

impl Builder {
    /// Create a new builder with the given config.
    pub fn new(config: Config) -> Self {
        Builder {
            config,
            tcp_listens: Vec::new(),
            unix_listens: Vec::new(),
        }
    }

    /// Add a TCP listen address. Can be called multiple times.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.tcp_listens.push(addr);
        self
    }

    /// Add a UNIX-domain listen path. Can be called multiple times.
    pub fn listen_unix(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_listens.push(path.into());
        self
    }

    /// Bind all listeners, then run the loop on a "netline-loop" thread.
    ///
    /// Bind failures surface here, before the thread starts.
    pub fn launch<H: EventHandler>(self, handler: H) -> LaunchResult {
        let mut event_loop = EventLoop::new(&self.config, handler)?;
        for addr in self.tcp_listens {
            event_loop.listen_addr(addr)?;
        }
        for path in &self.unix_listens {
            event_loop.listen_unix(path)?;
        }
        let handle = event_loop.shutdown_handle();
        let join = thread::Builder::new()
            .name("netline-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(Error::Io)?;
        Ok((handle, join))
    }
}
