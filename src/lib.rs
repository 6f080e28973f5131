//! netline — an evented non-blocking stream-socket runtime.
//!
//! netline multiplexes many TCP and UNIX-domain connections on one thread
//! over a readiness poller. Inbound bytes arrive as handler callbacks out
//! of a shared read slab, outbound bytes queue with backpressure and
//! partial-write rescheduling, and idle connections share one timer per
//! timeout value through intrusive per-bucket lists.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use netline::{Builder, Config, Data, EventHandler, LoopCtx, ServerToken, StreamToken};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_connection(&mut self, _ctx: &mut LoopCtx, _server: ServerToken, _stream: StreamToken) {}
//!
//!     fn on_data(&mut self, ctx: &mut LoopCtx, stream: StreamToken, data: Data) {
//!         let _ = ctx.write(stream, data.as_bytes());
//!     }
//! }
//!
//! fn main() -> Result<(), netline::Error> {
//!     let (shutdown, join) = Builder::new(Config::default())
//!         .listen("127.0.0.1:7878".parse().unwrap())
//!         .launch(Echo)?;
//!     // ... later:
//!     shutdown.shutdown();
//!     join.join().unwrap()
//! }
//! ```
//!
//! # Model
//!
//! Single-threaded and cooperative: readiness, accept, timer, and deferred
//! callbacks all run to completion on the loop thread. `error` and `close`
//! deliveries are deferred one turn so state observed right after a failing
//! call is still coherent.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod event_loop;
pub(crate) mod freelist;
pub(crate) mod metrics;
pub(crate) mod pool;
pub(crate) mod resolve;
pub(crate) mod runtime;
pub(crate) mod server;
pub(crate) mod stream;
pub(crate) mod sys;
pub(crate) mod timeout;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod encoding;
pub mod error;
pub mod handler;

// ── Re-exports: Runtime ─────────────────────────────────────────────────

/// Builder for launching an event loop on its own thread.
pub use runtime::Builder;
/// Handle for stopping a running loop from another thread.
pub use runtime::ShutdownHandle;
/// The single-threaded readiness dispatch loop.
pub use event_loop::EventLoop;

// ── Re-exports: Handler types ───────────────────────────────────────────

/// Inbound payload: raw slab slice or decoded text.
pub use handler::Data;
/// Callbacks driven by the event loop.
pub use handler::EventHandler;
/// Operations context passed to every callback.
pub use handler::LoopCtx;
/// Opaque stream handle.
pub use stream::StreamToken;
/// Opaque server handle.
pub use server::ServerToken;

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Text encoding tag for data delivery and string writes.
pub use encoding::Encoding;
/// Runtime errors.
pub use error::Error;
/// Derived stream lifecycle state.
pub use stream::ReadyState;
/// Transport kind of a stream or server.
pub use stream::Transport;
