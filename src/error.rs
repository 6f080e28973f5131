use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the netline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or poller syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Stream sat idle past its configured timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// `write` after `close` already queued the end-of-stream marker.
    #[error("close already called")]
    WriteAfterClose,
    /// `write` on a stream whose write side is not open.
    #[error("stream is not writable")]
    NotWritable,
    /// Stale or out-of-range stream token.
    #[error("invalid stream")]
    InvalidStream,
    /// Stale or out-of-range server token.
    #[error("invalid server")]
    InvalidServer,
    /// No free stream slots available.
    #[error("stream limit reached")]
    StreamLimitReached,
    /// No free server slots available.
    #[error("server limit reached")]
    ServerLimitReached,
    /// A UNIX listen path is occupied by something other than a regular file.
    #[error("existing path is not a regular file: {}", .0.display())]
    PathNotFile(PathBuf),
    /// Hostname lookup produced no usable address.
    #[error("address resolution failed: {0}")]
    Resolve(String),
    /// Configuration validation failed.
    #[error("setup: {0}")]
    Setup(String),
}

impl Error {
    /// Whether this error is caller misuse (raised synchronously, state
    /// unchanged) rather than a runtime failure.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::WriteAfterClose
                | Error::NotWritable
                | Error::InvalidStream
                | Error::InvalidServer
                | Error::PathNotFile(_)
        )
    }
}
