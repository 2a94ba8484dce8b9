//! Proxy error types and network error classification.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How a network error should be treated
///
/// - **Transient**: the operation can be retried after a pause
/// - **Closed**: ordinary connection teardown, not worth logging
/// - **Fatal**: anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetErrorClass {
    Transient,
    Closed,
    Fatal,
}

impl NetErrorClass {
    /// Classify an I/O error
    pub fn of(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            if is_transient_os_code(code) {
                return NetErrorClass::Transient;
            }
        }

        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => NetErrorClass::Closed,
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => NetErrorClass::Transient,
            _ => NetErrorClass::Fatal,
        }
    }

    pub fn is_transient(self) -> bool {
        self == NetErrorClass::Transient
    }

    pub fn is_closed(self) -> bool {
        self == NetErrorClass::Closed
    }
}

/// Resource exhaustion and interrupted calls clear up on their own
fn is_transient_os_code(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE
            | libc::ENFILE
            | libc::ENOBUFS
            | libc::ENOMEM
            | libc::EINTR
            | libc::EAGAIN
            | libc::ECONNABORTED
    )
}

/// True if the error may be retried after a backoff
pub fn is_transient(err: &io::Error) -> bool {
    NetErrorClass::of(err).is_transient()
}

/// True if the error is an ordinary end of a connection
pub fn is_closed(err: &io::Error) -> bool {
    NetErrorClass::of(err).is_closed()
}
