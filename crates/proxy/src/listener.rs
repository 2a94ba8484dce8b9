//! Accepting connections
//!
//! [`KeepAliveListener`] enables TCP keepalive on every accepted socket so
//! dead peers are eventually noticed. [`AcceptBackoff`] paces retries after
//! transient accept failures such as file descriptor exhaustion, and
//! [`accept_loop`] ties the two together for every long-lived listener.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::errors::{is_transient, ProxyError};

/// First delay after a transient accept failure
pub const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Longest delay between accept retries
pub const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Retry pacing for a failing accept loop
///
/// Starts at 5ms, doubles on every consecutive transient failure up to 1s,
/// and drops back to zero on the first successful accept.
#[derive(Debug, Clone, Default)]
pub struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transient failure and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            INITIAL_ACCEPT_BACKOFF
        } else {
            (self.delay * 2).min(MAX_ACCEPT_BACKOFF)
        };
        self.delay
    }

    /// Record a successful accept
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    /// The delay last handed out, zero after a success
    pub fn current(&self) -> Duration {
        self.delay
    }
}

/// TCP listener that turns on keepalive for accepted connections
#[derive(Debug)]
pub struct KeepAliveListener {
    inner: TcpListener,
    period: Duration,
}

impl KeepAliveListener {
    pub async fn bind(addr: SocketAddr, period: Duration) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, period })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one connection
    ///
    /// Keepalive setup failures are logged; the connection is still returned.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        if let Err(e) = set_keepalive(&stream, self.period) {
            debug!(peer = %peer, error = %e, "Failed to enable TCP keepalive");
        }
        Ok((stream, peer))
    }
}

/// Hand every accepted connection to `handle` until a non-transient error
///
/// Transient failures sleep for the next `backoff` delay; a successful
/// accept resets it. The fatal error is returned as [`ProxyError::Accept`].
pub async fn accept_loop<S, A, Fut, H>(
    listener: &'static str,
    backoff: &mut AcceptBackoff,
    mut accept: A,
    mut handle: H,
) -> Result<(), ProxyError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
    H: FnMut(S, SocketAddr),
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                backoff.reset();
                handle(stream, peer);
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(
                    listener,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "Accept failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(listener, error = %e, "Accept failed, shutting down listener");
                return Err(ProxyError::Accept(e));
            }
        }
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(period)
        .with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
