//! TLS duplex proxy
//!
//! Terminates TLS on the listen address and relays every connection, byte
//! for byte, to a single plaintext backend. The accept loop never waits on
//! a handshake: each connection gets its own task for the handshake, the
//! backend dial and the relay.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

use lecat_config::ProxyConfig;

use crate::acme::PortReleased;
use crate::errors::{is_closed, ProxyError};
use crate::listener::{accept_loop, AcceptBackoff, KeepAliveListener};

/// Direction of one half of a relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// The production listener
pub struct DuplexProxy {
    listener: KeepAliveListener,
    acceptor: TlsAcceptor,
    target: Arc<str>,
    drain_timeout: Duration,
}

impl DuplexProxy {
    /// Bind the configured listen address
    ///
    /// Requires proof that no validation listener still owns the address.
    pub async fn bind(
        config: &ProxyConfig,
        tls: Arc<ServerConfig>,
        _released: PortReleased,
    ) -> Result<Self, ProxyError> {
        let addr = config
            .listen_socket_addr()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        let listener = KeepAliveListener::bind(addr, config.keepalive)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;

        info!(
            addr = %listener.local_addr()?,
            target = %config.target,
            "Proxy listening"
        );

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            target: Arc::from(config.target.as_str()),
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a non-transient accept error
    pub async fn run(self) -> Result<(), ProxyError> {
        let Self {
            listener,
            acceptor,
            target,
            drain_timeout,
        } = self;
        let mut backoff = AcceptBackoff::new();

        accept_loop(
            "proxy",
            &mut backoff,
            || listener.accept(),
            |stream, peer| {
                tokio::spawn(handle_connection(
                    acceptor.clone(),
                    stream,
                    peer,
                    Arc::clone(&target),
                    drain_timeout,
                ));
            },
        )
        .await
    }
}

impl fmt::Debug for DuplexProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexProxy")
            .field("listener", &self.listener)
            .field("target", &self.target)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    target: Arc<str>,
    drain_timeout: Duration,
) {
    trace!(peer = %peer, "Connection accepted");

    let client = match acceptor.accept(stream).await {
        Ok(client) => client,
        Err(e) => {
            if !is_closed(&e) {
                debug!(peer = %peer, error = %e, "TLS handshake failed");
            }
            return;
        }
    };

    let backend = match TcpStream::connect(&*target).await {
        Ok(backend) => backend,
        Err(e) => {
            // Dropping the client closes it
            error!(peer = %peer, target = %target, error = %e, "Failed to connect to backend");
            return;
        }
    };

    relay(client, backend, drain_timeout).await;
    trace!(peer = %peer, "Connection closed");
}

/// Copy bytes both ways until both directions finish
///
/// A direction that reaches end of stream shuts down the write side of its
/// destination. Once the first direction ends, the other gets at most
/// `drain_timeout` before both streams are closed.
pub async fn relay<C, B>(client: C, backend: B, drain_timeout: Duration)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let mut directions = JoinSet::new();
    directions.spawn(copy_direction(
        client_read,
        backend_write,
        Direction::ClientToBackend,
    ));
    directions.spawn(copy_direction(
        backend_read,
        client_write,
        Direction::BackendToClient,
    ));

    if directions.join_next().await.is_none() {
        return;
    }

    if tokio::time::timeout(drain_timeout, directions.join_next())
        .await
        .is_err()
    {
        debug!(
            timeout_ms = drain_timeout.as_millis() as u64,
            "Drain timeout elapsed, closing connection"
        );
    }

    directions.shutdown().await;
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W, direction: Direction) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;

    // Forward the half-close
    if let Err(e) = writer.shutdown().await {
        trace!(direction = %direction, error = %e, "Shutdown after copy failed");
    }

    match copied {
        Ok(bytes) => {
            trace!(direction = %direction, bytes, "Stream finished");
            bytes
        }
        Err(e) => {
            if !is_closed(&e) {
                warn!(direction = %direction, error = %e, "Error copying stream");
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::{timeout, Instant};

    #[tokio::test]
    async fn test_relay_copies_both_ways_and_propagates_half_close() {
        let (mut client, client_side) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);

        let task = tokio::spawn(relay(client_side, backend_side, Duration::from_secs(5)));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        backend.write_all(b"pong").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_timeout_bounds_the_second_direction() {
        let (mut client, client_side) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);

        let start = Instant::now();
        let task = tokio::spawn(relay(client_side, backend_side, Duration::from_millis(50)));

        client.shutdown().await.unwrap();
        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        // The backend never finishes, so the drain timeout ends the relay
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));

        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await;
        assert!(read.is_err() || rest.is_empty());
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToBackend.to_string(), "client->backend");
        assert_eq!(Direction::BackendToClient.to_string(), "backend->client");
    }
}
