//! Temporary validation listener
//!
//! While a challenge is pending the listen address is taken over by a TLS
//! responder whose only job is the handshake: it presents the validation
//! identity to the CA and the bootstrap certificate to everyone else, and
//! answers any HTTP request with `404 Not Found`.
//!
//! The listener moves through `Idle -> ValidationListening -> Idle`. The
//! return to `Idle` is only observable through [`PortReleased`], which
//! [`ValidationListener::shutdown`] hands out after the accept loop and all
//! of its connections have exited.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use super::challenge::ACME_TLS_ALPN_PROTOCOL;
use super::error::AcmeError;
use crate::listener::{accept_loop, AcceptBackoff};

/// Proof that no validation listener holds the listen address
///
/// Only this crate can produce one: either by awaiting
/// [`ValidationListener::shutdown`] or when no validation listener was
/// ever started. The production proxy consumes it when binding.
#[derive(Debug)]
#[must_use = "the production listener needs this to bind"]
pub struct PortReleased {
    _private: (),
}

impl PortReleased {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// A running validation listener
pub struct ValidationListener {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ValidationListener {
    /// Bind `addr` and start answering handshakes
    pub async fn bind(addr: SocketAddr, config: Arc<ServerConfig>) -> Result<Self, AcmeError> {
        let listener = TcpListener::bind(addr).await.map_err(AcmeError::Listener)?;
        let local_addr = listener.local_addr().map_err(AcmeError::Listener)?;

        info!(addr = %local_addr, "Validation listener started");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let acceptor = TlsAcceptor::from(config);
        let task = tokio::spawn(serve_validation(listener, acceptor, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every connection and wait for all of it to exit
    pub async fn shutdown(mut self) -> PortReleased {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                // Abort or panic: either way the listener socket is gone
                warn!(error = %e, "Validation listener task ended abnormally");
            }
        }

        info!(addr = %self.local_addr, "Validation listener stopped");
        PortReleased::new()
    }
}

impl Drop for ValidationListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ValidationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationListener")
            .field("local_addr", &self.local_addr)
            .field("running", &self.task.is_some())
            .finish()
    }
}

async fn serve_validation(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    let mut backoff = AcceptBackoff::new();

    let accepting = accept_loop(
        "validation",
        &mut backoff,
        || listener.accept(),
        |stream, peer| {
            trace!(peer = %peer, "Validation connection accepted");
            connections.spawn(serve_connection(acceptor.clone(), stream, peer));
        },
    );

    tokio::select! {
        _ = shutdown_rx => {}
        result = accepting => {
            if let Err(e) = result {
                warn!(error = %e, "Validation listener stopped accepting");
            }
        }
    }

    drop(listener);
    connections.shutdown().await;
}

async fn serve_connection(acceptor: TlsAcceptor, stream: TcpStream, peer: SocketAddr) {
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Validation handshake failed");
            return;
        }
    };

    // The validator closes after the handshake; nothing follows
    if tls.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_PROTOCOL) {
        info!(peer = %peer, "Validation handshake completed");
        return;
    }

    let service = service_fn(|_req: Request<Incoming>| async { Ok::<_, Infallible>(not_found()) });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        trace!(peer = %peer, error = %e, "Validation responder connection ended");
    }
}

fn not_found() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"404 page not found\n")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
