//! Plaintext HTTP to HTTPS redirect listener
//!
//! Answers every request with `301 Moved Permanently` to the same path on
//! `https://<host>` and sets `Strict-Transport-Security`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::errors::ProxyError;
use crate::listener::{accept_loop, AcceptBackoff};

/// Redirects plaintext HTTP to the TLS listener
#[derive(Debug)]
pub struct RedirectServer {
    listener: TcpListener,
    host: Arc<str>,
    hsts: HeaderValue,
}

impl RedirectServer {
    pub async fn bind(
        addr: SocketAddr,
        host: &str,
        hsts_max_age: Duration,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "Redirecting plaintext HTTP to HTTPS");

        Ok(Self {
            listener,
            host: Arc::from(host),
            hsts: hsts_header(hsts_max_age)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve redirects until a non-transient accept error
    pub async fn run(self) -> Result<(), ProxyError> {
        let Self {
            listener,
            host,
            hsts,
        } = self;
        let mut backoff = AcceptBackoff::new();

        accept_loop(
            "redirect",
            &mut backoff,
            || listener.accept(),
            |stream, peer| {
                tokio::spawn(serve_connection(stream, peer, Arc::clone(&host), hsts.clone()));
            },
        )
        .await
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, host: Arc<str>, hsts: HeaderValue) {
    let service = service_fn(move |req: Request<Incoming>| {
        let response = redirect_response(&host, req.uri(), &hsts);
        async move { Ok::<_, Infallible>(response) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, error = %e, "Redirect connection ended");
    }
}

/// `Strict-Transport-Security` value for `max_age`, in whole seconds
pub fn hsts_header(max_age: Duration) -> Result<HeaderValue, ProxyError> {
    HeaderValue::try_from(format!("max-age={}", max_age.as_secs()))
        .map_err(|e| ProxyError::Config(format!("invalid HSTS header: {e}")))
}

/// The `301` sent for a request to `uri`
pub fn redirect_response(host: &str, uri: &Uri, hsts: &HeaderValue) -> Response<Full<Bytes>> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{host}{path}");

    let Ok(location) = HeaderValue::try_from(location) else {
        let mut response = Response::new(Full::new(Bytes::from_static(b"bad request\n")));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return response;
    };

    debug!(location = ?location, "Redirecting to HTTPS");

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    response.headers_mut().insert(header::LOCATION, location);
    response
        .headers_mut()
        .insert(header::STRICT_TRANSPORT_SECURITY, hsts.clone());
    response
}
