//! End-to-end tests: TLS client -> proxy -> plaintext backend

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use x509_parser::prelude::*;

use common::{spawn_echo_backend, unused_addr, TestProxy, HOST};

async fn round_trip(proxy: &TestProxy, payload: &[u8]) -> Vec<u8> {
    let mut tls = proxy.connect(&[]).await;
    tls.write_all(payload).await.unwrap();
    tls.shutdown().await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), tls.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

#[tokio::test]
async fn test_echo_through_proxy() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = TestProxy::start(backend.local_addr().unwrap(), false).await;
    spawn_echo_backend(backend);

    assert_eq!(round_trip(&proxy, b"ping").await, b"ping");
}

#[tokio::test]
async fn test_presents_stored_certificate() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = TestProxy::start(backend.local_addr().unwrap(), false).await;

    let tls = proxy.connect(&[]).await;
    let (_, session) = tls.get_ref();
    let leaf = &session.peer_certificates().unwrap()[0];
    let (_, cert) = X509Certificate::from_der(leaf).unwrap();

    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(matches!(
        san.value.general_names.as_slice(),
        [GeneralName::DNSName(name)] if *name == HOST
    ));
    assert!(session.alpn_protocol().is_none());
}

#[tokio::test]
async fn test_http2_is_advertised_when_enabled() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = TestProxy::start(backend.local_addr().unwrap(), true).await;

    let tls = proxy.connect(&[&b"h2"[..], &b"http/1.1"[..]]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
}

#[tokio::test]
async fn test_unreachable_backend_closes_only_that_connection() {
    let target = unused_addr().await;
    let proxy = TestProxy::start(target, false).await;

    // Handshake succeeds, then the proxy hangs up
    let mut tls = proxy.connect(&[]).await;
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), tls.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(read.is_err() || buf.is_empty());
    assert!(!proxy.handle.is_finished());

    // Once the backend appears, the same proxy forwards normally
    let Ok(backend) = TcpListener::bind(target).await else {
        // Port was taken by someone else in the meantime
        return;
    };
    spawn_echo_backend(backend);
    assert_eq!(round_trip(&proxy, b"after").await, b"after");
}

#[tokio::test]
async fn test_concurrent_clients_are_not_mixed() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = TestProxy::start(backend.local_addr().unwrap(), false).await;
    spawn_echo_backend(backend);

    let alpha = vec![b'a'; 16 * 1024];
    let bravo = vec![b'b'; 16 * 1024];
    let (a, b) = tokio::join!(round_trip(&proxy, &alpha), round_trip(&proxy, &bravo));

    assert_eq!(a, alpha);
    assert_eq!(b, bravo);
}

#[tokio::test]
async fn test_garbage_handshake_does_not_stop_the_listener() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = TestProxy::start(backend.local_addr().unwrap(), false).await;
    spawn_echo_backend(backend);

    let mut raw = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut sink = Vec::new();
    let _ = timeout(Duration::from_secs(5), raw.read_to_end(&mut sink)).await;

    assert_eq!(round_trip(&proxy, b"still here").await, b"still here");
}
