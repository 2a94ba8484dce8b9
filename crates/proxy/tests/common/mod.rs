//! Shared fixtures for the proxy integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use lecat_config::{ProxyConfig, SERVER_KEY_NAME};
use lecat_proxy::acme::{
    self_signed, AcmeError, AcquireCertificate, Acquired, CertificateStore, KeyStore, PrivateKey,
};
use lecat_proxy::tls::{crypto_provider, server_config};
use lecat_proxy::DuplexProxy;

#[path = "../../src/test_client.rs"]
mod test_client;

pub const HOST: &str = "example.test";

/// Refuses to run: every test starts from a stored certificate
struct NoAcquisition;

#[async_trait::async_trait]
impl AcquireCertificate for NoAcquisition {
    async fn acquire(&mut self, _server_key: &PrivateKey) -> Result<Acquired, AcmeError> {
        Err(AcmeError::Protocol("unexpected acquisition".to_string()))
    }
}

/// A running proxy in front of `target`
pub struct TestProxy {
    pub addr: SocketAddr,
    pub server_key: PrivateKey,
    pub handle: JoinHandle<Result<(), lecat_proxy::ProxyError>>,
    _state: TempDir,
}

impl TestProxy {
    pub async fn start(target: SocketAddr, http2: bool) -> Self {
        let state = TempDir::new().unwrap();

        let mut config = ProxyConfig::new(HOST, target.to_string());
        config.listen_addr = "127.0.0.1:0".to_string();
        config.state_dir = state.path().to_path_buf();
        config.drain_timeout = Duration::from_millis(200);
        config.http2 = http2;

        // A previous run already obtained a certificate
        let server_key = KeyStore::new(config.state_dir())
            .load_or_create_key(SERVER_KEY_NAME)
            .unwrap();
        let store = CertificateStore::new(config.state_dir()).unwrap();
        store
            .save_certificate(&self_signed(&server_key, HOST).unwrap())
            .unwrap();

        let (chain, released) = store
            .load_or_acquire_certificate(&server_key, &mut NoAcquisition)
            .await
            .unwrap();
        let tls = server_config(&chain, server_key.to_rustls().unwrap(), config.http2).unwrap();

        let proxy = DuplexProxy::bind(&config, tls, released).await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let handle = tokio::spawn(proxy.run());

        Self {
            addr,
            server_key,
            handle,
            _state: state,
        }
    }

    pub async fn connect(&self, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
        let config = test_client::client_config(crypto_provider(), alpn);
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        TlsConnector::from(config)
            .connect(ServerName::try_from(HOST).unwrap(), tcp)
            .await
            .unwrap()
    }
}

/// Echo server: returns everything it reads, then closes
pub fn spawn_echo_backend(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    })
}

/// An address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
