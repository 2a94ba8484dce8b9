//! Lecat Proxy Library
//!
//! Drop-in HTTPS for a plaintext TCP service. On first run the proxy obtains
//! a certificate for its hostname over ACME (TLS-ALPN-01), then terminates
//! TLS on the listen address and relays every connection to a fixed backend.
//!
//! - **Key Store**: persistent RSA server key, generated once
//! - **Acquisition**: account registration, challenge validation, issuance
//! - **Certificate Store**: chain persisted leaf first, reused across runs
//! - **Duplex Proxy**: TLS termination and bidirectional byte relay
//! - **Redirect**: optional plaintext listener redirecting to HTTPS with HSTS
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lecat_config::{ProxyConfig, SERVER_KEY_NAME};
//! use lecat_proxy::acme::{AcmeClient, Acquirer, CertificateStore, KeyStore};
//! use lecat_proxy::{tls, DuplexProxy};
//!
//! let config = ProxyConfig::new("proxy.example.com", "localhost:8080");
//! let server_key = KeyStore::new(config.state_dir()).load_or_create_key(SERVER_KEY_NAME)?;
//! let store = Arc::new(CertificateStore::new(config.state_dir())?);
//! let mut acquirer = Acquirer::new(AcmeClient::new(&config, Arc::clone(&store)), &config)?;
//!
//! let (chain, released) = store.load_or_acquire_certificate(&server_key, &mut acquirer).await?;
//! let tls = tls::server_config(&chain, server_key.to_rustls()?, config.http2)?;
//! DuplexProxy::bind(&config, tls, released).await?.run().await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod errors;
pub mod listener;
pub mod proxy;
pub mod redirect;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use errors::{is_closed, is_transient, NetErrorClass, ProxyError};
pub use listener::{AcceptBackoff, KeepAliveListener};
pub use proxy::{relay, DuplexProxy};
pub use redirect::RedirectServer;

#[cfg(test)]
mod test_client;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, OnceLock};

    use rustls::ClientConfig;

    use crate::acme::PrivateKey;
    use crate::tls::crypto_provider;

    /// RSA generation is slow; share one key across tests
    pub fn test_key() -> &'static PrivateKey {
        static KEY: OnceLock<PrivateKey> = OnceLock::new();
        KEY.get_or_init(|| PrivateKey::generate().unwrap())
    }

    /// Client config offering `alpn` and trusting whatever the server presents
    pub fn client_config(alpn: &[&[u8]]) -> Arc<ClientConfig> {
        crate::test_client::client_config(crypto_provider(), alpn)
    }
}
