//! rustls configuration for the production and validation listeners.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::PrivateKeyDer;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::acme::challenge::ACME_TLS_ALPN_PROTOCOL;
use crate::acme::CertificateChain;

/// The process-wide crypto provider
///
/// Passed explicitly so that a second provider pulled in by a dependency
/// can never make builder selection ambiguous.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Pair a chain with its private key for serving
pub fn certified_key(
    chain: &CertificateChain,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, rustls::Error> {
    let signing_key = crypto_provider().key_provider.load_private_key(key)?;
    Ok(Arc::new(CertifiedKey::new(chain.certs().to_vec(), signing_key)))
}

/// TLS config for the production listener
///
/// With `http2`, `h2` and `http/1.1` are advertised; otherwise no ALPN.
pub fn server_config(
    chain: &CertificateChain,
    key: PrivateKeyDer<'static>,
    http2: bool,
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain.certs().to_vec(), key)?;

    if http2 {
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    }

    Ok(Arc::new(config))
}

/// TLS config for the validation listener
pub fn validation_config(
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![ACME_TLS_ALPN_PROTOCOL.to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{self_signed, PrivateKey};

    #[test]
    fn test_server_config_alpn() {
        let key = PrivateKey::generate().unwrap();
        let chain = self_signed(&key, "example.test").unwrap();

        let plain = server_config(&chain, key.to_rustls().unwrap(), false).unwrap();
        assert!(plain.alpn_protocols.is_empty());

        let h2 = server_config(&chain, key.to_rustls().unwrap(), true).unwrap();
        assert_eq!(h2.alpn_protocols[0], b"h2".to_vec());
    }
}
