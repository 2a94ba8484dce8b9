//! Certificate acquisition
//!
//! Drives one TLS-ALPN-01 issuance: register, authorize, answer the
//! challenge on the listen address, then submit a CSR signed by the server
//! key. The validation listener is always shut down before this returns,
//! whether or not validation succeeded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType};
use tracing::{info, warn};

use lecat_config::ProxyConfig;

use super::challenge::{
    select_challenge, tls_alpn_identity, Challenge, ChallengeKind, ValidationIdentities,
    ValidationResolver,
};
use super::client::CertificateAuthority;
use super::error::AcmeError;
use super::keys::PrivateKey;
use super::responder::{PortReleased, ValidationListener};
use super::self_signed::self_signed;
use super::storage::CertificateChain;
use crate::tls::{certified_key, validation_config};

/// Result of a successful acquisition
#[derive(Debug)]
pub struct Acquired {
    /// The CA-issued chain, leaf first
    pub chain: CertificateChain,
    /// Proof that the listen address is free again
    pub released: PortReleased,
}

/// Something that can obtain a certificate for the server key
#[async_trait]
pub trait AcquireCertificate: Send {
    async fn acquire(&mut self, server_key: &PrivateKey) -> Result<Acquired, AcmeError>;
}

/// Acquisition engine for a single hostname
pub struct Acquirer<C> {
    ca: C,
    hostname: String,
    listen_addr: SocketAddr,
}

impl<C: CertificateAuthority> Acquirer<C> {
    /// Create an acquirer answering challenges on the configured listen address
    pub fn new(ca: C, config: &ProxyConfig) -> Result<Self, AcmeError> {
        let listen_addr = config
            .listen_socket_addr()
            .map_err(|e| AcmeError::Protocol(e.to_string()))?;
        Ok(Self::with_listen_addr(ca, &config.host, listen_addr))
    }

    pub fn with_listen_addr(ca: C, hostname: &str, listen_addr: SocketAddr) -> Self {
        Self {
            ca,
            hostname: hostname.to_string(),
            listen_addr,
        }
    }

    /// Answer `challenge` on the listen address until the CA decides
    async fn validate(
        &mut self,
        server_key: &PrivateKey,
        challenge: &Challenge,
    ) -> Result<PortReleased, AcmeError> {
        let key_authorization = self.ca.key_authorization(challenge)?;

        let identities = ValidationIdentities::new();
        identities.add_identity(
            &self.hostname,
            tls_alpn_identity(&self.hostname, &key_authorization)?,
        );

        // Everyone but the validator gets the bootstrap certificate
        let bootstrap = self_signed(server_key, &self.hostname)?;
        let fallback = certified_key(&bootstrap, server_key.to_rustls()?)?;
        let resolver = Arc::new(ValidationResolver::new(identities.clone(), fallback));

        let listener = ValidationListener::bind(self.listen_addr, validation_config(resolver)?).await?;

        info!(hostname = %self.hostname, "Waiting for challenge validation");
        let outcome = self.ca.challenge_ready(challenge).await;

        let released = listener.shutdown().await;
        identities.clear();

        if let Err(e) = &outcome {
            warn!(hostname = %self.hostname, error = %e, "Challenge validation failed");
        }
        outcome.map(|()| released)
    }
}

impl<C> std::fmt::Debug for Acquirer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquirer")
            .field("hostname", &self.hostname)
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: CertificateAuthority> AcquireCertificate for Acquirer<C> {
    async fn acquire(&mut self, server_key: &PrivateKey) -> Result<Acquired, AcmeError> {
        let start = Instant::now();

        info!("Registering ACME account");
        self.ca.register().await?;

        info!(hostname = %self.hostname, "Requesting authorization");
        let authorization = self.ca.authorize(&self.hostname).await?;

        let released = if authorization.already_valid {
            info!(hostname = %self.hostname, "Authorization already valid");
            PortReleased::new()
        } else {
            let challenge = select_challenge(&authorization, &ChallengeKind::TlsAlpn01)?.clone();
            self.validate(server_key, &challenge).await?
        };

        info!(hostname = %self.hostname, "Requesting certificate");
        let csr = certificate_request(server_key, &self.hostname)?;
        let chain = self.ca.new_certificate(&csr).await?;

        info!(
            hostname = %self.hostname,
            chain_len = chain.certs().len(),
            elapsed_secs = start.elapsed().as_secs(),
            "Certificate issued"
        );

        Ok(Acquired { chain, released })
    }
}

/// DER-encoded CSR for `hostname`, signed by the server key
pub fn certificate_request(server_key: &PrivateKey, hostname: &str) -> Result<Vec<u8>, AcmeError> {
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, hostname);
    params.distinguished_name = distinguished_name;

    let csr = params.serialize_request(&server_key.signing_key()?)?;
    Ok(csr.der().to_vec())
}
