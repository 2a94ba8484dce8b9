//! TLS-ALPN-01 challenge handling
//!
//! Domain control is proven at the TLS handshake: when the validator asks
//! for the validated host with the `acme-tls/1` protocol, the responder
//! presents a certificate carrying the SHA-256 digest of the key
//! authorization. Everyone else gets the bootstrap certificate.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::error::AcmeError;

/// ALPN protocol the validator negotiates (RFC 8737)
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Challenge types a CA may offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    TlsAlpn01,
    Http01,
    Dns01,
    Other(String),
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeKind::TlsAlpn01 => f.write_str("tls-alpn-01"),
            ChallengeKind::Http01 => f.write_str("http-01"),
            ChallengeKind::Dns01 => f.write_str("dns-01"),
            ChallengeKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// A single challenge offered by the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    /// Token the key authorization is built from
    pub token: String,
    /// URL used to tell the CA the challenge is ready
    pub url: String,
}

/// An authorization for one identifier
#[derive(Debug, Clone)]
pub struct Authorization {
    /// The hostname being authorized
    pub identifier: String,
    /// The CA already considers the identifier validated
    pub already_valid: bool,
    /// Alternative ways of proving control; all challenges of one
    /// combination must be fulfilled
    pub combinations: Vec<Vec<Challenge>>,
}

/// Pick the only acceptable challenge of an authorization
///
/// Combinations made entirely of `supported` challenges are kept. Exactly
/// one such combination holding exactly one challenge is accepted; zero,
/// several, or a multi-challenge combination are all rejected.
pub fn select_challenge<'a>(
    authorization: &'a Authorization,
    supported: &ChallengeKind,
) -> Result<&'a Challenge, AcmeError> {
    let usable: Vec<&Vec<Challenge>> = authorization
        .combinations
        .iter()
        .filter(|combination| {
            !combination.is_empty() && combination.iter().all(|c| &c.kind == supported)
        })
        .collect();

    match usable.as_slice() {
        [only] if only.len() == 1 => Ok(&only[0]),
        [only] => Err(AcmeError::UnsupportedChallenge(format!(
            "combination of {} {supported} challenges for {}",
            only.len(),
            authorization.identifier
        ))),
        [] => Err(AcmeError::UnsupportedChallenge(format!(
            "no {supported} combination offered for {}",
            authorization.identifier
        ))),
        many => Err(AcmeError::UnsupportedChallenge(format!(
            "{} {supported} combinations offered for {}",
            many.len(),
            authorization.identifier
        ))),
    }
}

/// Build the validation certificate for `hostname`
///
/// The certificate names only `hostname` and carries the critical
/// `acmeIdentifier` extension with SHA-256(key_authorization). Its key is
/// ephemeral.
pub fn tls_alpn_identity(
    hostname: &str,
    key_authorization: &str,
) -> Result<Arc<CertifiedKey>, AcmeError> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest.as_slice())];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)?;

    Ok(Arc::new(CertifiedKey::new(
        vec![CertificateDer::from(cert.der().to_vec())],
        signing_key,
    )))
}

/// Validation identities keyed by server name
///
/// Shared between the acquisition engine that registers identities and
/// the handshake resolver that serves them.
///
/// # Thread Safety
///
/// Uses `DashMap` for lock-free concurrent access from handshake threads.
#[derive(Debug, Clone, Default)]
pub struct ValidationIdentities {
    identities: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl ValidationIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the identity to present for `server_name`
    pub fn add_identity(&self, server_name: &str, identity: Arc<CertifiedKey>) {
        debug!(server_name = %server_name, "Registering TLS-ALPN-01 validation identity");
        self.identities
            .insert(server_name.to_ascii_lowercase(), identity);
    }

    /// Identity registered for `server_name`, if any
    pub fn get(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let result = self
            .identities
            .get(&server_name.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()));
        trace!(server_name = %server_name, found = result.is_some(), "Validation identity lookup");
        result
    }

    /// Number of registered identities
    pub fn pending_count(&self) -> usize {
        self.identities.len()
    }

    /// Drop all identities
    pub fn clear(&self) {
        let count = self.identities.len();
        self.identities.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared validation identities");
        }
    }
}

/// Handshake certificate selection for the validation listener
///
/// Serves a validation identity when the client names a registered host
/// and offers `acme-tls/1`; otherwise serves the bootstrap certificate.
pub struct ValidationResolver {
    identities: ValidationIdentities,
    fallback: Arc<CertifiedKey>,
}

impl ValidationResolver {
    pub fn new(identities: ValidationIdentities, fallback: Arc<CertifiedKey>) -> Self {
        Self {
            identities,
            fallback,
        }
    }

    fn select(&self, server_name: Option<&str>, offers_acme_tls: bool) -> Arc<CertifiedKey> {
        if offers_acme_tls {
            if let Some(identity) = server_name.and_then(|name| self.identities.get(name)) {
                debug!(server_name = ?server_name, "Presenting validation identity");
                return identity;
            }
        }
        Arc::clone(&self.fallback)
    }
}

impl ResolvesServerCert for ValidationResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let offers_acme_tls = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);
        Some(self.select(client_hello.server_name(), offers_acme_tls))
    }
}

impl fmt::Debug for ValidationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationResolver")
            .field("pending", &self.identities.pending_count())
            .finish()
    }
}
