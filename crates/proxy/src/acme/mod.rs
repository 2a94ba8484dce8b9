//! ACME certificate acquisition
//!
//! Obtains a CA-issued certificate for the configured hostname on first run
//! and persists it, together with the server key and account credentials,
//! in the state directory. Later runs load everything from disk.
//!
//! # Architecture
//!
//! - [`KeyStore`] - Loads or generates named RSA keys
//! - [`CertificateStore`] - Persists the certificate chain and account credentials
//! - [`AcmeClient`] - Wrapper around `instant-acme` for ACME protocol operations
//! - [`Acquirer`] - Runs one issuance, including domain validation
//! - [`ValidationListener`] - Temporary TLS responder for TLS-ALPN-01
//!
//! # Challenge Flow
//!
//! When no certificate is stored:
//!
//! 1. [`AcmeClient`] registers (or reloads) the account
//! 2. An order is created and its authorization inspected
//! 3. The single usable `tls-alpn-01` challenge is selected
//! 4. [`ValidationListener`] binds the listen address and presents the
//!    `acmeIdentifier` certificate to clients offering `acme-tls/1`
//! 5. The CA validates; the listener is shut down either way
//! 6. A CSR signed by the server key is submitted and the chain returned
//! 7. [`CertificateStore`] persists the chain
//!
//! Only after step 5 can the production listener bind, which
//! [`PortReleased`] enforces.

mod acquire;
pub mod challenge;
mod client;
mod error;
mod keys;
mod responder;
mod self_signed;
mod storage;

pub use acquire::{certificate_request, AcquireCertificate, Acquired, Acquirer};
pub use challenge::{Authorization, Challenge, ChallengeKind};
pub use client::{AcmeClient, CertificateAuthority};
pub use error::{AcmeError, StorageError};
pub use keys::{KeyStore, PrivateKey};
pub use responder::{PortReleased, ValidationListener};
pub use self_signed::{self_signed, self_signed_at};
pub use storage::{CertificateChain, CertificateStore};
