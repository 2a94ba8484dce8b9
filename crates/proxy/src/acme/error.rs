//! ACME and storage error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors while reading or writing key and certificate material
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Refusing to overwrite existing file {0:?}")]
    AlreadyExists(PathBuf),

    #[error("Malformed PEM in {path:?}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::PemError,
    },

    #[error("No {label} block found in {path:?}")]
    MissingBlock { label: &'static str, path: PathBuf },

    #[error("Invalid private key in {path:?}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("Invalid certificate in {path:?}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("Certificate in {0:?} does not match the server key")]
    KeyMismatch(PathBuf),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while obtaining a certificate
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("ACME client error: {0}")]
    Client(#[from] instant_acme::Error),

    #[error("No supported challenge combination ({0})")]
    UnsupportedChallenge(String),

    #[error("Challenge validation failed: {0}")]
    ValidationFailed(String),

    #[error("Timed out after {0:?} waiting for the CA")]
    Timeout(Duration),

    #[error("Terms of service were not accepted")]
    TermsNotAccepted,

    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Validation listener error: {0}")]
    Listener(#[source] io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
