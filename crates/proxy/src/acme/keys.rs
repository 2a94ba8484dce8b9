//! Persistent RSA key pairs
//!
//! Keys live as `<name>.key` in the state directory, PEM encoded. A missing
//! key is generated once and written exclusively; an existing key is loaded
//! unchanged and never rotated.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use super::error::StorageError;
use super::storage::write_exclusive;

/// Modulus size of generated keys
pub const KEY_BITS: usize = 2048;

/// PEM label written for new keys
pub const RSA_KEY_LABEL: &str = "RSA PRIVATE KEY";

/// An RSA private key
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Generate a fresh 2048-bit key
    pub fn generate() -> Result<Self, StorageError> {
        let inner = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| StorageError::KeyGeneration(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Decode a key from the first private-key block of a PEM document
    ///
    /// Blocks are scanned in order; the first labeled `PRIVATE KEY` or
    /// ending in ` PRIVATE KEY` is used. PKCS#1 and PKCS#8 bodies are both
    /// accepted.
    pub fn from_pem(path: &Path, data: &[u8]) -> Result<Self, StorageError> {
        let blocks = pem::parse_many(data).map_err(|source| StorageError::Pem {
            path: path.to_path_buf(),
            source,
        })?;

        let block = blocks
            .iter()
            .find(|block| is_private_key_label(block.tag()))
            .ok_or_else(|| StorageError::MissingBlock {
                label: "PRIVATE KEY",
                path: path.to_path_buf(),
            })?;

        let inner = RsaPrivateKey::from_pkcs1_der(block.contents())
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(block.contents()))
            .map_err(|e| StorageError::InvalidKey {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(Self { inner })
    }

    /// PEM encoding with the `RSA PRIVATE KEY` label
    pub fn to_pem(&self) -> Result<String, StorageError> {
        let der = self.pkcs1_der()?;
        Ok(pem::encode(&pem::Pem::new(RSA_KEY_LABEL, der)))
    }

    /// PKCS#1 DER encoding
    pub fn pkcs1_der(&self) -> Result<Vec<u8>, StorageError> {
        self.inner
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| StorageError::KeyGeneration(e.to_string()))
    }

    /// The key in the form rustls consumes
    pub fn to_rustls(&self) -> Result<PrivateKeyDer<'static>, StorageError> {
        Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(
            self.pkcs1_der()?,
        )))
    }

    /// The key as an `rcgen` signer for certificates and signing requests
    pub fn signing_key(&self) -> Result<rcgen::KeyPair, rcgen::Error> {
        let pkcs8 = self
            .inner
            .to_pkcs8_der()
            .map_err(|_| rcgen::Error::CouldNotParseKeyPair)?;
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(pkcs8.as_bytes()),
            &rcgen::PKCS_RSA_SHA256,
        )
    }

    /// The underlying RSA key
    pub fn rsa(&self) -> &RsaPrivateKey {
        &self.inner
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &KEY_BITS)
            .finish_non_exhaustive()
    }
}

fn is_private_key_label(label: &str) -> bool {
    label == "PRIVATE KEY" || label.ends_with(" PRIVATE KEY")
}

/// Loads or creates named keys in the state directory
#[derive(Debug, Clone)]
pub struct KeyStore {
    state_dir: PathBuf,
}

impl KeyStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Path of a named key
    pub fn key_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.key"))
    }

    /// Load `<name>.key`, generating it on first run
    ///
    /// Only a missing file triggers generation. Unreadable or undecodable
    /// material is an error and is left untouched.
    pub fn load_or_create_key(&self, name: &str) -> Result<PrivateKey, StorageError> {
        let path = self.key_path(name);

        match fs::read(&path) {
            Ok(data) => {
                let key = PrivateKey::from_pem(&path, &data)?;
                debug!(path = %path.display(), "Loaded key");
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.create_key(&path),
            Err(e) => Err(e.into()),
        }
    }

    fn create_key(&self, path: &Path) -> Result<PrivateKey, StorageError> {
        info!(path = %path.display(), "No key found, generating");

        let key = PrivateKey::generate()?;
        // Fails if another writer got there first
        write_exclusive(path, key.to_pem()?.as_bytes())?;

        Ok(key)
    }
}
