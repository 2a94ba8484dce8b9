//! Certificate and account storage
//!
//! Persists the CA-issued certificate chain and the ACME account credentials
//! in the state directory.
//!
//! # Directory Structure
//!
//! ```text
//! state/
//! ├── server.key     # Server private key (see `KeyStore`)
//! ├── server.crt     # Certificate chain, leaf first
//! └── account.json   # ACME account credentials (opaque, serialized)
//! ```
//!
//! Every file is created exclusively: an existing file is never truncated.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rsa::traits::PublicKeyParts;
use rsa::BigUint;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, trace};
use tempfile::NamedTempFile;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

use lecat_config::{ACCOUNT_FILE, SERVER_CERT_FILE};

use super::acquire::{AcquireCertificate, Acquired};
use super::error::{AcmeError, StorageError};
use super::keys::PrivateKey;
use super::responder::PortReleased;

/// PEM label of certificate blocks
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// A certificate chain, leaf first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<CertificateDer<'static>>,
}

impl CertificateChain {
    /// Build a chain from DER certificates
    ///
    /// Returns `None` for an empty chain.
    pub fn new(certs: Vec<CertificateDer<'static>>) -> Option<Self> {
        if certs.is_empty() {
            None
        } else {
            Some(Self { certs })
        }
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    /// All certificates, leaf first
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Encode the chain as consecutive `CERTIFICATE` blocks
    pub fn to_pem(&self) -> String {
        let blocks: Vec<pem::Pem> = self
            .certs
            .iter()
            .map(|der| pem::Pem::new(CERTIFICATE_LABEL, der.as_ref().to_vec()))
            .collect();
        pem::encode_many(&blocks)
    }

    /// Decode the `CERTIFICATE` blocks of a PEM document
    ///
    /// The first certificate block is the leaf; other labels are skipped.
    pub fn from_pem(path: &Path, data: &[u8]) -> Result<Self, StorageError> {
        let blocks = pem::parse_many(data).map_err(|source| StorageError::Pem {
            path: path.to_path_buf(),
            source,
        })?;

        let certs: Vec<CertificateDer<'static>> = blocks
            .into_iter()
            .filter(|block| block.tag() == CERTIFICATE_LABEL)
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect();

        let chain = Self::new(certs).ok_or_else(|| StorageError::MissingBlock {
            label: CERTIFICATE_LABEL,
            path: path.to_path_buf(),
        })?;

        X509Certificate::from_der(chain.leaf()).map_err(|e| {
            StorageError::InvalidCertificate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        Ok(chain)
    }

    /// Check that the leaf certifies the given key
    pub fn matches_key(&self, key: &PrivateKey) -> bool {
        let Ok((_, cert)) = X509Certificate::from_der(self.leaf()) else {
            return false;
        };
        match cert.public_key().parsed() {
            Ok(PublicKey::RSA(rsa)) => {
                BigUint::from_bytes_be(rsa.modulus) == *key.rsa().n()
                    && BigUint::from_bytes_be(rsa.exponent) == *key.rsa().e()
            }
            _ => false,
        }
    }
}

/// Write a new file with owner-only permissions, failing if it exists
pub(crate) fn write_exclusive(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    write_exclusive_with(path, |file| file.write_all(contents))
}

/// Stage `fill`'s output next to `path` and publish it only once complete
///
/// A failed write leaves neither `path` nor the staging file behind.
fn write_exclusive_with<F>(path: &Path, fill: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    // Staging files are created 0600
    let mut staged = NamedTempFile::new_in(dir)?;
    fill(staged.as_file_mut())?;
    staged.as_file().sync_all()?;

    staged.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            StorageError::AlreadyExists(path.to_path_buf())
        } else {
            StorageError::Io(e.error)
        }
    })?;
    Ok(())
}

/// Certificate storage manager
///
/// Handles persistent storage of the certificate chain and the ACME
/// account credentials under a directory with restrictive permissions.
#[derive(Debug)]
pub struct CertificateStore {
    /// Base storage directory
    base_path: PathBuf,
}

impl CertificateStore {
    /// Create a new certificate store at the given path
    ///
    /// Creates the directory with restrictive permissions (0700 on Unix) if
    /// it doesn't exist. An existing directory is left as the operator set it.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        if !base_path.is_dir() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);

            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }

            builder.create(base_path)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the persisted certificate chain
    pub fn cert_path(&self) -> PathBuf {
        self.base_path.join(SERVER_CERT_FILE)
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join(ACCOUNT_FILE);

        match fs::read_to_string(&creds_path) {
            Ok(content) => {
                debug!("Loaded ACME credentials JSON");
                Ok(Some(content))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No stored ACME credentials found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let creds_path = self.base_path.join(ACCOUNT_FILE);
        write_exclusive(&creds_path, json.as_bytes())?;
        info!(path = %creds_path.display(), "Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Load the stored certificate chain
    ///
    /// Returns `Ok(None)` only when the file does not exist; every other
    /// read or decode failure is an error. A chain whose leaf does not
    /// certify `server_key` is rejected.
    pub fn load_certificate(
        &self,
        server_key: &PrivateKey,
    ) -> Result<Option<CertificateChain>, StorageError> {
        let cert_path = self.cert_path();

        let data = match fs::read(&cert_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %cert_path.display(), "No stored certificate found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let chain = CertificateChain::from_pem(&cert_path, &data)?;
        if !chain.matches_key(server_key) {
            return Err(StorageError::KeyMismatch(cert_path));
        }

        debug!(
            path = %cert_path.display(),
            chain_len = chain.certs().len(),
            "Loaded stored certificate"
        );
        Ok(Some(chain))
    }

    /// Persist a certificate chain, never overwriting an existing one
    pub fn save_certificate(&self, chain: &CertificateChain) -> Result<(), StorageError> {
        let cert_path = self.cert_path();
        write_exclusive(&cert_path, chain.to_pem().as_bytes())?;

        info!(
            path = %cert_path.display(),
            chain_len = chain.certs().len(),
            "Saved certificate to storage"
        );
        Ok(())
    }

    /// Load the stored certificate or obtain and persist a new one
    ///
    /// The returned [`PortReleased`] proves that no validation listener is
    /// still holding the listen address.
    pub async fn load_or_acquire_certificate<A>(
        &self,
        server_key: &PrivateKey,
        acquirer: &mut A,
    ) -> Result<(CertificateChain, PortReleased), AcmeError>
    where
        A: AcquireCertificate + ?Sized,
    {
        if let Some(chain) = self.load_certificate(server_key)? {
            return Ok((chain, PortReleased::new()));
        }

        info!(
            path = %self.cert_path().display(),
            "No certificate found, requesting"
        );

        let Acquired { chain, released } = acquirer.acquire(server_key).await?;
        self.save_certificate(&chain)?;

        Ok((chain, released))
    }
}
