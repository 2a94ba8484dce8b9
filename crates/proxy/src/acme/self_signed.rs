//! Self-signed bootstrap certificates
//!
//! Served during domain validation to every client that is not the CA
//! validator, and usable as a stand-in identity before a CA-issued
//! certificate exists.

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use super::error::AcmeError;
use super::keys::PrivateKey;
use super::storage::CertificateChain;

/// Validity on either side of "now", absorbing clock skew with the validator
pub const SELF_SIGNED_SKEW: Duration = Duration::hours(24);

/// Create a self-signed certificate for `hostname` valid from 24 hours ago
/// to 24 hours from now
pub fn self_signed(key: &PrivateKey, hostname: &str) -> Result<CertificateChain, AcmeError> {
    self_signed_at(key, hostname, OffsetDateTime::now_utc())
}

/// Same as [`self_signed`] with an explicit "now"
pub fn self_signed_at(
    key: &PrivateKey,
    hostname: &str,
    now: OffsetDateTime,
) -> Result<CertificateChain, AcmeError> {
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, "self-signed");
    params.distinguished_name = distinguished_name;

    params.serial_number = Some(random_serial());
    params.not_before = now - SELF_SIGNED_SKEW;
    params.not_after = now + SELF_SIGNED_SKEW;
    // Some validators insist on a CA bit even for self-signed leaves
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let signer = key.signing_key()?;
    let cert = params.self_signed(&signer)?;

    CertificateChain::new(vec![CertificateDer::from(cert.der().to_vec())]).ok_or_else(|| {
        AcmeError::Protocol("self-signed certificate produced an empty chain".to_string())
    })
}

/// Uniform over [0, 2^128)
fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    SerialNumber::from_slice(&bytes)
}
