//! Certificate and private key handles
//!
//! Hosts hand certificates and keys over as opaque values. Whether a pair
//! is usable for a given key exchange is decided by the engine when the
//! credential is configured on a connection.
//!
//! `self_signed` mints a throwaway credential for development and tests.

use super::config::KeyExchange;
use super::error::SslError;
use super::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};

/// X.509 certificate handle
#[derive(Clone)]
pub struct Certificate(pub(crate) X509);

impl Certificate {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        X509::from_pem(pem)
            .map(Certificate)
            .map_err(|e| SslError::InvalidCredential(format!("Failed to load certificate: {}", e)))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        X509::from_der(der)
            .map(Certificate)
            .map_err(|e| SslError::InvalidCredential(format!("Failed to load certificate: {}", e)))
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.0.to_der()?)
    }

    /// Subject distinguished name
    pub fn subject(&self) -> String {
        super::cert::distinguished_name(self.0.subject_name())
    }

    /// Issuer distinguished name
    pub fn issuer(&self) -> String {
        super::cert::distinguished_name(self.0.issuer_name())
    }

    pub fn as_x509(&self) -> &X509 {
        &self.0
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Certificate").field(&self.subject()).finish()
    }
}

/// Private key handle
#[derive(Clone)]
pub struct PrivateKey(pub(crate) PKey<Private>);

impl PrivateKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        PKey::private_key_from_pem(pem)
            .map(PrivateKey)
            .map_err(|e| SslError::InvalidCredential(format!("Failed to load private key: {}", e)))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        PKey::private_key_from_der(der)
            .map(PrivateKey)
            .map_err(|e| SslError::InvalidCredential(format!("Failed to load private key: {}", e)))
    }

    pub fn as_pkey(&self) -> &PKey<Private> {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").field(&self.0.id()).finish()
    }
}

/// Certificate, key and key-exchange kind configured on a server connection
#[derive(Debug, Clone)]
pub struct ServerCredential {
    pub certificate: Certificate,
    pub private_key: PrivateKey,
    pub key_exchange: KeyExchange,
}

/// Key type for generated credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    EcP256,
}

/// Generate a self-signed certificate and its key
///
/// The certificate is valid for one year, carries `common_name` as both
/// subject and issuer CN, and lists it as a DNS subject alternative name.
pub fn self_signed(common_name: &str, algorithm: KeyAlgorithm) -> Result<(Certificate, PrivateKey)> {
    let key = match algorithm {
        KeyAlgorithm::Rsa2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
        KeyAlgorithm::EcP256 => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
    };

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let san = SubjectAlternativeName::new()
        .dns(common_name)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;

    Ok((Certificate(builder.build()), PrivateKey(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_ec() {
        let (cert, key) = self_signed("localhost", KeyAlgorithm::EcP256).unwrap();
        assert_eq!(cert.subject(), "CN=localhost");
        assert_eq!(cert.issuer(), "CN=localhost");
        assert!(cert.as_x509().public_key().unwrap().public_eq(key.as_pkey()));
    }

    #[test]
    fn test_pem_round_trip() {
        let (cert, key) = self_signed("example.com", KeyAlgorithm::EcP256).unwrap();
        let cert_pem = cert.as_x509().to_pem().unwrap();
        let key_pem = key.as_pkey().private_key_to_pem_pkcs8().unwrap();

        let cert = Certificate::from_pem(&cert_pem).unwrap();
        let key = PrivateKey::from_pem(&key_pem).unwrap();
        assert_eq!(cert.subject(), "CN=example.com");
        assert_eq!(key.as_pkey().id(), openssl::pkey::Id::EC);
    }

    #[test]
    fn test_malformed_pem_rejected() {
        assert!(matches!(
            Certificate::from_pem(b"not a certificate"),
            Err(SslError::InvalidCredential(_))
        ));
        assert!(matches!(
            PrivateKey::from_der(&[0x30, 0x00]),
            Err(SslError::InvalidCredential(_))
        ));
    }
}
