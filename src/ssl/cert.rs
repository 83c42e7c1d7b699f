//! Certificate naming helpers
//!
//! This module renders X.509 names for status reporting and extracts the
//! identity of a connection's peer.

use bytes::Bytes;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref};

/// Peer identity as reported after a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// DER encoding of the peer certificate
    pub der: Bytes,
}

impl PeerIdentity {
    pub fn from_x509(cert: &X509Ref) -> Option<Self> {
        let der = cert.to_der().ok()?;
        Some(PeerIdentity {
            subject: distinguished_name(cert.subject_name()),
            issuer: distinguished_name(cert.issuer_name()),
            der: Bytes::from(der),
        })
    }
}

/// Render a name as comma-separated `SN=value` pairs in certificate order
///
/// Values are converted to UTF-8 in full; invalid sequences become U+FFFD.
pub fn distinguished_name(name: &X509NameRef) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().to_string().ok()?;
            Some(format!("{}={}", key, value))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Identity of the peer on an established connection, if it sent a certificate
pub fn peer_identity(ssl: &SslRef) -> Option<PeerIdentity> {
    let cert = ssl.peer_certificate()?;
    PeerIdentity::from_x509(&cert)
}
