//! Security status of established connections
//!
//! A snapshot is built from the parameters the engine negotiated. Queries
//! only take the per-connection status read lock, so they run alongside
//! each other and never wait for an engine step.

use super::config::TlsVersion;
use super::engine::NegotiatedParams;
use super::error::SslError;
use super::handle::{ConnectionHandle, HandleTable};
use super::handshake::{Connection, HandshakeState};
use super::Result;
use std::sync::Arc;

/// Security parameters of an established connection
///
/// The default value describes a connection that is not secured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityStatusSnapshot {
    /// Whether the connection is secured
    pub on: bool,

    /// Negotiated cipher name
    pub cipher: Option<String>,

    /// Cipher key size in bits
    pub key_size: u32,

    /// Effective secret key size in bits
    pub secret_key_size: u32,

    /// Peer certificate issuer
    pub issuer: Option<String>,

    /// Peer certificate subject
    pub subject: Option<String>,

    pub protocol: Option<TlsVersion>,

    /// Whether the session was resumed from the cache
    pub resumed: bool,
}

impl SecurityStatusSnapshot {
    pub fn from_negotiated(params: &NegotiatedParams) -> Self {
        let peer = params.peer.as_ref();
        SecurityStatusSnapshot {
            on: true,
            cipher: params.cipher.clone(),
            key_size: params.key_size,
            secret_key_size: params.secret_key_size,
            issuer: peer.map(|p| p.issuer.clone()),
            subject: peer.map(|p| p.subject.clone()),
            protocol: params.protocol,
            resumed: params.resumed,
        }
    }

    /// Get a field by name, rendered for host bindings
    pub fn get(&self, name: &str) -> Option<String> {
        let undef = || "<undef>".to_string();
        match name {
            "on" => Some(self.on.to_string()),
            "cipher" => Some(self.cipher.clone().unwrap_or_else(undef)),
            "key_size" => Some(self.key_size.to_string()),
            "secret_key_size" => Some(self.secret_key_size.to_string()),
            "issuer" => Some(self.issuer.clone().unwrap_or_else(undef)),
            "subject" => Some(self.subject.clone().unwrap_or_else(undef)),
            "protocol" => Some(
                self.protocol
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(undef),
            ),
            "resumed" => Some(self.resumed.to_string()),
            _ => None,
        }
    }
}

/// Reads security status for a controller's connections
#[derive(Clone)]
pub struct SecurityStatusReporter {
    connections: Arc<HandleTable<Connection>>,
}

impl SecurityStatusReporter {
    pub(crate) fn new(connections: Arc<HandleTable<Connection>>) -> Self {
        SecurityStatusReporter { connections }
    }

    /// Snapshot of an established connection
    pub fn query(&self, handle: ConnectionHandle) -> Result<SecurityStatusSnapshot> {
        let conn = self
            .connections
            .get(handle)
            .ok_or(SslError::InvalidHandle(handle))?;
        let status = conn.status();

        match (&status.state, &status.negotiated) {
            (HandshakeState::Established, Some(params)) => {
                Ok(SecurityStatusSnapshot::from_negotiated(params))
            }
            _ => Err(SslError::NotEstablished),
        }
    }
}

impl std::fmt::Debug for SecurityStatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityStatusReporter")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::cert::PeerIdentity;
    use bytes::Bytes;

    #[test]
    fn test_default_snapshot_is_off() {
        let snapshot = SecurityStatusSnapshot::default();
        assert!(!snapshot.on);
        assert_eq!(snapshot.get("on"), Some("false".to_string()));
        assert_eq!(snapshot.get("cipher"), Some("<undef>".to_string()));
        assert_eq!(snapshot.get("protocol"), Some("<undef>".to_string()));
    }

    #[test]
    fn test_snapshot_from_negotiated() {
        let params = NegotiatedParams {
            protocol: Some(TlsVersion::Tls13),
            cipher: Some("TLS_AES_256_GCM_SHA384".to_string()),
            key_size: 256,
            secret_key_size: 256,
            peer: Some(PeerIdentity {
                subject: "CN=client.example".to_string(),
                issuer: "O=Example CA".to_string(),
                der: Bytes::new(),
            }),
            ..Default::default()
        };

        let snapshot = SecurityStatusSnapshot::from_negotiated(&params);
        assert!(snapshot.on);
        assert_eq!(snapshot.get("cipher"), Some("TLS_AES_256_GCM_SHA384".to_string()));
        assert_eq!(snapshot.get("key_size"), Some("256".to_string()));
        assert_eq!(snapshot.get("subject"), Some("CN=client.example".to_string()));
        assert_eq!(snapshot.get("issuer"), Some("O=Example CA".to_string()));
        assert_eq!(snapshot.get("protocol"), Some("TLSv1.3".to_string()));
        assert_eq!(snapshot.get("resumed"), Some("false".to_string()));
        assert_eq!(snapshot.get("alpn"), None);
    }

    #[test]
    fn test_unauthenticated_peer_has_no_names() {
        let params = NegotiatedParams {
            cipher: Some("ECDHE-RSA-AES128-GCM-SHA256".to_string()),
            key_size: 128,
            secret_key_size: 128,
            ..Default::default()
        };

        let snapshot = SecurityStatusSnapshot::from_negotiated(&params);
        assert!(snapshot.issuer.is_none());
        assert!(snapshot.subject.is_none());
    }

    #[test]
    fn test_query_unknown_handle() {
        let reporter = SecurityStatusReporter::new(Arc::new(HandleTable::new()));
        let handle = ConnectionHandle::from_raw(7);
        assert!(matches!(
            reporter.query(handle),
            Err(SslError::InvalidHandle(h)) if h == handle
        ));
    }
}
