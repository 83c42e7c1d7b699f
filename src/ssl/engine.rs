//! TLS engine seam
//!
//! The controller never touches cryptography. It asks an `EngineConnection`
//! to start, advance and report on a handshake, and waits on the transport
//! when the engine needs more I/O.

use super::cache::CipherSuite;
use super::cert::PeerIdentity;
use super::config::{Role, SslOption, TlsVersion};
use super::credential::ServerCredential;
use super::Result;
use bytes::Bytes;
use std::collections::HashSet;
use std::net::TcpStream;
use std::time::Duration;

/// Outcome of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Handshake finished
    Complete,
    /// Engine needs the transport to become readable
    WantRead,
    /// Engine needs the transport to become writable
    WantWrite,
}

/// Transport readiness to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Session the engine created or resumed during a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub id: Bytes,
    /// Serialized session the engine can resume from
    pub state: Option<Bytes>,
}

/// Parameters of an established connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub protocol: Option<TlsVersion>,
    pub cipher: Option<String>,
    pub cipher_suite: Option<CipherSuite>,
    /// Cipher key size in bits
    pub key_size: u32,
    /// Effective secret key size in bits
    pub secret_key_size: u32,
    /// Peer certificate identity, absent for unauthenticated peers
    pub peer: Option<PeerIdentity>,
    pub session: Option<NegotiatedSession>,
    pub resumed: bool,
}

/// Per-connection settings the engine applies when a handshake begins
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub options: HashSet<SslOption>,
    /// Opaque peer name handed to the engine
    pub url: Option<String>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub credential: Option<ServerCredential>,
}

impl ConnectionSettings {
    pub fn is_enabled(&self, option: SslOption) -> bool {
        self.options.contains(&option)
    }

    pub fn set(&mut self, option: SslOption, enabled: bool) {
        if enabled {
            self.options.insert(option);
        } else {
            self.options.remove(&option);
        }
    }
}

/// One connection inside the external TLS engine
pub trait EngineConnection: Send {
    /// Check that a certificate/key pair is usable for its key exchange kind
    fn validate_credential(&self, credential: &ServerCredential) -> Result<()>;

    /// Discard any previous handshake and prepare a new one
    fn begin(&mut self, role: Role, settings: &ConnectionSettings) -> Result<()>;

    /// Advance the handshake without blocking
    fn step(&mut self) -> Result<Progress>;

    /// Block until the transport is ready or `timeout` elapses
    ///
    /// Returns true if the transport became ready.
    fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<bool>;

    /// Negotiated parameters, once the handshake is complete
    fn negotiated(&self) -> Option<NegotiatedParams>;

    /// Session id assigned so far, complete or not
    fn session_id(&self) -> Option<Bytes>;

    /// Drop in-flight handshake state
    fn abort(&mut self);

    /// Close the connection
    fn shutdown(&mut self);
}

/// Factory wrapping transports into engine connections
pub trait TlsEngine: Send + Sync {
    fn import(&self, stream: TcpStream) -> Result<Box<dyn EngineConnection>>;
}
