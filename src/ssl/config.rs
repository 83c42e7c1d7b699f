//! Session cache and connection configuration
//!
//! This module provides the cache configuration builder and the small
//! value types a host passes in when it configures connections.

use super::error::SslError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default maximum number of cached sessions
pub const DEFAULT_MAX_ENTRIES: u32 = 10_000;

/// Default session lifetime
pub const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Default lifetime for SSL 3.0 through TLS 1.2 sessions
pub const DEFAULT_ALT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Longest lifetime a cached session can get
pub const MAX_SESSION_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// SSL 3.0 (deprecated, rarely used)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Ssl3 => SslVersion::SSL3,
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Versions that resume through a server session-ID cache
    pub fn uses_legacy_session_id(&self) -> bool {
        *self < TlsVersion::Tls13
    }
}

impl FromStr for TlsVersion {
    type Err = SslError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SSLV3" | "SSL3" => Ok(TlsVersion::Ssl3),
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(SslError::InvalidConfig(format!("unknown TLS version: {}", s))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn from_server_flag(as_server: bool) -> Self {
        if as_server {
            Role::Server
        } else {
            Role::Client
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

/// Per-connection boolean options
///
/// Raw values follow the NSS `SSL_OptionSet` numbering so a binding layer
/// can pass them through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SslOption {
    /// Ask the peer for a certificate (server role)
    RequestCertificate,
    /// Do not read from or write to the session cache
    NoCache,
    /// Fail the handshake if the peer sends no certificate (server role)
    RequireCertificate,
    /// Allow stateless session tickets
    EnableSessionTickets,
}

impl SslOption {
    pub fn from_raw(option: i32) -> Result<Self, SslError> {
        match option {
            3 => Ok(SslOption::RequestCertificate),
            9 => Ok(SslOption::NoCache),
            10 => Ok(SslOption::RequireCertificate),
            18 => Ok(SslOption::EnableSessionTickets),
            other => Err(SslError::InvalidConfig(format!("unsupported option: {}", other))),
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            SslOption::RequestCertificate => 3,
            SslOption::NoCache => 9,
            SslOption::RequireCertificate => 10,
            SslOption::EnableSessionTickets => 18,
        }
    }
}

/// Key exchange family a server credential is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    /// Let the engine infer the family from the key
    Null,
    /// RSA key transport or RSA-signed exchange
    Rsa,
    /// Finite-field Diffie-Hellman signed with an RSA or DSA key
    Dh,
    /// Elliptic-curve Diffie-Hellman with an EC key
    Ecdh,
}

impl KeyExchange {
    /// Map an NSS `SSLKEAType` value
    pub fn from_raw(kea: i32) -> Result<Self, SslError> {
        match kea {
            0 => Ok(KeyExchange::Null),
            1 => Ok(KeyExchange::Rsa),
            2 => Ok(KeyExchange::Dh),
            4 => Ok(KeyExchange::Ecdh),
            other => Err(SslError::InvalidConfig(format!(
                "unsupported key exchange kind: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyExchange::Null => "null",
            KeyExchange::Rsa => "rsa",
            KeyExchange::Dh => "dh",
            KeyExchange::Ecdh => "ecdh",
        }
    }
}

impl fmt::Display for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session cache configuration (immutable after building)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub(crate) max_entries: u32,
    pub(crate) timeout: Duration,
    pub(crate) alt_timeout: Duration,
    pub(crate) storage_directory: Option<PathBuf>,
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Lifetime of TLS 1.3 sessions and sessions of unknown version
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lifetime of SSL 3.0 through TLS 1.2 sessions
    pub fn alt_timeout(&self) -> Duration {
        self.alt_timeout
    }

    pub fn storage_directory(&self) -> Option<&Path> {
        self.storage_directory.as_deref()
    }

    /// Lifetime applied to a session negotiated at `protocol`
    pub fn lifetime_for(&self, protocol: Option<TlsVersion>) -> Duration {
        match protocol {
            Some(version) if version.uses_legacy_session_id() => self.alt_timeout,
            _ => self.timeout,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: DEFAULT_MAX_ENTRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            alt_timeout: Duration::from_secs(DEFAULT_ALT_TIMEOUT_SECS),
            storage_directory: None,
        }
    }
}

/// Cache configuration builder
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    fn new() -> Self {
        CacheConfigBuilder::default()
    }

    /// Maximum number of sessions held at once
    pub fn max_entries(mut self, max_entries: u32) -> Self {
        self.config.max_entries = max_entries;
        self
    }

    /// Lifetime of TLS 1.3 sessions
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Lifetime of SSL 3.0 through TLS 1.2 sessions
    pub fn alt_timeout(mut self, alt_timeout: Duration) -> Self {
        self.config.alt_timeout = alt_timeout;
        self
    }

    /// Directory handed to the engine for persisted cache state
    pub fn storage_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_directory = Some(path.into());
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> Result<CacheConfig, SslError> {
        let config = self.config;
        if config.max_entries == 0 {
            return Err(SslError::InvalidConfig(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        if config.timeout.is_zero() {
            return Err(SslError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if config.alt_timeout.is_zero() {
            return Err(SslError::InvalidConfig(
                "alt_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}
