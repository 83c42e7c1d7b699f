//! Session-identity cache and handshake security status
//!
//! This module coordinates an external TLS engine on behalf of a host that
//! only holds opaque handles. The engine does the cryptography; this layer
//! owns the state around it.
//!
//! # Architecture
//!
//! 1. `SessionCache` stores resumable server sessions with a bounded size
//!    and per-entry expiry
//! 2. `HandshakeController` runs one state machine per `ConnectionHandle`
//!    and drives the engine through reset, credential setup and handshake
//! 3. `SecurityStatusReporter` turns negotiated parameters into a
//!    `SecurityStatusSnapshot`
//!
//! The engine sits behind the `TlsEngine` / `EngineConnection` traits. The
//! shipped implementation uses OpenSSL.
//!
//! # Examples
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tls_session::ssl::{
//!     credential, CacheConfig, HandshakeController, KeyAlgorithm, KeyExchange, SessionCache,
//! };
//!
//! let cache = Arc::new(SessionCache::new());
//! cache.configure(
//!     CacheConfig::builder()
//!         .max_entries(1000)
//!         .timeout(Duration::from_secs(3600))
//!         .build()
//!         .unwrap(),
//! ).unwrap();
//!
//! let controller = HandshakeController::new(cache.clone());
//! let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:8443").unwrap();
//! let (stream, _) = listener.accept().unwrap();
//! let handle = controller.import_fd(None, stream).unwrap();
//!
//! controller.reset_handshake(handle, true).unwrap();
//! controller.configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh).unwrap();
//! controller.force_handshake(handle).unwrap();
//!
//! let status = controller.reporter().query(handle).unwrap();
//! assert!(status.on);
//! ```

pub mod cache;
pub mod cert;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod global;
pub mod handle;
pub mod handshake;
pub mod openssl_engine;
pub mod status;

pub use cache::{CacheStats, CipherSuite, SessionCache, SessionCacheEntry, Sweeper};
pub use config::{CacheConfig, CacheConfigBuilder, KeyExchange, Role, SslOption, TlsVersion};
pub use credential::{Certificate, KeyAlgorithm, PrivateKey, ServerCredential};
pub use engine::{
    ConnectionSettings, EngineConnection, Interest, NegotiatedParams, NegotiatedSession,
    Progress, TlsEngine,
};
pub use error::SslError;
pub use handle::ConnectionHandle;
pub use handshake::{CancelToken, FailureReason, HandshakeController, HandshakeState};
pub use openssl_engine::{OpenSslConnection, OpenSslEngine};
pub use status::{SecurityStatusReporter, SecurityStatusSnapshot};

/// Result type for session and handshake operations
pub type Result<T> = std::result::Result<T, SslError>;
