//! Error types for cache configuration and handshake control
//!
//! Every error is returned to the immediate caller. Engine failures keep the
//! native code so the binding layer can report it unchanged.

use super::handle::ConnectionHandle;
use std::path::PathBuf;

/// Session cache and handshake errors
#[derive(Debug, thiserror::Error)]
pub enum SslError {
    /// Handle is unknown, or the connection was already closed
    #[error("Invalid connection handle: {0}")]
    InvalidHandle(ConnectionHandle),

    /// Operation needs a server-role handshake in a configurable state
    #[error("Operation requires a server-role handshake that has been reset")]
    WrongRole,

    /// Certificate or private key rejected by the engine
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Status requested before the handshake completed
    #[error("Handshake not established")]
    NotEstablished,

    /// Session cache was already configured successfully
    #[error("Session cache already configured")]
    AlreadyConfigured,

    /// Storage directory missing, not a directory, or not writable
    #[error("Storage directory unavailable: {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Handshake aborted through a cancel token
    #[error("Handshake cancelled")]
    Cancelled,

    /// Handshake did not finish before the caller's deadline
    #[error("Handshake timed out")]
    Timeout,

    /// Failure reported by the TLS engine, code preserved as-is
    #[error("TLS engine failure (code {code}): {message}")]
    EngineFailure { code: i64, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current handshake state
    #[error("Invalid handshake state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SslError {
    /// Native engine code, if this error came from the engine
    pub fn native_code(&self) -> Option<i64> {
        match self {
            SslError::EngineFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for SslError {
    fn from(stack: openssl::error::ErrorStack) -> Self {
        let code = stack
            .errors()
            .first()
            .map(|e| e.code() as i64)
            .unwrap_or_default();
        SslError::EngineFailure {
            code,
            message: stack.to_string(),
        }
    }
}
