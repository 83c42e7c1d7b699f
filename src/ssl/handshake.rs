//! Handshake state machine
//!
//! Every connection moves through
//! `Unconfigured -> Reset -> InProgress -> Established | Failed`.
//! A new reset restarts the machine from any state.
//!
//! `force_handshake` runs on the caller's thread. Between engine steps it
//! sleeps in `poll(2)` for at most `POLL_SLICE`, and checks the cancel token
//! and deadline after each wait. It always leaves the connection in a
//! terminal state, never in `InProgress`.

use super::cache::{CipherSuite, SessionCache, SessionCacheEntry};
use super::config::{KeyExchange, Role, SslOption, TlsVersion};
use super::credential::{Certificate, PrivateKey, ServerCredential};
use super::engine::{
    ConnectionSettings, EngineConnection, Interest, NegotiatedParams, Progress, TlsEngine,
};
use super::error::SslError;
use super::handle::{ConnectionHandle, HandleTable};
use super::openssl_engine::OpenSslEngine;
use super::status::SecurityStatusReporter;
use super::Result;
use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Longest single wait between cancel/deadline checks
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Why a handshake attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Cancelled,
    TimedOut,
    /// Engine error with its native code
    Engine { code: i64, message: String },
}

impl FailureReason {
    fn from_error(err: SslError) -> Self {
        match err {
            SslError::Cancelled => FailureReason::Cancelled,
            SslError::Timeout => FailureReason::TimedOut,
            SslError::EngineFailure { code, message } => FailureReason::Engine { code, message },
            other => FailureReason::Engine {
                code: 0,
                message: other.to_string(),
            },
        }
    }

    /// Error returned to the caller for this failure
    pub fn to_error(&self) -> SslError {
        match self {
            FailureReason::Cancelled => SslError::Cancelled,
            FailureReason::TimedOut => SslError::Timeout,
            FailureReason::Engine { code, message } => SslError::EngineFailure {
                code: *code,
                message: message.clone(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::TimedOut => f.write_str("timed out"),
            FailureReason::Engine { code, message } => write!(f, "engine error {}: {}", code, message),
        }
    }
}

/// Handshake state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Unconfigured,
    Reset { as_server: bool },
    InProgress,
    Established,
    Failed(FailureReason),
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Unconfigured => f.write_str("unconfigured"),
            HandshakeState::Reset { as_server: true } => f.write_str("reset (server)"),
            HandshakeState::Reset { as_server: false } => f.write_str("reset (client)"),
            HandshakeState::InProgress => f.write_str("in progress"),
            HandshakeState::Established => f.write_str("established"),
            HandshakeState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Cancels an in-flight handshake from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Observable part of a connection, readable while a handshake runs
pub(crate) struct StatusCell {
    pub(crate) state: HandshakeState,
    pub(crate) negotiated: Option<NegotiatedParams>,
}

struct Driver {
    engine: Box<dyn EngineConnection>,
    settings: ConnectionSettings,
    role: Option<Role>,
}

/// Per-handle record; lock order is `driver` then `status`
pub(crate) struct Connection {
    status: RwLock<StatusCell>,
    driver: Mutex<Driver>,
    cancel: CancelToken,
}

impl Connection {
    fn new(engine: Box<dyn EngineConnection>, settings: ConnectionSettings) -> Self {
        Connection {
            status: RwLock::new(StatusCell {
                state: HandshakeState::Unconfigured,
                negotiated: None,
            }),
            driver: Mutex::new(Driver {
                engine,
                settings,
                role: None,
            }),
            cancel: CancelToken::default(),
        }
    }

    pub(crate) fn status(&self) -> RwLockReadGuard<'_, StatusCell> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> HandshakeState {
        self.status().state.clone()
    }

    fn set_status(&self, state: HandshakeState, negotiated: Option<NegotiatedParams>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.state = state;
        status.negotiated = negotiated;
    }

    fn driver(&self) -> MutexGuard<'_, Driver> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives handshakes for a set of connections
///
/// The controller is `Sync`: different handles can be driven from different
/// threads at once. Calls on the same handle are serialized.
pub struct HandshakeController {
    connections: Arc<HandleTable<Connection>>,
    cache: Arc<SessionCache>,
    engine: Arc<dyn TlsEngine>,
    handshake_timeout: Duration,
}

impl HandshakeController {
    /// Create a controller using the OpenSSL engine
    pub fn new(cache: Arc<SessionCache>) -> Self {
        let engine = Arc::new(OpenSslEngine::new(cache.clone()));
        HandshakeController::with_engine(cache, engine)
    }

    /// Create a controller using a custom engine
    pub fn with_engine(cache: Arc<SessionCache>, engine: Arc<dyn TlsEngine>) -> Self {
        HandshakeController {
            connections: Arc::new(HandleTable::new()),
            cache,
            engine,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    /// Set the timeout used by `force_handshake`
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Status reader sharing this controller's connections
    pub fn reporter(&self) -> SecurityStatusReporter {
        SecurityStatusReporter::new(self.connections.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn connection(&self, handle: ConnectionHandle) -> Result<Arc<Connection>> {
        self.connections
            .get(handle)
            .ok_or(SslError::InvalidHandle(handle))
    }

    /// Wrap a transport in a new connection
    ///
    /// With a `model`, the new connection starts with a copy of the model's
    /// options, URL, version range and server credential.
    pub fn import_fd(
        &self,
        model: Option<ConnectionHandle>,
        stream: TcpStream,
    ) -> Result<ConnectionHandle> {
        let settings = self.model_settings(model)?;
        let engine = self.engine.import(stream)?;
        Ok(self.insert(engine, settings))
    }

    /// Register an engine connection built outside the controller
    pub fn register(
        &self,
        model: Option<ConnectionHandle>,
        engine: Box<dyn EngineConnection>,
    ) -> Result<ConnectionHandle> {
        let settings = self.model_settings(model)?;
        Ok(self.insert(engine, settings))
    }

    fn model_settings(&self, model: Option<ConnectionHandle>) -> Result<ConnectionSettings> {
        let Some(handle) = model else {
            return Ok(ConnectionSettings::default());
        };
        let conn = self.connection(handle)?;
        let settings = conn.driver().settings.clone();
        Ok(settings)
    }

    fn insert(&self, engine: Box<dyn EngineConnection>, settings: ConnectionSettings) -> ConnectionHandle {
        let handle = self.connections.insert(Connection::new(engine, settings));
        tracing::debug!("{}: connection imported", handle);
        handle
    }

    /// Current state of a connection
    pub fn state(&self, handle: ConnectionHandle) -> Result<HandshakeState> {
        Ok(self.connection(handle)?.state())
    }

    /// Restart the handshake in the given role
    ///
    /// Valid from any state. Negotiated parameters and in-flight engine
    /// state are discarded; cached sessions are kept.
    pub fn reset_handshake(&self, handle: ConnectionHandle, as_server: bool) -> Result<()> {
        let conn = self.connection(handle)?;
        let mut driver = conn.driver();

        driver.engine.abort();
        driver.role = Some(Role::from_server_flag(as_server));
        conn.cancel.clear();
        conn.set_status(HandshakeState::Reset { as_server }, None);

        tracing::debug!("{}: handshake reset (as_server={})", handle, as_server);
        Ok(())
    }

    /// Install the server certificate and key for the next handshake
    ///
    /// Valid for a server role in `Reset` or `InProgress`. A handshake holds
    /// the connection for its whole run, so a concurrent call waits for it to
    /// finish and then sees the terminal state.
    pub fn configure_secure_server(
        &self,
        handle: ConnectionHandle,
        certificate: &Certificate,
        private_key: &PrivateKey,
        key_exchange: KeyExchange,
    ) -> Result<()> {
        let conn = self.connection(handle)?;
        let mut driver = conn.driver();

        let server = match conn.state() {
            HandshakeState::Reset { as_server } => as_server,
            // Only reachable if a handshake unwound without a terminal state
            HandshakeState::InProgress => driver.role.map(|r| r.is_server()).unwrap_or(false),
            _ => false,
        };
        if !server {
            return Err(SslError::WrongRole);
        }

        let credential = ServerCredential {
            certificate: certificate.clone(),
            private_key: private_key.clone(),
            key_exchange,
        };
        driver.engine.validate_credential(&credential)?;
        driver.settings.credential = Some(credential);

        tracing::debug!("{}: server credential configured ({})", handle, key_exchange);
        Ok(())
    }

    /// Set a boolean connection option; applies from the next handshake
    pub fn set_option(&self, handle: ConnectionHandle, option: SslOption, enabled: bool) -> Result<()> {
        let conn = self.connection(handle)?;
        conn.driver().settings.set(option, enabled);
        Ok(())
    }

    /// Attach an opaque peer URL; the engine decides how to use it
    pub fn set_url(&self, handle: ConnectionHandle, url: &str) -> Result<()> {
        let conn = self.connection(handle)?;
        conn.driver().settings.url = Some(url.to_string());
        Ok(())
    }

    /// Restrict the protocol versions offered or accepted
    pub fn set_version_range(
        &self,
        handle: ConnectionHandle,
        min: TlsVersion,
        max: TlsVersion,
    ) -> Result<()> {
        if min > max {
            return Err(SslError::InvalidConfig(format!(
                "version range {} - {} is empty",
                min, max
            )));
        }
        let conn = self.connection(handle)?;
        let mut driver = conn.driver();
        driver.settings.min_version = Some(min);
        driver.settings.max_version = Some(max);
        Ok(())
    }

    /// Token that cancels this connection's in-flight handshake
    pub fn cancel_token(&self, handle: ConnectionHandle) -> Result<CancelToken> {
        Ok(self.connection(handle)?.cancel.clone())
    }

    /// Cancel the in-flight handshake, if any
    pub fn cancel(&self, handle: ConnectionHandle) -> Result<()> {
        self.connection(handle)?.cancel.cancel();
        Ok(())
    }

    /// Run the handshake to completion with the default timeout
    pub fn force_handshake(&self, handle: ConnectionHandle) -> Result<()> {
        self.force_handshake_timeout(handle, self.handshake_timeout)
    }

    /// Run the handshake to completion, giving up after `timeout`
    ///
    /// Succeeds immediately if the connection is already established. A
    /// failed connection must be reset first.
    pub fn force_handshake_timeout(&self, handle: ConnectionHandle, timeout: Duration) -> Result<()> {
        let conn = self.connection(handle)?;
        let mut driver = conn.driver();

        let role = match conn.state() {
            HandshakeState::Reset { as_server } => Role::from_server_flag(as_server),
            HandshakeState::Established => return Ok(()),
            other => {
                return Err(SslError::InvalidState(format!(
                    "cannot force handshake while {}",
                    other
                )))
            }
        };
        if role.is_server() && driver.settings.credential.is_none() {
            return Err(SslError::InvalidCredential(
                "no server credential configured".to_string(),
            ));
        }

        // A timeout too large to represent means no deadline
        let deadline = Instant::now().checked_add(timeout);

        conn.set_status(HandshakeState::InProgress, None);
        tracing::debug!("{}: handshake started as {:?}", handle, role);

        match drive(&mut driver, role, &conn.cancel, deadline) {
            Ok(params) => {
                if role.is_server() && !driver.settings.is_enabled(SslOption::NoCache) {
                    self.remember_session(&params);
                }
                tracing::debug!(
                    "{}: handshake established ({} {}, resumed={})",
                    handle,
                    params.protocol.map(|p| p.as_str()).unwrap_or("<undef>"),
                    params.cipher.as_deref().unwrap_or("<undef>"),
                    params.resumed
                );
                conn.set_status(HandshakeState::Established, Some(params));
                Ok(())
            }
            Err(reason) => {
                if role.is_server() {
                    if let Some(id) = driver.engine.session_id() {
                        self.cache.remove(&id);
                    }
                }
                driver.engine.abort();
                tracing::warn!("{}: handshake failed: {}", handle, reason);
                let err = reason.to_error();
                conn.set_status(HandshakeState::Failed(reason), None);
                Err(err)
            }
        }
    }

    fn remember_session(&self, params: &NegotiatedParams) {
        let Some(session) = params.session.as_ref() else {
            return;
        };

        if params.resumed {
            self.cache.refresh(&session.id);
            return;
        }

        let Some(lifetime) = self.cache.lifetime_for(params.protocol) else {
            return;
        };
        let suite = params.cipher_suite.unwrap_or(CipherSuite(0));
        let mut entry = SessionCacheEntry::new(session.id.clone(), suite, lifetime);
        if let Some(protocol) = params.protocol {
            entry = entry.with_protocol(protocol);
        }
        if let Some(ref peer) = params.peer {
            entry = entry.with_peer_identity(peer.der.clone());
        }
        if let Some(ref state) = session.state {
            entry = entry.with_state(state.clone());
        }
        self.cache.insert(entry);
    }

    /// Close a connection; its handle becomes invalid
    pub fn close(&self, handle: ConnectionHandle) -> Result<()> {
        let conn = self
            .connections
            .remove(handle)
            .ok_or(SslError::InvalidHandle(handle))?;

        // Unblock a handshake running on another thread before taking the lock
        conn.cancel.cancel();
        conn.driver().engine.shutdown();

        tracing::debug!("{}: connection closed", handle);
        Ok(())
    }
}

fn drive(
    driver: &mut Driver,
    role: Role,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> std::result::Result<NegotiatedParams, FailureReason> {
    driver
        .engine
        .begin(role, &driver.settings)
        .map_err(FailureReason::from_error)?;

    loop {
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }
        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(FailureReason::TimedOut);
                }
                deadline - now
            }
            None => POLL_SLICE,
        };

        let interest = match driver.engine.step().map_err(FailureReason::from_error)? {
            Progress::Complete => break,
            Progress::WantRead => Interest::Read,
            Progress::WantWrite => Interest::Write,
        };

        let slice = remaining.min(POLL_SLICE);
        driver
            .engine
            .wait(interest, slice)
            .map_err(FailureReason::from_error)?;
    }

    driver.engine.negotiated().ok_or_else(|| FailureReason::Engine {
        code: 0,
        message: "engine reported no negotiated parameters".to_string(),
    })
}
