//! OpenSSL engine
//!
//! This module implements the engine seam on top of the `openssl` crate.
//! Transports are switched to non-blocking mode so each handshake step
//! returns as soon as OpenSSL needs more I/O; waiting happens in `poll(2)`.
//!
//! Server contexts keep OpenSSL's internal session store off and resolve
//! resumption attempts through the shared `SessionCache`, so cache expiry and
//! eviction decide which sessions can be resumed.

use super::cache::{CipherSuite, SessionCache};
use super::cert;
use super::config::{KeyExchange, Role, SslOption};
use super::credential::ServerCredential;
use super::engine::{
    ConnectionSettings, EngineConnection, Interest, NegotiatedParams, NegotiatedSession, Progress,
    TlsEngine,
};
use super::error::SslError;
use super::Result;
use bytes::Bytes;
use openssl::pkey::Id;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslSession,
    SslSessionCacheMode, SslStream, SslVerifyMode,
};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// Session id context shared by every server context of this engine
const SESSION_ID_CONTEXT: &[u8] = b"tls-session";

/// OpenSSL-backed engine
#[derive(Debug, Clone)]
pub struct OpenSslEngine {
    cache: Arc<SessionCache>,
}

impl OpenSslEngine {
    /// Create an engine resolving server resumption through `cache`
    pub fn new(cache: Arc<SessionCache>) -> Self {
        OpenSslEngine { cache }
    }
}

impl TlsEngine for OpenSslEngine {
    fn import(&self, stream: TcpStream) -> Result<Box<dyn EngineConnection>> {
        Ok(Box::new(OpenSslConnection::new(stream, self.cache.clone())?))
    }
}

/// One transport driven by OpenSSL
pub struct OpenSslConnection {
    socket: TcpStream,
    cache: Arc<SessionCache>,
    stream: Option<SslStream<TcpStream>>,
    complete: bool,
}

impl OpenSslConnection {
    pub fn new(socket: TcpStream, cache: Arc<SessionCache>) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(OpenSslConnection {
            socket,
            cache,
            stream: None,
            complete: false,
        })
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        &self.socket
    }
}

impl EngineConnection for OpenSslConnection {
    fn validate_credential(&self, credential: &ServerCredential) -> Result<()> {
        check_credential(credential)?;
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        install_credential(&mut builder, credential)
    }

    fn begin(&mut self, role: Role, settings: &ConnectionSettings) -> Result<()> {
        self.abort();

        let ctx = match role {
            Role::Server => server_context(settings, &self.cache)?,
            Role::Client => client_context(settings)?,
        };

        let mut ssl = Ssl::new(&ctx)?;
        match role {
            Role::Server => ssl.set_accept_state(),
            Role::Client => {
                if let Some(ref url) = settings.url {
                    ssl.set_hostname(url)?;
                }
                ssl.set_connect_state();
            }
        }

        self.stream = Some(SslStream::new(ssl, self.socket.try_clone()?)?);
        Ok(())
    }

    fn step(&mut self) -> Result<Progress> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SslError::InvalidState("handshake not started".to_string()))?;

        match stream.do_handshake() {
            Ok(()) => {
                self.complete = true;
                Ok(Progress::Complete)
            }
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(Progress::WantRead),
            Err(e) if e.code() == ErrorCode::WANT_WRITE => Ok(Progress::WantWrite),
            Err(e) => Err(engine_failure(&e)),
        }
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.socket.as_raw_fd(),
            events: match interest {
                Interest::Read => POLLIN,
                Interest::Write => POLLOUT,
            },
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(SslError::Io(err));
        }

        Ok(result > 0)
    }

    fn negotiated(&self) -> Option<NegotiatedParams> {
        if !self.complete {
            return None;
        }
        let ssl = self.stream.as_ref()?.ssl();

        let cipher = ssl.current_cipher();
        let bits = cipher.map(|c| c.bits());

        let session = ssl.session().and_then(|s| {
            if s.id().is_empty() {
                return None;
            }
            Some(NegotiatedSession {
                id: Bytes::copy_from_slice(s.id()),
                state: s.to_der().ok().map(Bytes::from),
            })
        });

        Some(NegotiatedParams {
            protocol: ssl.version_str().parse().ok(),
            cipher: cipher.map(|c| c.name().to_string()),
            cipher_suite: cipher.map(|c| CipherSuite::from_protocol_id(c.protocol_id())),
            key_size: bits.as_ref().map(|b| b.algorithm.max(0) as u32).unwrap_or(0),
            secret_key_size: bits.as_ref().map(|b| b.secret.max(0) as u32).unwrap_or(0),
            peer: cert::peer_identity(ssl),
            session,
            resumed: ssl.session_reused(),
        })
    }

    fn session_id(&self) -> Option<Bytes> {
        let session = self.stream.as_ref()?.ssl().session()?;
        if session.id().is_empty() {
            return None;
        }
        Some(Bytes::copy_from_slice(session.id()))
    }

    fn abort(&mut self) {
        self.stream = None;
        self.complete = false;
    }

    fn shutdown(&mut self) {
        // Best-effort close_notify; the socket is non-blocking
        if let Some(mut stream) = self.stream.take() {
            if self.complete {
                let _ = stream.shutdown();
            }
        }
        self.complete = false;
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

fn server_context(settings: &ConnectionSettings, cache: &Arc<SessionCache>) -> Result<SslContext> {
    let credential = settings
        .credential
        .as_ref()
        .ok_or_else(|| SslError::InvalidCredential("no server credential configured".to_string()))?;

    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    install_credential(&mut builder, credential)?;
    apply_common(&mut builder, settings)?;

    let verify_mode = if settings.is_enabled(SslOption::RequireCertificate) {
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
    } else if settings.is_enabled(SslOption::RequestCertificate) {
        SslVerifyMode::PEER
    } else {
        SslVerifyMode::NONE
    };
    // Chain validation belongs to the host; any presented certificate is accepted here
    builder.set_verify_callback(verify_mode, |_, _| true);

    if settings.is_enabled(SslOption::NoCache) {
        builder.set_session_cache_mode(SslSessionCacheMode::OFF);
        return Ok(builder.build());
    }

    builder.set_session_id_context(SESSION_ID_CONTEXT)?;
    builder.set_session_cache_mode(SslSessionCacheMode::SERVER | SslSessionCacheMode::NO_INTERNAL);

    let cache = Arc::clone(cache);
    // SAFETY: every returned session is freshly decoded from DER and is not
    // associated with any other context.
    unsafe {
        builder.set_get_session_callback(move |_ssl, id| {
            cache
                .lookup(id)
                .and_then(|entry| entry.state().and_then(|der| SslSession::from_der(der).ok()))
        });
    }

    Ok(builder.build())
}

fn client_context(settings: &ConnectionSettings) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
    // Peer authentication is the host's concern
    builder.set_verify(SslVerifyMode::NONE);
    apply_common(&mut builder, settings)?;
    Ok(builder.build())
}

fn apply_common(builder: &mut SslContextBuilder, settings: &ConnectionSettings) -> Result<()> {
    if let Some(min) = settings.min_version {
        builder.set_min_proto_version(Some(min.to_openssl_version()))?;
    }
    if let Some(max) = settings.max_version {
        builder.set_max_proto_version(Some(max.to_openssl_version()))?;
    }
    if !settings.is_enabled(SslOption::EnableSessionTickets) {
        builder.set_options(SslOptions::NO_TICKET);
    }
    Ok(())
}

fn install_credential(builder: &mut SslContextBuilder, credential: &ServerCredential) -> Result<()> {
    builder
        .set_certificate(credential.certificate.as_x509())
        .map_err(|e| SslError::InvalidCredential(format!("Failed to set certificate: {}", e)))?;
    builder
        .set_private_key(credential.private_key.as_pkey())
        .map_err(|e| SslError::InvalidCredential(format!("Failed to set private key: {}", e)))?;
    builder
        .check_private_key()
        .map_err(|e| SslError::InvalidCredential(format!("Private key check failed: {}", e)))
}

fn check_credential(credential: &ServerCredential) -> Result<()> {
    let public = credential
        .certificate
        .as_x509()
        .public_key()
        .map_err(|e| SslError::InvalidCredential(format!("Unreadable certificate key: {}", e)))?;

    if !public.public_eq(credential.private_key.as_pkey()) {
        return Err(SslError::InvalidCredential(
            "certificate and private key do not match".to_string(),
        ));
    }

    let key_type = credential.private_key.as_pkey().id();
    if !key_exchange_accepts(credential.key_exchange, key_type) {
        return Err(SslError::InvalidCredential(format!(
            "{} key exchange cannot use a {:?} key",
            credential.key_exchange, key_type
        )));
    }
    Ok(())
}

fn key_exchange_accepts(kea: KeyExchange, key_type: Id) -> bool {
    match kea {
        KeyExchange::Null => true,
        KeyExchange::Rsa => key_type == Id::RSA,
        KeyExchange::Dh => key_type == Id::RSA || key_type == Id::DSA,
        KeyExchange::Ecdh => key_type == Id::EC,
    }
}

fn engine_failure(e: &openssl::ssl::Error) -> SslError {
    let code = if let Some(stack) = e.ssl_error() {
        stack.errors().first().map(|err| err.code() as i64)
    } else {
        e.io_error().and_then(|io| io.raw_os_error()).map(i64::from)
    };

    SslError::EngineFailure {
        code: code.unwrap_or_else(|| i64::from(e.code().as_raw())),
        message: e.to_string(),
    }
}
