//! Handshake integration tests
//!
//! These tests drive real TLS handshakes over loopback sockets:
//! - Server handshake against a plain OpenSSL client
//! - TLS 1.2 session resumption served from the session cache
//! - Client and server both driven through the controller
//! - Cancellation and timeout against a silent peer
//! - Credential validation and handle lifecycle

use openssl::ssl::{SslContext, SslMethod, SslSession, SslVerifyMode, SslVersion};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tls_session::ssl::{
    credential, CacheConfig, FailureReason, HandshakeController, HandshakeState, KeyAlgorithm,
    KeyExchange, SessionCache, SslError, SslOption, TlsVersion,
};

fn configured_cache() -> Arc<SessionCache> {
    let config = CacheConfig::builder()
        .max_entries(64)
        .timeout(Duration::from_secs(300))
        .alt_timeout(Duration::from_secs(600))
        .build()
        .unwrap();
    Arc::new(SessionCache::with_config(config).unwrap())
}

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

/// Run a blocking OpenSSL client on `stream`
///
/// The client offers `session` for resumption, reports the session it ended
/// up with, then holds the connection open until `done` fires. It closes
/// with close_notify; OpenSSL marks sessions of unclean closes unresumable.
fn spawn_client(
    stream: TcpStream,
    max_version: SslVersion,
    session: Option<SslSession>,
    done: mpsc::Receiver<()>,
) -> thread::JoinHandle<(SslSession, bool)> {
    thread::spawn(move || {
        let mut builder = SslContext::builder(SslMethod::tls_client()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_max_proto_version(Some(max_version)).unwrap();
        let ctx = builder.build();

        let mut ssl = openssl::ssl::Ssl::new(&ctx).unwrap();
        if let Some(ref session) = session {
            unsafe { ssl.set_session(session).unwrap() };
        }

        let mut tls = ssl.connect(stream).unwrap();
        let negotiated = tls.ssl().session().unwrap().to_owned();
        let reused = tls.ssl().session_reused();

        let _ = done.recv_timeout(Duration::from_secs(5));
        let _ = tls.shutdown();
        (negotiated, reused)
    })
}

#[test]
fn test_server_handshake_reports_status() {
    let cache = configured_cache();
    let controller = HandshakeController::new(cache.clone());
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, None, done_rx);

    let handle = controller.import_fd(None, server).unwrap();
    controller.reset_handshake(handle, true).unwrap();
    controller
        .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
        .unwrap();
    controller.force_handshake(handle).unwrap();

    let status = controller.reporter().query(handle).unwrap();
    assert!(status.on);
    assert!(status.cipher.is_some());
    assert!(status.key_size >= 128);
    assert!(status.secret_key_size >= 128);
    assert_eq!(status.protocol, Some(TlsVersion::Tls12));
    assert!(!status.resumed);
    // The client did not authenticate
    assert!(status.subject.is_none());
    assert!(status.issuer.is_none());

    done_tx.send(()).unwrap();
    let (session, _) = client.join().unwrap();

    let entry = cache.lookup(session.id()).expect("session should be cached");
    assert_eq!(entry.protocol(), Some(TlsVersion::Tls12));
    assert!(entry.state().is_some());

    controller.close(handle).unwrap();
}

#[test]
fn test_tls12_session_resumed_from_cache() {
    let cache = configured_cache();
    let controller = HandshakeController::new(cache.clone());
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let serve = |server: TcpStream| {
        let handle = controller.import_fd(None, server).unwrap();
        controller.reset_handshake(handle, true).unwrap();
        controller
            .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
            .unwrap();
        controller.force_handshake(handle).unwrap();
        handle
    };

    // Full handshake
    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, None, done_rx);
    let first = serve(server);
    done_tx.send(()).unwrap();
    let (session, reused) = client.join().unwrap();
    assert!(!reused);
    assert_eq!(cache.len(), 1);

    // Abbreviated handshake with the same session id
    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, Some(session.clone()), done_rx);
    let second = serve(server);
    done_tx.send(()).unwrap();
    let (resumed_session, reused) = client.join().unwrap();

    assert!(reused);
    assert_eq!(resumed_session.id(), session.id());
    assert!(controller.reporter().query(second).unwrap().resumed);
    assert!(!controller.reporter().query(first).unwrap().resumed);
    assert_eq!(cache.len(), 1);
    assert!(cache.stats().hits >= 1);
}

#[test]
fn test_evicted_session_not_resumed() {
    let cache = configured_cache();
    let controller = HandshakeController::new(cache.clone());
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let serve = |server: TcpStream| {
        let handle = controller.import_fd(None, server).unwrap();
        controller.reset_handshake(handle, true).unwrap();
        controller
            .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
            .unwrap();
        controller.force_handshake(handle).unwrap();
        handle
    };

    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, None, done_rx);
    serve(server);
    done_tx.send(()).unwrap();
    let (session, _) = client.join().unwrap();

    cache.clear();
    let misses_before = cache.stats().misses;

    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, Some(session), done_rx);
    let handle = serve(server);
    done_tx.send(()).unwrap();
    let (_, reused) = client.join().unwrap();

    assert!(!reused);
    assert!(!controller.reporter().query(handle).unwrap().resumed);
    // The offered session was looked up and missed
    assert!(cache.stats().misses > misses_before);
}

#[test]
fn test_no_cache_option_leaves_cache_empty() {
    let cache = configured_cache();
    let controller = HandshakeController::new(cache.clone());
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, client) = loopback_pair();
    let (done_tx, done_rx) = mpsc::channel();
    let client = spawn_client(client, SslVersion::TLS1_2, None, done_rx);

    let handle = controller.import_fd(None, server).unwrap();
    controller.set_option(handle, SslOption::NoCache, true).unwrap();
    controller.reset_handshake(handle, true).unwrap();
    controller
        .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
        .unwrap();
    controller.force_handshake(handle).unwrap();

    done_tx.send(()).unwrap();
    client.join().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn test_client_and_server_through_controller() {
    let cache = configured_cache();
    let controller = Arc::new(HandshakeController::new(cache));
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::Rsa2048).unwrap();

    let (server_stream, client_stream) = loopback_pair();
    let server = controller.import_fd(None, server_stream).unwrap();
    let client = controller.import_fd(None, client_stream).unwrap();

    controller.reset_handshake(server, true).unwrap();
    controller
        .configure_secure_server(server, &cert, &key, KeyExchange::Rsa)
        .unwrap();
    controller.reset_handshake(client, false).unwrap();
    controller.set_url(client, "localhost").unwrap();

    let server_side = {
        let controller = controller.clone();
        thread::spawn(move || controller.force_handshake(server))
    };
    controller.force_handshake(client).unwrap();
    server_side.join().unwrap().unwrap();

    let client_status = controller.reporter().query(client).unwrap();
    assert_eq!(client_status.subject.as_deref(), Some("CN=localhost"));
    assert_eq!(client_status.issuer.as_deref(), Some("CN=localhost"));

    let server_status = controller.reporter().query(server).unwrap();
    assert_eq!(server_status.cipher, client_status.cipher);
    assert_eq!(server_status.protocol, client_status.protocol);

    controller.close(client).unwrap();
    controller.close(server).unwrap();
    assert_eq!(controller.connection_count(), 0);
}

#[test]
fn test_version_range_mismatch_fails() {
    let cache = configured_cache();
    let controller = Arc::new(HandshakeController::new(cache));
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server_stream, client_stream) = loopback_pair();
    let server = controller.import_fd(None, server_stream).unwrap();
    let client = controller.import_fd(None, client_stream).unwrap();

    controller
        .set_version_range(server, TlsVersion::Tls13, TlsVersion::Tls13)
        .unwrap();
    controller.reset_handshake(server, true).unwrap();
    controller
        .configure_secure_server(server, &cert, &key, KeyExchange::Ecdh)
        .unwrap();
    controller
        .set_version_range(client, TlsVersion::Tls12, TlsVersion::Tls12)
        .unwrap();
    controller.reset_handshake(client, false).unwrap();

    let server_side = {
        let controller = controller.clone();
        thread::spawn(move || controller.force_handshake_timeout(server, Duration::from_secs(5)))
    };
    let client_result = controller.force_handshake_timeout(client, Duration::from_secs(5));
    let server_result = server_side.join().unwrap();

    assert!(matches!(server_result, Err(SslError::EngineFailure { .. })));
    assert!(client_result.is_err());
    assert!(matches!(
        controller.state(server).unwrap(),
        HandshakeState::Failed(FailureReason::Engine { .. })
    ));
    assert!(matches!(
        controller.reporter().query(server),
        Err(SslError::NotEstablished)
    ));
}

#[test]
fn test_cancel_silent_peer() {
    let controller = Arc::new(HandshakeController::new(configured_cache()));
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, _silent_client) = loopback_pair();
    let handle = controller.import_fd(None, server).unwrap();
    controller.reset_handshake(handle, true).unwrap();
    controller
        .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
        .unwrap();

    let token = controller.cancel_token(handle).unwrap();
    let worker = {
        let controller = controller.clone();
        thread::spawn(move || controller.force_handshake(handle))
    };

    thread::sleep(Duration::from_millis(150));
    let cancelled_at = Instant::now();
    token.cancel();

    let result = worker.join().unwrap();
    assert!(matches!(result, Err(SslError::Cancelled)));
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert_eq!(
        controller.state(handle).unwrap(),
        HandshakeState::Failed(FailureReason::Cancelled)
    );

    // A reset recovers the connection
    controller.reset_handshake(handle, true).unwrap();
    assert!(matches!(
        controller.reporter().query(handle),
        Err(SslError::NotEstablished)
    ));
}

#[test]
fn test_timeout_silent_peer() {
    let controller = HandshakeController::new(configured_cache())
        .handshake_timeout(Duration::from_millis(200));
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, _silent_client) = loopback_pair();
    let handle = controller.import_fd(None, server).unwrap();
    controller.reset_handshake(handle, true).unwrap();
    controller
        .configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh)
        .unwrap();

    let started = Instant::now();
    let result = controller.force_handshake(handle);

    assert!(matches!(result, Err(SslError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(
        controller.state(handle).unwrap(),
        HandshakeState::Failed(FailureReason::TimedOut)
    );
}

#[test]
fn test_credential_rejected() {
    let controller = HandshakeController::new(configured_cache());
    let (ec_cert, ec_key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();
    let (_, other_key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, _client) = loopback_pair();
    let handle = controller.import_fd(None, server).unwrap();
    controller.reset_handshake(handle, true).unwrap();

    // Key does not belong to the certificate
    assert!(matches!(
        controller.configure_secure_server(handle, &ec_cert, &other_key, KeyExchange::Ecdh),
        Err(SslError::InvalidCredential(_))
    ));

    // EC key cannot serve an RSA key exchange
    assert!(matches!(
        controller.configure_secure_server(handle, &ec_cert, &ec_key, KeyExchange::Rsa),
        Err(SslError::InvalidCredential(_))
    ));

    assert_eq!(
        controller.state(handle).unwrap(),
        HandshakeState::Reset { as_server: true }
    );
}

#[test]
fn test_client_role_rejects_server_credential() {
    let controller = HandshakeController::new(configured_cache());
    let (cert, key) = credential::self_signed("localhost", KeyAlgorithm::EcP256).unwrap();

    let (server, _client) = loopback_pair();
    let handle = controller.import_fd(None, server).unwrap();
    controller.reset_handshake(handle, false).unwrap();

    assert!(matches!(
        controller.configure_secure_server(handle, &cert, &key, KeyExchange::Ecdh),
        Err(SslError::WrongRole)
    ));
    assert_eq!(
        controller.state(handle).unwrap(),
        HandshakeState::Reset { as_server: false }
    );
}

#[test]
fn test_closed_handle_rejected() {
    let controller = HandshakeController::new(configured_cache());
    let (server, _client) = loopback_pair();
    let handle = controller.import_fd(None, server).unwrap();
    controller.close(handle).unwrap();

    assert!(matches!(
        controller.force_handshake(handle),
        Err(SslError::InvalidHandle(_))
    ));

    // A new connection in the same slot gets a distinct handle
    let (server, _client) = loopback_pair();
    let reused = controller.import_fd(None, server).unwrap();
    assert_ne!(reused, handle);
    assert!(matches!(
        controller.state(handle),
        Err(SslError::InvalidHandle(_))
    ));
    assert_eq!(controller.state(reused).unwrap(), HandshakeState::Unconfigured);
}
