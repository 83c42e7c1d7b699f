//! Server session cache
//!
//! Holds resumable session state keyed by session id. The cache is bounded:
//! a full cache drops expired entries first and then the least recently used
//! one. Expiry is checked on every read, so a background sweep is only
//! needed to reclaim memory.

use super::config::{CacheConfig, TlsVersion, DEFAULT_TIMEOUT_SECS, MAX_SESSION_LIFETIME};
use super::error::SslError;
use super::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Negotiated cipher suite, by IANA code point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const TLS_AES_128_GCM_SHA256: CipherSuite = CipherSuite(0x1301);
    pub const TLS_AES_256_GCM_SHA384: CipherSuite = CipherSuite(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: CipherSuite = CipherSuite(0x1303);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: CipherSuite = CipherSuite(0xC02B);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: CipherSuite = CipherSuite(0xC02F);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: CipherSuite = CipherSuite(0xC02C);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: CipherSuite = CipherSuite(0xC030);

    /// Build from the two-byte wire identifier
    pub fn from_protocol_id(id: [u8; 2]) -> Self {
        CipherSuite(u16::from_be_bytes(id))
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// One resumable session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCacheEntry {
    session_id: Bytes,
    created_at: Instant,
    expires_at: Instant,
    cipher_suite: CipherSuite,
    peer_identity: Option<Bytes>,
    protocol: Option<TlsVersion>,
    state: Option<Bytes>,
}

impl SessionCacheEntry {
    /// Create an entry that expires `lifetime` from now
    ///
    /// A zero lifetime is raised to one nanosecond so the entry still
    /// expires strictly after it was created. Lifetimes are capped at
    /// `MAX_SESSION_LIFETIME`.
    pub fn new(session_id: impl Into<Bytes>, cipher_suite: CipherSuite, lifetime: Duration) -> Self {
        let created_at = Instant::now();
        let lifetime = lifetime.clamp(Duration::from_nanos(1), MAX_SESSION_LIFETIME);
        SessionCacheEntry {
            session_id: session_id.into(),
            created_at,
            expires_at: created_at
                .checked_add(lifetime)
                .unwrap_or(created_at + Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            cipher_suite,
            peer_identity: None,
            protocol: None,
            state: None,
        }
    }

    /// Attach the peer's identity (DER certificate)
    pub fn with_peer_identity(mut self, identity: impl Into<Bytes>) -> Self {
        self.peer_identity = Some(identity.into());
        self
    }

    pub fn with_protocol(mut self, protocol: TlsVersion) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Attach the engine's serialized session, used to resume
    pub fn with_state(mut self, state: impl Into<Bytes>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn session_id(&self) -> &Bytes {
        &self.session_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn peer_identity(&self) -> Option<&Bytes> {
        self.peer_identity.as_ref()
    }

    pub fn protocol(&self) -> Option<TlsVersion> {
        self.protocol
    }

    pub fn state(&self) -> Option<&Bytes> {
        self.state.as_ref()
    }

    /// Whether the entry is past expiry at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Slot {
    entry: SessionCacheEntry,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    config: Option<CacheConfig>,
    entries: HashMap<Bytes, Slot>,
    clock: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.entry.is_expired_at(now));
        let purged = before - self.entries.len();
        self.stats.expirations += purged as u64;
        purged
    }

    fn evict_lru(&mut self) -> Option<Bytes> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| (slot.last_access, slot.entry.created_at))
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&victim);
        self.stats.evictions += 1;
        Some(victim)
    }
}

/// Bounded, expiring store of resumable server sessions
///
/// A cache starts unconfigured: lookups miss and inserts are dropped until
/// `configure` succeeds. It can be configured exactly once.
pub struct SessionCache {
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    /// Create an unconfigured cache
    pub fn new() -> Self {
        SessionCache {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Create and configure a cache in one step
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        let cache = SessionCache::new();
        cache.configure(config)?;
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the cache parameters
    ///
    /// Fails with `AlreadyConfigured` after a previous success; the earlier
    /// parameters stay in effect.
    pub fn configure(&self, config: CacheConfig) -> Result<()> {
        if let Some(dir) = config.storage_directory() {
            check_storage_directory(dir)?;
        }

        let mut inner = self.lock();
        if inner.config.is_some() {
            return Err(SslError::AlreadyConfigured);
        }

        tracing::info!(
            "Session cache configured: max_entries={}, timeout={:?}, alt_timeout={:?}, directory={:?}",
            config.max_entries,
            config.timeout,
            config.alt_timeout,
            config.storage_directory
        );
        inner.config = Some(config);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.lock().config.is_some()
    }

    /// Active configuration, if any
    pub fn config(&self) -> Option<CacheConfig> {
        self.lock().config.clone()
    }

    pub fn storage_directory(&self) -> Option<std::path::PathBuf> {
        self.lock()
            .config
            .as_ref()
            .and_then(|c| c.storage_directory.clone())
    }

    /// Lifetime a new session at `protocol` would get
    pub fn lifetime_for(&self, protocol: Option<TlsVersion>) -> Option<Duration> {
        self.lock().config.as_ref().map(|c| c.lifetime_for(protocol))
    }

    /// Find a live session
    pub fn lookup(&self, session_id: &[u8]) -> Option<SessionCacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.config.is_none() {
            return None;
        }

        let expired = match inner.entries.get(session_id) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(slot) => slot.entry.is_expired_at(now),
        };

        if expired {
            inner.entries.remove(session_id);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        let tick = inner.tick();
        inner.stats.hits += 1;
        let slot = inner.entries.get_mut(session_id)?;
        slot.last_access = tick;
        Some(slot.entry.clone())
    }

    /// Store a session, evicting if the cache is full
    pub fn insert(&self, entry: SessionCacheEntry) {
        let now = Instant::now();
        let mut inner = self.lock();
        let max_entries = match inner.config.as_ref() {
            Some(config) => config.max_entries as usize,
            None => {
                tracing::debug!(
                    "Dropping session {} for unconfigured cache",
                    hex_id(&entry.session_id)
                );
                return;
            }
        };

        if !inner.entries.contains_key(&entry.session_id) && inner.entries.len() >= max_entries {
            inner.purge_expired(now);
            while inner.entries.len() >= max_entries {
                match inner.evict_lru() {
                    Some(victim) => tracing::debug!("Evicted session {}", hex_id(&victim)),
                    None => break,
                }
            }
        }

        let tick = inner.tick();
        inner.stats.inserts += 1;
        tracing::debug!("Cached session {}", hex_id(&entry.session_id));
        inner.entries.insert(
            entry.session_id.clone(),
            Slot {
                entry,
                last_access: tick,
            },
        );
    }

    /// Mark a resumed session as recently used
    ///
    /// The session keeps its original expiry. Returns false if the session
    /// is absent or expired.
    pub fn refresh(&self, session_id: &[u8]) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let live = inner
            .entries
            .get(session_id)
            .map(|slot| !slot.entry.is_expired_at(now))
            .unwrap_or(false);
        if !live {
            return false;
        }
        let tick = inner.tick();
        match inner.entries.get_mut(session_id) {
            Some(slot) => {
                slot.last_access = tick;
                true
            }
            None => false,
        }
    }

    /// Invalidate one session
    pub fn remove(&self, session_id: &[u8]) -> Option<SessionCacheEntry> {
        let removed = self.lock().entries.remove(session_id).map(|slot| slot.entry);
        if removed.is_some() {
            tracing::debug!("Removed session {}", hex_id(session_id));
        }
        removed
    }

    /// Invalidate every session
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Drop all expired sessions, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Number of stored sessions, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Start a thread that purges expired sessions every `interval`
    ///
    /// The thread holds only a weak reference and stops when the returned
    /// `Sweeper` is dropped or the cache goes away.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let cache: Weak<SessionCache> = Arc::downgrade(self);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        tracing::debug!("Sweeper purged {} expired sessions", purged);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        Sweeper {
            stop: Some(stop_tx),
            thread: Some(thread),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        SessionCache::new()
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionCache")
            .field("config", &inner.config)
            .field("len", &inner.entries.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

/// Background purge thread; stops on drop
pub struct Sweeper {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Verify the directory exists and accepts new files
fn check_storage_directory(dir: &Path) -> Result<()> {
    let unavailable = |source: io::Error| SslError::StorageUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    let meta = fs::metadata(dir).map_err(unavailable)?;
    if !meta.is_dir() {
        return Err(unavailable(io::Error::new(
            io::ErrorKind::Other,
            "not a directory",
        )));
    }

    let probe = dir.join(format!(".session-cache-probe-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(unavailable)?;
    fs::remove_file(&probe).map_err(unavailable)?;
    Ok(())
}

fn hex_id(id: &[u8]) -> String {
    id.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
