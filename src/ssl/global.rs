//! Process-wide server session cache
//!
//! Hosts that configure the cache once at startup, before any connection
//! exists, can use this holder instead of threading an `Arc<SessionCache>`
//! through their own state. Libraries should prefer an owned cache.

use super::cache::SessionCache;
use super::config::{CacheConfig, DEFAULT_ALT_TIMEOUT_SECS, DEFAULT_MAX_ENTRIES, DEFAULT_TIMEOUT_SECS};
use super::Result;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static SERVER_SESSION_CACHE: OnceLock<Arc<SessionCache>> = OnceLock::new();

/// The process-wide cache, created unconfigured on first use
pub fn server_session_cache() -> Arc<SessionCache> {
    SERVER_SESSION_CACHE
        .get_or_init(|| Arc::new(SessionCache::new()))
        .clone()
}

/// Configure the process-wide cache
///
/// Zero for `max_entries`, `timeout` or `alt_timeout` selects the default
/// for that parameter. Only the first successful call takes effect; later
/// calls fail with `AlreadyConfigured`.
pub fn config_server_session_id_cache(
    max_entries: u32,
    timeout: Duration,
    alt_timeout: Duration,
    directory: Option<&Path>,
) -> Result<Arc<SessionCache>> {
    let config = cache_config(max_entries, timeout, alt_timeout, directory)?;
    let cache = server_session_cache();
    cache.configure(config)?;
    Ok(cache)
}

fn cache_config(
    max_entries: u32,
    timeout: Duration,
    alt_timeout: Duration,
    directory: Option<&Path>,
) -> Result<CacheConfig> {
    let or_default = |value: Duration, secs: u64| {
        if value.is_zero() {
            Duration::from_secs(secs)
        } else {
            value
        }
    };

    let mut builder = CacheConfig::builder()
        .max_entries(if max_entries == 0 { DEFAULT_MAX_ENTRIES } else { max_entries })
        .timeout(or_default(timeout, DEFAULT_TIMEOUT_SECS))
        .alt_timeout(or_default(alt_timeout, DEFAULT_ALT_TIMEOUT_SECS));
    if let Some(dir) = directory {
        builder = builder.storage_directory(dir);
    }
    builder.build()
}
