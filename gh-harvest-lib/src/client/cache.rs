//! Persistent response cache shared by every command and run.
//!
//! Entries are keyed by a 16-hex-character prefix of a SHA-256 hash over
//! the canonical request fingerprint and stored as single JSON documents
//! in a flat directory. Two storage schemas coexist, fixed per call site:
//!
//! - *bare*: the decoded JSON body only, no expiry. Used for data that
//!   is immutable once observed (a blob at a content hash never changes).
//! - *wrapped*: `{status, body, etag, link, stored_at}` with a 30-day
//!   TTL. Used by the general REST client and generic GraphQL calls.
//!
//! Reads degrade silently to a miss; writes log and continue. A run must
//! never fail because caching failed.

use crate::Result;
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const LOG_TARGET: &str = "     cache";

/// TTL for wrapped entries.
const WRAPPED_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// On-disk form of a general (non-immutable) API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedEntry {
    pub status: u16,
    pub body: Value,
    pub etag: Option<String>,
    pub link: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// Hit/write counters, exposed for progress lines.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// A flat, content-addressed directory of prior API responses.
#[derive(Debug)]
pub struct ResponseCache {
    dir: PathBuf,
    skip_read: bool,
    stats: CacheStats,
}

/// Derive the cache key for a request fingerprint.
///
/// The canonical string is `endpoint|k1=v1&k2=v2&…` with parameters
/// sorted by key; a non-GET method and a request body are appended when
/// present. The key is the hex encoding of the first 8 bytes of the
/// SHA-256 of that string, so it is stable across runs, platforms, and
/// architectures.
pub fn cache_key(
    endpoint: &str,
    params: &[(String, String)],
    method: Option<&str>,
    body: Option<&str>,
) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = String::with_capacity(endpoint.len() + 16 * sorted.len());
    canonical.push_str(endpoint);
    canonical.push('|');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            canonical.push('&');
        }
        canonical.push_str(k);
        canonical.push('=');
        canonical.push_str(v);
    }
    if let Some(m) = method {
        if m != "GET" {
            canonical.push('|');
            canonical.push_str(m);
        }
    }
    if let Some(b) = body {
        canonical.push('|');
        canonical.push_str(b);
    }

    let digest = Sha256::digest(canonical.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl ResponseCache {
    /// Open (or create) a cache rooted at `dir`.
    ///
    /// When `skip_read` is set, every lookup misses but writes still
    /// happen, so a fresh response repopulates the entry for the next
    /// caller.
    pub fn open(dir: impl Into<PathBuf>, skip_read: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            skip_read,
            stats: CacheStats::default(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load a bare entry: the raw JSON body as previously stored.
    #[must_use]
    pub fn load_bare(&self, endpoint: &str, params: &[(String, String)]) -> Option<Value> {
        if self.skip_read {
            return None;
        }
        let key = cache_key(endpoint, params, None, None);
        let value = self.read_json(&key)?;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Store a bare entry. Errors are logged and swallowed.
    pub fn save_bare(&self, endpoint: &str, params: &[(String, String)], body: &Value) {
        let key = cache_key(endpoint, params, None, None);
        self.write_json(&key, body);
    }

    /// Load a wrapped entry, honoring its 30-day TTL.
    #[must_use]
    pub fn load_wrapped(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        method: Option<&str>,
        body: Option<&str>,
    ) -> Option<WrappedEntry> {
        if self.skip_read {
            return None;
        }
        let key = cache_key(endpoint, params, method, body);
        let value = self.read_json(&key)?;
        let entry: WrappedEntry = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                log::debug!(target: LOG_TARGET, "Cache miss for {endpoint}: {e:#}");
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(entry.stored_at);
        // Future timestamps (clock skew) are treated as fresh.
        if age.num_seconds() >= 0 {
            let age = age.to_std().unwrap_or(Duration::MAX);
            if age >= WRAPPED_TTL {
                log::debug!(
                    target: LOG_TARGET,
                    "Cache expired for {endpoint} (age: {:.1} days)",
                    age.as_secs_f64() / 86400.0
                );
                return None;
            }
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store a wrapped entry. Errors are logged and swallowed.
    pub fn save_wrapped(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        method: Option<&str>,
        body: Option<&str>,
        entry: &WrappedEntry,
    ) {
        let key = cache_key(endpoint, params, method, body);
        match serde_json::to_value(entry) {
            Ok(value) => self.write_json(&key, &value),
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Could not serialize cache entry for {endpoint}: {e:#}");
            }
        }
    }

    fn read_json(&self, key: &str) -> Option<Value> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!(target: LOG_TARGET, "Cache miss for {key}: {e:#}");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!(target: LOG_TARGET, "Cache miss for {key} (corrupt entry): {e:#}");
                None
            }
        }
    }

    /// Write an entry atomically: serialize to a temp file in the cache
    /// directory, then rename over the final path. Concurrent writers of
    /// the same key produce one survivor with equivalent content.
    fn write_json(&self, key: &str, value: &Value) {
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!("{key}.{}.tmp", std::process::id()));

        let result = serde_json::to_vec(value)
            .map_err(std::io::Error::other)
            .and_then(|bytes| fs::write(&tmp, bytes))
            .and_then(|()| fs::rename(&tmp, &path));

        if let Err(e) = result {
            log::warn!(target: LOG_TARGET, "Could not write cache entry '{}': {e:#}", path.display());
            let _ = fs::remove_file(&tmp);
        }
    }
}
