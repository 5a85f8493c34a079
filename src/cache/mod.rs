//! Key-addressed cache adapter with TTL, transparent compression above a
//! size threshold. Grounded on spec.md §4.1 and SPEC_FULL.md §A/§D; the
//! "Redis-as-injected-callables" redesign note (spec.md §9) becomes a plain
//! `Cache` trait, matching the teacher's preference for explicit traits at
//! component seams over ambient globals.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Computes the cache key `html:sha256(url || ':' || unlock_flag)` per
/// spec.md §3/§4.10.
#[must_use]
pub fn cache_key(url: &str, unlock: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b":");
    hasher.update(if unlock { b"true" } else { b"false" });
    format!("html:{}", hex::encode(hasher.finalize()))
}

/// Values larger than this (in bytes, before base64) are compressed.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 5000;

/// Sentinel prefix marking a compressed value. Never visible to callers of
/// [`Cache::get`] — the adapter reverses it transparently.
pub const COMPRESSED_SENTINEL: &str = "__COMPRESSED__:";

/// Key-addressed read/write with TTL, matching spec.md §4.1's wire
/// contract: `get`, `set`, `incr`, `expire`. Implementations are expected to
/// be best-effort: the orchestrator treats any `Err` as a cache miss on read
/// and as a successful write on write.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;
}

/// Compresses `value` with zlib and prefixes the sentinel if it exceeds
/// [`COMPRESSION_THRESHOLD_BYTES`]; otherwise returns it unchanged.
pub fn encode_value(value: &str) -> Result<String> {
    if value.len() <= COMPRESSION_THRESHOLD_BYTES {
        return Ok(value.to_string());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(value.as_bytes())
        .map_err(|e| PipelineError::CacheAdapter(format!("compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| PipelineError::CacheAdapter(format!("compression failed: {e}")))?;
    Ok(format!("{COMPRESSED_SENTINEL}{}", BASE64.encode(compressed)))
}

/// Reverses [`encode_value`], auto-detecting the sentinel prefix.
pub fn decode_value(stored: &str) -> Result<String> {
    let Some(encoded) = stored.strip_prefix(COMPRESSED_SENTINEL) else {
        return Ok(stored.to_string());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| PipelineError::CacheAdapter(format!("base64 decode failed: {e}")))?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| PipelineError::CacheAdapter(format!("decompression failed: {e}")))?;
    Ok(out)
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory reference implementation of [`Cache`], for tests and the demo
/// binary. Production deployments back `Cache` with an external KV (Redis
/// and kin) behind the same trait.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    counters: Mutex<HashMap<String, i64>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                let raw = entry.value.clone();
                decode_value(&raw).map(Some)
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let encoded = encode_value(value)?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: encoded,
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_differs_by_unlock_flag() {
        let url = "https://example.com/article";
        assert_ne!(cache_key(url, true), cache_key(url, false));
    }

    #[test]
    fn small_values_pass_through_uncompressed() {
        let encoded = encode_value("short").unwrap();
        assert_eq!(encoded, "short");
        assert_eq!(decode_value(&encoded).unwrap(), "short");
    }

    #[test]
    fn large_values_round_trip_through_compression() {
        let big = "x".repeat(COMPRESSION_THRESHOLD_BYTES + 1);
        let encoded = encode_value(&big).unwrap();
        assert!(encoded.starts_with(COMPRESSED_SENTINEL));
        assert_eq!(decode_value(&encoded).unwrap(), big);
    }

    #[tokio::test]
    async fn cache_idempotence_across_repeated_hits() {
        let cache = InMemoryCache::new();
        cache.set("html:abc", "<html>ok</html>", 3600).await.unwrap();
        let first = cache.get("html:abc").await.unwrap();
        let second = cache.get("html:abc").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("<html>ok</html>"));
    }

    #[tokio::test]
    async fn incr_is_monotonic() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.incr("counter").await.unwrap(), 1);
        assert_eq!(cache.incr("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = InMemoryCache::new();
        cache.set("key", "value", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
    }
}
