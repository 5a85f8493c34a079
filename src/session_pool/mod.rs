//! LRU pool of per-hostname impersonating HTTP sessions; idle eviction.
//! Grounded on `app/services/cloudscraper_pool.py::SessionPool` — an
//! `OrderedDict` keyed by hostname, move-to-front on hit, pop-oldest on
//! overflow. The synchronous `cloudscraper.CloudScraper` handle becomes a
//! synchronous [`ureq::Agent`], matching spec.md §9's "synchronous client
//! used via a worker" design note (grounded further on
//! `other_examples/62419b8f_bhuvanprakash-jhol__crates-jhol-core-src-http_client.rs.rs`,
//! which wraps `ureq` the same way).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::headers::HeaderBag;

/// Default pool capacity, matching the source's `SessionPool(max_size=32)`.
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// A pooled impersonating session and the default headers it was created
/// with (the session's own `User-Agent`, notably, must be preserved across
/// per-request header merges).
#[derive(Clone)]
pub struct SessionEntry {
    pub agent: Arc<ureq::Agent>,
    pub default_headers: HeaderBag,
}

/// Hostname-keyed LRU pool of impersonating sessions.
pub struct SessionPool {
    inner: Mutex<LruCache<String, SessionEntry>>,
    header_factory: Box<dyn Fn(&str) -> HeaderBag + Send + Sync>,
}

impl SessionPool {
    #[must_use]
    pub fn new(
        capacity: usize,
        header_factory: impl Fn(&str) -> HeaderBag + Send + Sync + 'static,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity must be non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            header_factory: Box::new(header_factory),
        }
    }

    /// Returns the session for `hostname`, creating one on first use and
    /// promoting it to most-recently-used. Evicts the LRU entry if the pool
    /// is over capacity after insertion.
    pub fn get_session(&self, hostname: &str) -> SessionEntry {
        let key = if hostname.is_empty() {
            "__unknown__"
        } else {
            hostname
        };
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get(key) {
            return entry.clone();
        }
        let agent = Arc::new(ureq::Agent::new_with_defaults());
        let entry = SessionEntry {
            agent,
            default_headers: (self.header_factory)(key),
        };
        inner.put(key.to_string(), entry.clone());
        entry
    }

    /// Closes and removes the session for `hostname`, if present. Called
    /// after a high-confidence block so the next attempt opens a fresh
    /// session (new cookies, new TLS session).
    pub fn evict(&self, hostname: &str) {
        let key = if hostname.is_empty() {
            "__unknown__"
        } else {
            hostname
        };
        if self.inner.lock().pop(key).is_some() {
            tracing::debug!(hostname = key, "evicted impersonating session after high-confidence block");
        }
    }

    /// Closes and removes every pooled session.
    pub fn evict_all(&self) {
        self.inner.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of hostname -> in-pool presence, for tests/diagnostics.
#[must_use]
pub fn hostnames(pool: &SessionPool) -> HashMap<String, bool> {
    let inner = pool.inner.lock();
    inner.iter().map(|(k, _)| (k.clone(), true)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderBag;

    fn factory(_hostname: &str) -> HeaderBag {
        HeaderBag::default()
    }

    #[test]
    fn creates_and_reuses_session() {
        let pool = SessionPool::new(2, factory);
        let first = pool.get_session("example.com");
        let second = pool.get_session("example.com");
        assert!(Arc::ptr_eq(&first.agent, &second.agent));
    }

    #[test]
    fn evicts_lru_entry_over_capacity() {
        let pool = SessionPool::new(2, factory);
        pool.get_session("a.com");
        pool.get_session("b.com");
        pool.get_session("c.com");
        assert_eq!(pool.len(), 2);
        let hosts = hostnames(&pool);
        assert!(!hosts.contains_key("a.com"));
    }

    #[test]
    fn forced_eviction_opens_a_fresh_session_next_time() {
        let pool = SessionPool::new(2, factory);
        let first = pool.get_session("example.com");
        pool.evict("example.com");
        let second = pool.get_session("example.com");
        assert!(!Arc::ptr_eq(&first.agent, &second.agent));
    }

    #[test]
    fn pool_bound_holds_at_all_times() {
        let pool = SessionPool::new(3, factory);
        for i in 0..10 {
            pool.get_session(&format!("host{i}.com"));
            assert!(pool.len() <= 3);
        }
    }
}
