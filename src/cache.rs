//! Decision cache — bounded LRU memoization of final verdicts.
//!
//! Keyed by `sha256(normalized_text ‖ policy_version ‖ index_hash)`, so a
//! policy or exemplar reload logically invalidates every stale entry by
//! rotating the key.  There is no TTL.  Stored verdicts keep the
//! `processing_time_ms` of the original computation; retrieval flips
//! `cache_hit` on the returned copy.
//!
//! Only "classified" outcomes are memoized — timeouts, skips, and internal
//! errors depend on transient conditions and always recompute (see
//! [`Method::is_cacheable`](crate::verdict::Method::is_cacheable)).

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::verdict::Verdict;

/// Cache key: a SHA-256 digest.
pub type CacheKey = [u8; 32];

/// Thread-safe bounded verdict cache.
///
/// Concurrent readers and the single evicting writer are serialized by a
/// short critical section; entries are small and lookups are O(1).
#[derive(Debug)]
pub struct DecisionCache {
    inner: Mutex<LruCache<CacheKey, Verdict>>,
}

impl DecisionCache {
    /// Create a cache holding at most `capacity` verdicts.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compute the cache key for a normalized text under the current
    /// snapshot identity.
    #[must_use]
    pub fn key(normalized: &str, policy_version: &str, index_hash: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0x1f]);
        hasher.update(policy_version.as_bytes());
        hasher.update([0x1f]);
        hasher.update(index_hash.as_bytes());
        hasher.finalize().into()
    }

    /// Look up a verdict; the returned copy has `cache_hit = true`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Verdict> {
        let mut guard = self.inner.lock();
        guard.get(key).map(|v| {
            let mut hit = v.clone();
            hit.cache_hit = true;
            hit
        })
    }

    /// Store a verdict if its method is cacheable; non-cacheable methods
    /// are ignored.
    pub fn put(&self, key: CacheKey, verdict: &Verdict) {
        if !verdict.method.is_cacheable() {
            return;
        }
        let mut stored = verdict.clone();
        stored.cache_hit = false;
        self.inner.lock().put(key, stored);
    }

    /// Number of cached verdicts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{Action, FailureClass, Method, Severity, Tier};

    fn verdict(method: Method) -> Verdict {
        let mut v = Verdict::new(
            Action::Block,
            Tier::Semantic,
            method,
            FailureClass::Toxicity,
            Severity::Critical,
            0.9,
            "test",
        );
        v.processing_time_ms = 42;
        v
    }

    #[test]
    fn round_trip_sets_cache_hit_and_keeps_timing() {
        let cache = DecisionCache::new(16);
        let key = DecisionCache::key("text", "v1", "hash");
        cache.put(key, &verdict(Method::Semantic));

        let hit = cache.get(&key).expect("entry should be present");
        assert!(hit.cache_hit);
        assert_eq!(hit.processing_time_ms, 42);
        assert_eq!(hit.action, Action::Block);
    }

    #[test]
    fn key_rotates_with_snapshot_identity() {
        let a = DecisionCache::key("text", "v1", "hash");
        let b = DecisionCache::key("text", "v2", "hash");
        let c = DecisionCache::key("text", "v1", "other");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn non_cacheable_methods_are_not_stored() {
        let cache = DecisionCache::new(16);
        let key = DecisionCache::key("t", "v", "h");
        let mut timeout = verdict(Method::SemanticTimeout);
        timeout.action = Action::Allow;
        timeout.failure_class = FailureClass::None;
        cache.put(key, &timeout);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn guard_verdicts_are_not_stored() {
        // Guard checks are cheaper to recompute than the key hash; the
        // cache must refuse them even if a caller threads a key through.
        let cache = DecisionCache::new(16);
        for method in [
            Method::GuardEmpty,
            Method::GuardPathological,
            Method::GuardSignature,
        ] {
            let key = DecisionCache::key(method.as_str(), "v", "h");
            let mut v = verdict(method);
            if method == Method::GuardEmpty {
                v.action = Action::Allow;
                v.failure_class = FailureClass::None;
            }
            cache.put(key, &v);
            assert!(cache.get(&key).is_none(), "{method} must not be cached");
        }
    }

    #[test]
    fn capacity_is_bounded_with_lru_eviction() {
        let cache = DecisionCache::new(2);
        let k1 = DecisionCache::key("1", "v", "h");
        let k2 = DecisionCache::key("2", "v", "h");
        let k3 = DecisionCache::key("3", "v", "h");
        cache.put(k1, &verdict(Method::Semantic));
        cache.put(k2, &verdict(Method::Semantic));
        let _ = cache.get(&k1);
        cache.put(k3, &verdict(Method::Semantic));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k2).is_none(), "LRU entry should be evicted");
        assert!(cache.get(&k1).is_some());
    }
}
