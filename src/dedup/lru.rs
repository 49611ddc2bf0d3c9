use super::DedupIndex;
use crate::config::DedupStrategy;
use crate::record::Fingerprint;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::time::Duration;
use tokio::time::Instant;

/// Approximate per-entry cost inside the cache (key, value, deque nodes).
const ENTRY_OVERHEAD_BYTES: usize = 96;

/// Fixed-capacity fingerprint index.
///
/// Uses a bounded moka cache:
/// - Maximum capacity, with least-recently-used eviction beyond it
/// - TTL equal to the decay window so entries retire without a sweep
///
/// A fingerprint evicted for capacity before its window lapses is simply
/// forgotten, so under overload a duplicate can slip through. It is never
/// wrongly reported as a duplicate.
pub struct LruIndex {
    cache: Cache<Fingerprint, Instant>,
    decay_window: Duration,
    max_capacity: u64,
}

impl LruIndex {
    pub fn new(decay_window: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(decay_window)
            .build();

        Self {
            cache,
            decay_window,
            max_capacity,
        }
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }
}

impl DedupIndex for LruIndex {
    fn check_and_mark(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        if let Some(last_seen) = self.cache.get(&fingerprint) {
            if now.saturating_duration_since(last_seen) < self.decay_window {
                return true;
            }
        }
        self.cache.insert(fingerprint, now);
        false
    }

    fn sweep(&mut self, _now: Instant) -> usize {
        let before = self.cache.entry_count();
        self.cache.run_pending_tasks();
        before.saturating_sub(self.cache.entry_count()) as usize
    }

    fn len(&self) -> usize {
        self.cache.entry_count() as usize
    }

    fn estimated_bytes(&self) -> usize {
        self.cache.entry_count() as usize * ENTRY_OVERHEAD_BYTES
    }

    fn strategy(&self) -> DedupStrategy {
        DedupStrategy::Lru
    }
}
