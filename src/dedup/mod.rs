//! Content-based deduplication within a decay window.
//!
//! Three index implementations share the [`DedupIndex`] trait:
//! - `exact`: hash map keyed by fingerprint, bounded only by the periodic sweep
//! - `lru`: fixed-capacity cache with TTL, bounded by construction
//! - `bloom`: time-decaying Bloom filter with a fixed cell array
//!
//! The exact index is the reference behaviour. When unique fingerprints
//! arrive faster than the sweep can retire them it grows without bound
//! between sweeps; the other two trade exactness for a hard memory ceiling.

pub mod bloom;
pub mod exact;
pub mod lru;

pub use bloom::DecayingBloomIndex;
pub use exact::ExactIndex;
pub use lru::LruIndex;

use crate::config::{DedupStrategy, StreamSettings};
use crate::record::{Fingerprint, LogRecord};
use tokio::time::Instant;

pub trait DedupIndex: Send {
    /// Returns `true` if `fingerprint` was seen less than the decay window
    /// ago. Otherwise records it as seen at `now` and returns `false`.
    ///
    /// A duplicate sighting does not refresh the entry.
    fn check_and_mark(&mut self, fingerprint: Fingerprint, now: Instant) -> bool;

    /// Fingerprints `record` and checks it. Fails open: a record without a
    /// fingerprint is never a duplicate.
    fn is_duplicate(&mut self, record: &LogRecord, now: Instant) -> bool {
        match Fingerprint::compute(record) {
            Ok(fingerprint) => self.check_and_mark(fingerprint, now),
            Err(_) => false,
        }
    }

    /// Drops entries older than the decay window. Returns how many went.
    fn sweep(&mut self, now: Instant) -> usize;

    /// Live entries (estimated for the Bloom filter).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn estimated_bytes(&self) -> usize;

    fn strategy(&self) -> DedupStrategy;
}

/// Builds the index selected by `settings.dedup_strategy`.
pub fn build_index(settings: &StreamSettings) -> Box<dyn DedupIndex> {
    let window = settings.decay_window_duration();
    match settings.dedup_strategy {
        DedupStrategy::Exact => Box::new(ExactIndex::new(window)),
        DedupStrategy::Lru => Box::new(LruIndex::new(window, settings.dedup_capacity as u64)),
        DedupStrategy::Bloom => Box::new(DecayingBloomIndex::new(
            window,
            settings.dedup_capacity,
            settings.bloom_false_positive_rate,
        )),
    }
}
