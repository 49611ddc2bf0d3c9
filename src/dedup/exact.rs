use super::DedupIndex;
use crate::config::DedupStrategy;
use crate::record::Fingerprint;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Approximate per-entry cost of a `HashMap<Fingerprint, Instant>` slot
/// including control bytes and load-factor slack.
const ENTRY_OVERHEAD_BYTES: usize = 48;

/// Capacity a sweep never shrinks below.
const MIN_RETAINED_CAPACITY: usize = 64;

/// Exact fingerprint index. One entry per fingerprint, never probabilistic.
#[derive(Debug)]
pub struct ExactIndex {
    entries: HashMap<Fingerprint, Instant>,
    decay_window: Duration,
}

impl ExactIndex {
    pub fn new(decay_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            decay_window,
        }
    }

    pub fn last_seen(&self, fingerprint: &Fingerprint) -> Option<Instant> {
        self.entries.get(fingerprint).copied()
    }
}

impl DedupIndex for ExactIndex {
    fn check_and_mark(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        if let Some(last_seen) = self.entries.get(&fingerprint) {
            if now.saturating_duration_since(*last_seen) < self.decay_window {
                return true;
            }
        }
        self.entries.insert(fingerprint, now);
        false
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let window = self.decay_window;
        self.entries
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) < window);

        let len = self.entries.len();
        if self.entries.capacity() > MIN_RETAINED_CAPACITY && len < self.entries.capacity() / 4 {
            self.entries.shrink_to((len * 2).max(MIN_RETAINED_CAPACITY));
        }
        before - len
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn estimated_bytes(&self) -> usize {
        self.entries.capacity() * ENTRY_OVERHEAD_BYTES
    }

    fn strategy(&self) -> DedupStrategy {
        DedupStrategy::Exact
    }
}
