use super::DedupIndex;
use crate::config::DedupStrategy;
use crate::record::Fingerprint;
use std::time::Duration;
use tokio::time::Instant;

const MAX_HASHES: u32 = 16;

/// Time-decaying Bloom filter.
///
/// Every cell stores the time it was last set instead of a bit. A fingerprint
/// is a duplicate when all of its cells were set within the decay window, so
/// entries age out on their own and the sweep only reclaims stale cells for
/// the occupancy estimate. Memory is fixed at construction: `m` cells of
/// 8 bytes sized for `expected_items` at the requested false-positive rate.
///
/// False positives drop a unique record; there are no false negatives inside
/// the window.
#[derive(Debug)]
pub struct DecayingBloomIndex {
    /// 0 = never set, otherwise elapsed millis since `origin` plus one.
    cells: Vec<u64>,
    hashes: u32,
    origin: Instant,
    window_ms: u64,
    occupied: usize,
}

impl DecayingBloomIndex {
    pub fn new(decay_window: Duration, expected_items: usize, false_positive_rate: f64) -> Self {
        let (cells, hashes) = optimal_dimensions(expected_items.max(1), false_positive_rate);
        Self {
            cells: vec![0; cells],
            hashes,
            origin: Instant::now(),
            window_ms: decay_window.as_millis() as u64,
            occupied: 0,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    /// Membership test without marking.
    pub fn contains(&self, fingerprint: Fingerprint, now: Instant) -> bool {
        let stamp = self.stamp(now);
        self.positions(fingerprint)
            .all(|i| self.is_live(self.cells[i], stamp))
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64 + 1
    }

    fn is_live(&self, cell: u64, stamp: u64) -> bool {
        cell != 0 && stamp.saturating_sub(cell) < self.window_ms
    }

    /// Kirsch-Mitzenmacher double hashing over the two fingerprint halves.
    fn positions(&self, fingerprint: Fingerprint) -> impl Iterator<Item = usize> {
        let value = fingerprint.as_u128();
        let h1 = value as u64;
        let h2 = ((value >> 64) as u64) | 1;
        let m = self.cells.len() as u64;
        (0..self.hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}

/// `m = -n ln p / (ln 2)^2`, `k = (m / n) ln 2`.
fn optimal_dimensions(expected_items: usize, false_positive_rate: f64) -> (usize, u32) {
    let ln2 = std::f64::consts::LN_2;
    let n = expected_items as f64;
    let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(64.0);
    let k = ((m / n) * ln2).round().clamp(1.0, MAX_HASHES as f64);
    (m as usize, k as u32)
}

impl DedupIndex for DecayingBloomIndex {
    fn check_and_mark(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        if self.contains(fingerprint, now) {
            return true;
        }

        let stamp = self.stamp(now);
        let positions: Vec<usize> = self.positions(fingerprint).collect();
        for i in positions {
            if self.cells[i] == 0 {
                self.occupied += 1;
            }
            self.cells[i] = stamp;
        }
        false
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let stamp = self.stamp(now);
        let window_ms = self.window_ms;
        let mut cleared = 0;
        for cell in self.cells.iter_mut() {
            if *cell != 0 && stamp.saturating_sub(*cell) >= window_ms {
                *cell = 0;
                cleared += 1;
            }
        }
        self.occupied -= cleared;
        cleared / self.hashes as usize
    }

    fn len(&self) -> usize {
        self.occupied / self.hashes as usize
    }

    fn estimated_bytes(&self) -> usize {
        self.cells.len() * std::mem::size_of::<u64>()
    }

    fn strategy(&self) -> DedupStrategy {
        DedupStrategy::Bloom
    }
}
