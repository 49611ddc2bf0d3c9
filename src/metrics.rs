//! Engine metrics
//!
//! Atomic counters updated from producers and the flush worker.
//! Counters use relaxed ordering; a snapshot is eventually consistent,
//! never torn per counter. The in-flight flush gauge and its peak use
//! acquire/release so the peak never misses an overlapping flush.

use crate::batcher::BatcherState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters owned by the engine.
///
/// All methods are safe to call from multiple threads concurrently.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    /// Every `ingest` call, duplicates and rejections included
    ingested: AtomicU64,

    /// Records dropped as duplicates
    deduped: AtomicU64,

    /// Records accepted without a fingerprint
    malformed: AtomicU64,

    /// Records refused because the engine was draining or stopped
    rejected: AtomicU64,

    /// Batches the flush worker finished, successfully or degraded
    batches_flushed: AtomicU64,

    /// Records committed through an atomic batch write
    records_written: AtomicU64,

    /// Batches whose atomic write failed
    degraded_batches: AtomicU64,

    fallback_written: AtomicU64,
    fallback_failed: AtomicU64,

    /// Groups whose compression failed and were stored as pass-through
    compression_errors: AtomicU64,

    /// Seal attempts skipped because the hand-off channel was full
    flushes_deferred: AtomicU64,

    /// Uncompressed bytes of committed groups
    bytes_original: AtomicU64,

    /// Stored bytes of committed groups
    bytes_compressed: AtomicU64,

    /// Sum of seal-to-completion latencies in microseconds
    flush_latency_us: AtomicU64,

    flushes_in_flight: AtomicU64,
    max_concurrent_flushes: AtomicU64,
}

/// Engine-side values sampled under the engine lock at snapshot time.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    pub state: BatcherState,
    pub current_batch_size: usize,
    pub estimated_memory_bytes: usize,
    pub dedup_entries: usize,
    pub ring_buffer_len: usize,
    pub uptime: Duration,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_ingest(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.deduped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deferred(&self) {
        self.flushes_deferred.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_compression_error(&self) {
        self.compression_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed atomic batch write
    pub fn record_batch_written(&self, records: usize, original_bytes: usize, compressed_bytes: usize) {
        self.records_written
            .fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_original
            .fetch_add(original_bytes as u64, Ordering::Relaxed);
        self.bytes_compressed
            .fetch_add(compressed_bytes as u64, Ordering::Relaxed);
    }

    /// Record a batch that went through the per-record fallback
    pub fn record_degraded(&self, written: usize, failed: usize) {
        self.degraded_batches.fetch_add(1, Ordering::Relaxed);
        self.fallback_written
            .fetch_add(written as u64, Ordering::Relaxed);
        self.fallback_failed
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Marks a flush as running until the returned guard drops.
    pub fn flush_started(&self) -> FlushGuard<'_> {
        let running = self.flushes_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_flushes
            .fetch_max(running, Ordering::AcqRel);
        FlushGuard { metrics: self }
    }

    /// Record a finished flush and its seal-to-completion latency
    pub fn record_flush_complete(&self, latency: Duration) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.flush_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        let total_ingested = self.ingested.load(Ordering::Relaxed);
        let total_deduped = self.deduped.load(Ordering::Relaxed);
        let batches_flushed = self.batches_flushed.load(Ordering::Relaxed);
        let latency_us = self.flush_latency_us.load(Ordering::Relaxed);
        let bytes_original = self.bytes_original.load(Ordering::Relaxed);
        let bytes_compressed = self.bytes_compressed.load(Ordering::Relaxed);

        let avg_latency_ms = if batches_flushed == 0 {
            0.0
        } else {
            latency_us as f64 / batches_flushed as f64 / 1000.0
        };
        let compression_ratio = if bytes_original == 0 {
            1.0
        } else {
            bytes_compressed as f64 / bytes_original as f64
        };
        let dedup_ratio = if total_ingested == 0 {
            0.0
        } else {
            total_deduped as f64 / total_ingested as f64
        };
        let uptime_secs = gauges.uptime.as_secs_f64();
        let throughput_per_sec = if uptime_secs > 0.0 {
            total_ingested as f64 / uptime_secs
        } else {
            0.0
        };

        MetricsSnapshot {
            state: gauges.state,
            total_ingested,
            total_deduped,
            malformed_records: self.malformed.load(Ordering::Relaxed),
            rejected_records: self.rejected.load(Ordering::Relaxed),
            batches_flushed,
            records_written: self.records_written.load(Ordering::Relaxed),
            degraded_batches: self.degraded_batches.load(Ordering::Relaxed),
            fallback_records_written: self.fallback_written.load(Ordering::Relaxed),
            fallback_records_failed: self.fallback_failed.load(Ordering::Relaxed),
            compression_errors: self.compression_errors.load(Ordering::Relaxed),
            flushes_deferred: self.flushes_deferred.load(Ordering::Relaxed),
            avg_latency_ms,
            compression_ratio,
            dedup_ratio,
            throughput_per_sec,
            max_concurrent_flushes: self.max_concurrent_flushes.load(Ordering::Acquire),
            current_batch_size: gauges.current_batch_size,
            estimated_memory_bytes: gauges.estimated_memory_bytes,
            dedup_entries: gauges.dedup_entries,
            ring_buffer_len: gauges.ring_buffer_len,
        }
    }
}

/// Decrements the in-flight flush count on drop.
pub struct FlushGuard<'a> {
    metrics: &'a MetricsRecorder,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .flushes_in_flight
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time copy of the engine metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub state: BatcherState,
    pub total_ingested: u64,
    pub total_deduped: u64,
    pub malformed_records: u64,
    pub rejected_records: u64,
    pub batches_flushed: u64,
    pub records_written: u64,
    pub degraded_batches: u64,
    pub fallback_records_written: u64,
    pub fallback_records_failed: u64,
    pub compression_errors: u64,
    pub flushes_deferred: u64,
    /// Mean time from seal to sink completion
    pub avg_latency_ms: f64,
    /// Stored bytes over original bytes across committed groups; 1.0 before
    /// the first write
    pub compression_ratio: f64,
    pub dedup_ratio: f64,
    /// Ingest calls per second since the engine was created
    pub throughput_per_sec: f64,
    pub max_concurrent_flushes: u64,
    pub current_batch_size: usize,
    pub estimated_memory_bytes: usize,
    pub dedup_entries: usize,
    pub ring_buffer_len: usize,
}
