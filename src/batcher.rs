//! Batch accumulation and the size/time/memory flush policy.

use crate::config::StreamSettings;
use crate::record::EnrichedRecord;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of the batching pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatcherState {
    Accumulating,
    Flushing,
    Draining,
    Stopped,
}

impl BatcherState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            BatcherState::Accumulating => 0,
            BatcherState::Flushing => 1,
            BatcherState::Draining => 2,
            BatcherState::Stopped => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => BatcherState::Accumulating,
            1 => BatcherState::Flushing,
            2 => BatcherState::Draining,
            _ => BatcherState::Stopped,
        }
    }
}

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Time,
    Memory,
    Manual,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Time => "time",
            FlushTrigger::Memory => "memory",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A sealed batch, handed from the batcher to the flush worker.
#[derive(Debug)]
pub struct Batch {
    pub id: String,
    pub records: Vec<Arc<EnrichedRecord>>,
    pub trigger: FlushTrigger,
    pub sealed_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulates records for the current batch and evaluates flush triggers.
#[derive(Debug)]
pub struct Batcher {
    batch_id: String,
    records: Vec<Arc<EnrichedRecord>>,
    /// Set on the first append of each cycle.
    batch_start: Option<Instant>,
    batch_bytes: usize,
    size_limit: usize,
    flush_interval: Duration,
    memory_threshold: usize,
}

impl Batcher {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            batch_id: new_batch_id(),
            records: Vec::with_capacity(settings.batch_size_limit),
            batch_start: None,
            batch_bytes: 0,
            size_limit: settings.batch_size_limit,
            flush_interval: settings.flush_interval_duration(),
            memory_threshold: settings.memory_threshold_bytes(),
        }
    }

    /// Id stamped on records appended to the current batch.
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn append(&mut self, record: Arc<EnrichedRecord>, now: Instant) {
        if self.batch_start.is_none() {
            self.batch_start = Some(now);
        }
        self.batch_bytes += record.estimated_size() + std::mem::size_of::<Arc<EnrichedRecord>>();
        self.records.push(record);
    }

    /// Evaluates size, then time, then memory. `engine_memory` is the
    /// engine-wide estimate including this batch. An empty batch never
    /// triggers.
    pub fn check_triggers(&self, now: Instant, engine_memory: usize) -> Option<FlushTrigger> {
        if self.records.is_empty() {
            return None;
        }
        if self.records.len() >= self.size_limit {
            return Some(FlushTrigger::Size);
        }
        if self.is_due(now) {
            return Some(FlushTrigger::Time);
        }
        if engine_memory >= self.memory_threshold {
            return Some(FlushTrigger::Memory);
        }
        None
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.batch_start {
            Some(start) => now.saturating_duration_since(start) >= self.flush_interval,
            None => false,
        }
    }

    /// Swaps the current batch for an empty one with a fresh id.
    /// Returns `None` without touching state when there is nothing to flush.
    pub fn take(&mut self, trigger: FlushTrigger, now: Instant) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.size_limit));
        let id = std::mem::replace(&mut self.batch_id, new_batch_id());
        self.batch_start = None;
        self.batch_bytes = 0;

        Some(Batch {
            id,
            records,
            trigger,
            sealed_at: now,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch_bytes
    }
}

fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}
