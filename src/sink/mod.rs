//! Persistence boundary for compressed batches.
//!
//! This module provides the [`Sink`] trait and two implementations:
//! - `memory`: in-process store with failure injection, for tests and dry runs
//! - `directory`: one file per group, committed by rename, plus a JSON-lines
//!   file for records written through the degraded path
//!
//! The engine treats a sink as an opaque capability. `write_batch` must be
//! all-or-nothing from the engine's point of view; when it fails the engine
//! never retries it and instead pushes every record through `write_one`.

pub mod directory;
pub mod memory;

pub use directory::DirectorySink;
pub use memory::MemorySink;

use crate::compressor::CompressedGroup;
use crate::error::SinkError;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Summary of a successful atomic batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub groups_written: usize,
    pub records_written: usize,
    pub bytes_written: usize,
}

impl WriteReport {
    pub fn for_groups(groups: &[CompressedGroup]) -> Self {
        Self {
            groups_written: groups.len(),
            records_written: groups.iter().map(|g| g.metadata.record_count).sum(),
            bytes_written: groups.iter().map(|g| g.compressed_size).sum(),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Writes every group or none of them.
    async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError>;

    /// Writes one record; used only on the degraded path.
    async fn write_one(&self, record: Arc<EnrichedRecord>) -> Result<(), SinkError>;
}
