//! logstream: bounded-memory log stream processing
//!
//! This library ingests discrete log records from concurrent producers,
//! drops content duplicates inside a decay window, batches what remains,
//! groups each batch by source and time window, compresses every group and
//! hands the result to a pluggable [`Sink`]. When a batched write fails the
//! records are written one at a time instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use logstream::{LogLevel, LogRecord, LogStreamEngine, MemorySink, StreamSettings};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Initialize settings
//!     let settings = StreamSettings::new()?;
//!
//!     // Create the engine over an in-memory sink
//!     let sink = Arc::new(MemorySink::new());
//!     let engine = LogStreamEngine::new(settings, sink.clone())?;
//!     engine.start()?;
//!
//!     // Ingest records
//!     for _ in 0..25 {
//!         let result = engine.ingest(LogRecord::new("svc-a", LogLevel::Info, "heartbeat"));
//!         println!("accepted: {}", result.accepted);
//!     }
//!
//!     // Drain and inspect
//!     engine.shutdown().await?;
//!     println!("metrics: {:?}", engine.snapshot());
//!     println!("groups written: {}", sink.groups().await.len());
//!
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod compressor;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod grouper;
pub mod metrics;
pub mod record;
pub mod ring_buffer;
pub mod sink;
pub mod tests;

pub use batcher::{BatcherState, FlushTrigger};
pub use compressor::{
    decompress, CompressedGroup, Compressor, GroupEncoder, GroupMetadata, PayloadEncoding,
};
pub use config::{DedupStrategy, StreamSettings};
pub use engine::{FallbackReport, IngestReason, IngestResult, LogStreamEngine};
pub use error::{CompressionError, EngineError, RecordError, SettingsError, SinkError};
pub use metrics::MetricsSnapshot;
pub use record::{EnrichedRecord, Fingerprint, LogLevel, LogRecord};
pub use sink::{DirectorySink, MemorySink, Sink, WriteReport};
