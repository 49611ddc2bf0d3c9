use super::{Sink, WriteReport};
use crate::compressor::CompressedGroup;
use crate::error::SinkError;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory sink.
///
/// Keeps every committed group and every degraded single-record write.
/// Batch writes can be forced to fail, and individual records can be
/// rejected by message, to exercise the degraded path.
#[derive(Default)]
pub struct MemorySink {
    groups: Arc<Mutex<Vec<CompressedGroup>>>,
    singles: Arc<Mutex<Vec<Arc<EnrichedRecord>>>>,
    fail_batches: AtomicBool,
    reject_message: parking_lot::Mutex<Option<String>>,
    batch_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `write_batch` fail.
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// Rejects single-record writes whose message equals `message`.
    pub fn reject_message(&self, message: Option<&str>) {
        *self.reject_message.lock() = message.map(str::to_string);
    }

    pub async fn groups(&self) -> Vec<CompressedGroup> {
        self.groups.lock().await.clone()
    }

    pub async fn single_writes(&self) -> Vec<Arc<EnrichedRecord>> {
        self.singles.lock().await.clone()
    }

    /// Records committed through `write_batch`.
    pub async fn batched_record_count(&self) -> usize {
        self.groups
            .lock()
            .await
            .iter()
            .map(|g| g.metadata.record_count)
            .sum()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("batch writes disabled".to_string()));
        }

        let report = WriteReport::for_groups(&groups);
        let mut stored = self.groups.lock().await;
        stored.extend(groups);
        Ok(report)
    }

    async fn write_one(&self, record: Arc<EnrichedRecord>) -> Result<(), SinkError> {
        let rejected =
            self.reject_message.lock().as_deref() == Some(record.record.message.as_str());
        if rejected {
            return Err(SinkError::Rejected(format!(
                "record {} refused",
                record.fingerprint
            )));
        }

        self.singles.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;
    use crate::grouper;
    use crate::record::{LogLevel, LogRecord};
    use chrono::Utc;
    use std::time::Duration;

    fn compressed(messages: &[&str]) -> Vec<CompressedGroup> {
        let records: Vec<_> = messages
            .iter()
            .map(|m| {
                Arc::new(EnrichedRecord::new(
                    LogRecord::new("svc", LogLevel::Info, *m),
                    "b",
                    Utc::now(),
                ))
            })
            .collect();
        grouper::group(&records, Duration::from_secs(300))
            .iter()
            .map(|g| Compressor::default().compress(g).unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_write_reports_counts() {
        let sink = MemorySink::new();
        let report = sink.write_batch(compressed(&["a", "b", "c"])).await.unwrap();

        assert_eq!(report.records_written, 3);
        assert_eq!(report.groups_written, 1);
        assert_eq!(sink.batched_record_count().await, 3);
    }

    #[test]
    fn test_failure_injection() {
        let sink = MemorySink::new();
        sink.fail_batches(true);
        sink.reject_message(Some("poison"));

        tokio_test::block_on(async {
            assert!(sink.write_batch(compressed(&["a"])).await.is_err());
            assert_eq!(sink.batch_calls(), 1);

            let ok = Arc::new(EnrichedRecord::new(
                LogRecord::new("svc", LogLevel::Info, "fine"),
                "b",
                Utc::now(),
            ));
            let bad = Arc::new(EnrichedRecord::new(
                LogRecord::new("svc", LogLevel::Info, "poison"),
                "b",
                Utc::now(),
            ));
            assert!(sink.write_one(ok).await.is_ok());
            assert!(matches!(sink.write_one(bad).await, Err(SinkError::Rejected(_))));
            assert_eq!(sink.single_writes().await.len(), 1);
        });
    }
}
