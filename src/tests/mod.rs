#[cfg(test)]
mod tests {
    use crate::compressor::{decompress, CompressedGroup, Compressor, GroupEncoder, PayloadEncoding};
    use crate::config::{DedupStrategy, StreamSettings};
    use crate::engine::{IngestReason, LogStreamEngine};
    use crate::error::{CompressionError, SinkError};
    use crate::grouper::Group;
    use crate::metrics::MetricsSnapshot;
    use crate::record::{EnrichedRecord, LogLevel, LogRecord};
    use crate::sink::{MemorySink, Sink, WriteReport};
    use async_trait::async_trait;
    use mockall::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    mock! {
        pub Sink {}
        #[async_trait]
        impl Sink for Sink {
            async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError>;
            async fn write_one(&self, record: Arc<EnrichedRecord>) -> Result<(), SinkError>;
        }
    }

    mock! {
        pub Encoder {}
        impl GroupEncoder for Encoder {
            fn compress(&self, group: &Group) -> Result<CompressedGroup, CompressionError>;
            fn passthrough(&self, group: &Group) -> Result<CompressedGroup, CompressionError>;
        }
    }

    fn corrupt() -> CompressionError {
        CompressionError::Corrupt("encoder unavailable".to_string())
    }

    /// Tracks how many batch writes overlap.
    #[derive(Default)]
    struct CountingSink {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        records: AtomicUsize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;

            let report = WriteReport::for_groups(&groups);
            self.records.fetch_add(report.records_written, Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(report)
        }

        async fn write_one(&self, _record: Arc<EnrichedRecord>) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            flush_interval: 60_000,
            sweep_interval: 60_000,
            ..StreamSettings::default()
        }
    }

    fn heartbeat() -> LogRecord {
        LogRecord::new("svc-a", LogLevel::Info, "heartbeat")
    }

    async fn wait_for(
        engine: &LogStreamEngine,
        predicate: impl Fn(&MetricsSnapshot) -> bool,
    ) -> MetricsSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = engine.snapshot();
            if predicate(&snapshot) || Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_within_window_then_accepted_after_sweep() {
        let settings = StreamSettings {
            decay_window: 50,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, Arc::new(MemorySink::new())).unwrap();
        engine.start().unwrap();

        assert!(engine.ingest(heartbeat()).accepted);

        let repeat = engine.ingest(heartbeat());
        assert!(!repeat.accepted);
        assert_eq!(repeat.reason, Some(IngestReason::Duplicate));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.sweep_dedup(), 1);
        assert!(engine.ingest(heartbeat()).accepted);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.total_ingested, 3);
        assert_eq!(snapshot.total_deduped, 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_task_expires_fingerprints() {
        let settings = StreamSettings {
            decay_window: 20,
            sweep_interval: 20,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, Arc::new(MemorySink::new())).unwrap();
        engine.start().unwrap();

        assert!(engine.ingest(heartbeat()).accepted);
        assert_eq!(engine.snapshot().dedup_entries, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let snapshot = wait_for(&engine, |s| s.dedup_entries == 0).await;
        assert_eq!(snapshot.dedup_entries, 0);
        assert!(engine.ingest(heartbeat()).accepted);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.snapshot().total_deduped, 0);
    }

    #[tokio::test]
    async fn test_dedup_strategies_agree_on_small_streams() {
        for strategy in [DedupStrategy::Exact, DedupStrategy::Lru, DedupStrategy::Bloom] {
            let settings = StreamSettings {
                dedup_strategy: strategy,
                dedup_capacity: 10_000,
                ..settings()
            };
            let engine = LogStreamEngine::new(settings, Arc::new(MemorySink::new())).unwrap();
            for round in 0..3 {
                for i in 0..20 {
                    let result = engine.ingest(LogRecord::new("svc", LogLevel::Info, format!("event {}", i)));
                    assert_eq!(result.accepted, round == 0, "{:?}", strategy);
                }
            }
            assert_eq!(engine.snapshot().total_deduped, 40);
            engine.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_recent_keeps_newest_records() {
        let settings = StreamSettings {
            ring_buffer_capacity: 5,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, Arc::new(MemorySink::new())).unwrap();
        for i in 1..=8 {
            engine.ingest(LogRecord::new("svc", LogLevel::Debug, format!("item {}", i)));
        }

        let recent: Vec<_> = engine
            .recent(10)
            .iter()
            .map(|r| r.record.message.clone())
            .collect();
        assert_eq!(recent, vec!["item 8", "item 7", "item 6", "item 5", "item 4"]);
        assert_eq!(engine.snapshot().ring_buffer_len, 5);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_exactly_once() {
        let mut sink = MockSink::new();
        sink.expect_write_batch()
            .times(1)
            .returning(|groups| {
                assert_eq!(groups.iter().map(|g| g.metadata.record_count).sum::<usize>(), 10);
                Ok(WriteReport::for_groups(&groups))
            });

        let settings = StreamSettings {
            batch_size_limit: 10,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, Arc::new(sink)).unwrap();
        engine.start().unwrap();

        for i in 0..10 {
            engine.ingest(LogRecord::new("svc", LogLevel::Info, format!("request {}", i)));
        }
        assert_eq!(engine.snapshot().current_batch_size, 0);

        let snapshot = wait_for(&engine, |s| s.batches_flushed == 1).await;
        assert_eq!(snapshot.records_written, 10);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_time_trigger_flushes_partial_batch() {
        let sink = Arc::new(MemorySink::new());
        let settings = StreamSettings {
            batch_size_limit: 1000,
            flush_interval: 100,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, sink.clone()).unwrap();
        engine.start().unwrap();

        engine.ingest(heartbeat());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = wait_for(&engine, |s| s.batches_flushed == 1).await;
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(sink.batched_record_count().await, 1);
        assert_eq!(sink.batch_calls(), 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_flush_under_concurrent_producers() {
        let sink = Arc::new(CountingSink::default());
        let settings = StreamSettings {
            batch_size_limit: 5,
            ..settings()
        };
        let engine = Arc::new(LogStreamEngine::new(settings, sink.clone()).unwrap());
        engine.start().unwrap();

        let producers: Vec<_> = (0..100)
            .map(|producer| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    for i in 0..10 {
                        let record = LogRecord::new(
                            format!("producer-{}", producer % 7),
                            LogLevel::Info,
                            format!("producer {} event {}", producer, i),
                        );
                        assert!(engine.ingest(record).accepted);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        engine.shutdown().await.unwrap();

        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(sink.records.load(Ordering::SeqCst), 1000);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.max_concurrent_flushes, 1);
        assert_eq!(snapshot.records_written, 1000);
        assert_eq!(snapshot.batches_flushed as usize, sink.batches.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_single_writes() {
        let mut sink = MockSink::new();
        sink.expect_write_batch()
            .times(1)
            .returning(|_| Err(SinkError::Unavailable("connection reset".to_string())));
        sink.expect_write_one().times(5).returning(|_| Ok(()));

        let settings = StreamSettings {
            batch_size_limit: 5,
            ..settings()
        };
        let engine = LogStreamEngine::new(settings, Arc::new(sink)).unwrap();
        engine.start().unwrap();
        for i in 0..5 {
            engine.ingest(LogRecord::new("svc", LogLevel::Error, format!("failure {}", i)));
        }
        engine.shutdown().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.degraded_batches, 1);
        assert_eq!(snapshot.fallback_records_written, 5);
        assert_eq!(snapshot.fallback_records_failed, 0);
        assert_eq!(snapshot.records_written, 0);
        assert_eq!(snapshot.compression_ratio, 1.0);
    }

    #[tokio::test]
    async fn test_fallback_reports_partial_failures() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_batches(true);
        sink.reject_message(Some("poison"));

        let engine = LogStreamEngine::new(settings(), sink.clone()).unwrap();
        engine.ingest(LogRecord::new("svc", LogLevel::Info, "fine"));
        engine.ingest(LogRecord::new("svc", LogLevel::Info, "poison"));
        engine.ingest(LogRecord::new("svc", LogLevel::Info, "also fine"));
        engine.shutdown().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.fallback_records_written, 2);
        assert_eq!(snapshot.fallback_records_failed, 1);

        let written: Vec<_> = sink
            .single_writes()
            .await
            .iter()
            .map(|r| r.record.message.clone())
            .collect();
        assert_eq!(written, vec!["fine", "also fine"]);
    }

    #[tokio::test]
    async fn test_persisted_groups_restore_records() {
        let sink = Arc::new(MemorySink::new());
        let engine = LogStreamEngine::new(settings(), sink.clone()).unwrap();

        engine.ingest(
            LogRecord::new("api", LogLevel::Info, "GET /users 200")
                .with_metadata("host", "web-01")
                .with_perf_ms(12.5),
        );
        engine.ingest(LogRecord::new("db", LogLevel::Warn, "slow query").with_perf_ms(950.0));
        engine.ingest(
            LogRecord::new("api", LogLevel::Info, "GET /orders 200").with_metadata("host", "web-01"),
        );
        let mut accepted = engine.recent(3);
        accepted.reverse();
        engine.shutdown().await.unwrap();

        let groups = sink.groups().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].metadata.source, "api");

        let restored: Vec<EnrichedRecord> = groups
            .iter()
            .flat_map(|g| decompress(&g.payload).unwrap())
            .collect();
        let expected = vec![
            accepted[0].as_ref().clone(),
            accepted[2].as_ref().clone(),
            accepted[1].as_ref().clone(),
        ];
        assert_eq!(restored, expected);
    }

    #[tokio::test]
    async fn test_heartbeat_scenario() {
        let sink = Arc::new(MemorySink::new());
        let engine = LogStreamEngine::new(StreamSettings::default(), sink.clone()).unwrap();
        engine.start().unwrap();

        let accepted = (0..25).filter(|_| engine.ingest(heartbeat()).accepted).count();
        assert_eq!(accepted, 1);
        engine.shutdown().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.total_ingested, 25);
        assert_eq!(snapshot.total_deduped, 24);
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(snapshot.records_written, 1);
        assert!(snapshot.compression_ratio <= 1.0);
        assert_eq!(sink.batched_record_count().await, 1);
    }

    #[tokio::test]
    async fn test_compression_failure_stores_groups_uncompressed() {
        let mut encoder = MockEncoder::new();
        encoder.expect_compress().times(2).returning(|_| Err(corrupt()));
        encoder
            .expect_passthrough()
            .times(2)
            .returning(|group| Compressor::default().passthrough(group));

        let sink = Arc::new(MemorySink::new());
        let engine =
            LogStreamEngine::with_encoder(settings(), sink.clone(), Arc::new(encoder)).unwrap();
        engine.ingest(LogRecord::new("api", LogLevel::Info, "GET /users 200"));
        engine.ingest(LogRecord::new("db", LogLevel::Warn, "slow query"));
        engine.ingest(LogRecord::new("api", LogLevel::Info, "GET /orders 200"));
        engine.shutdown().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.compression_errors, 2);
        assert_eq!(snapshot.degraded_batches, 0);
        assert_eq!(snapshot.records_written, 3);

        let groups = sink.groups().await;
        assert_eq!(groups.len(), 2);
        assert!(groups
            .iter()
            .all(|g| g.metadata.encoding == PayloadEncoding::Passthrough));
        let restored: usize = groups
            .iter()
            .map(|g| decompress(&g.payload).unwrap().len())
            .sum();
        assert_eq!(restored, 3);
    }

    #[tokio::test]
    async fn test_failed_passthrough_falls_back_to_single_writes() {
        let mut encoder = MockEncoder::new();
        encoder.expect_compress().times(1).returning(|_| Err(corrupt()));
        encoder.expect_passthrough().times(1).returning(|_| Err(corrupt()));

        let sink = Arc::new(MemorySink::new());
        let engine =
            LogStreamEngine::with_encoder(settings(), sink.clone(), Arc::new(encoder)).unwrap();
        for i in 0..3 {
            engine.ingest(LogRecord::new("svc", LogLevel::Error, format!("failure {}", i)));
        }
        engine.shutdown().await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.compression_errors, 1);
        assert_eq!(snapshot.degraded_batches, 1);
        assert_eq!(snapshot.fallback_records_written, 3);
        assert_eq!(snapshot.records_written, 0);
        assert_eq!(sink.batch_calls(), 0);
        assert_eq!(sink.single_writes().await.len(), 3);
    }
}
