//! The stream processing engine.
//!
//! One [`LogStreamEngine`] owns all pipeline state. Producers call
//! [`LogStreamEngine::ingest`] concurrently; a single worker task persists
//! sealed batches, so at most one flush is ever in flight.
//!
//! ```text
//!  producers ──ingest──▶ [dedup → ring → batcher] ──seal──▶ mpsc ──▶ flush worker
//!                              ▲        ▲                               │
//!                      sweep task   flush timer             group → compress → sink
//! ```

use crate::batcher::{Batch, Batcher, BatcherState, FlushTrigger};
use crate::compressor::{CompressedGroup, Compressor, GroupEncoder};
use crate::config::StreamSettings;
use crate::dedup::{self, DedupIndex};
use crate::error::{EngineError, RecordError, SinkError};
use crate::grouper;
use crate::metrics::{Gauges, MetricsRecorder, MetricsSnapshot};
use crate::record::{EnrichedRecord, Fingerprint, LogRecord};
use crate::ring_buffer::RingBuffer;
use crate::sink::{Sink, WriteReport};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a record was dropped, or accepted with a caveat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestReason {
    Duplicate,
    /// Accepted without deduplication.
    Malformed(RecordError),
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub accepted: bool,
    pub reason: Option<IngestReason>,
}

impl IngestResult {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: IngestReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// Outcome of the per-record fallback for one batch.
#[derive(Debug, Default)]
pub struct FallbackReport {
    pub written: usize,
    /// Position in the batch and the error for each record that failed.
    pub failed: Vec<(usize, SinkError)>,
}

enum FlushCommand {
    Flush(Batch),
    /// Acknowledged once every batch queued before it has been processed.
    Drain(oneshot::Sender<()>),
}

/// State guarded by the engine lock.
struct Core {
    dedup: Box<dyn DedupIndex>,
    ring: RingBuffer<Arc<EnrichedRecord>>,
    ring_bytes: usize,
    batcher: Batcher,
}

impl Core {
    fn remember(&mut self, record: Arc<EnrichedRecord>) {
        self.ring_bytes += record.estimated_size();
        if let Some(evicted) = self.ring.insert(record) {
            self.ring_bytes = self.ring_bytes.saturating_sub(evicted.estimated_size());
        }
    }

    /// Records shared by the ring and the open batch are counted twice.
    fn estimated_bytes(&self) -> usize {
        self.batcher.estimated_bytes() + self.dedup.estimated_bytes() + self.ring_bytes
    }
}

struct EngineInner {
    settings: StreamSettings,
    core: Mutex<Core>,
    state: AtomicU8,
    metrics: MetricsRecorder,
    sink: Arc<dyn Sink>,
    encoder: Arc<dyn GroupEncoder>,
    flush_tx: mpsc::Sender<FlushCommand>,
    created_at: Instant,
}

struct EngineTasks {
    cancel: CancellationToken,
    timer: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    worker: JoinHandle<()>,
}

enum Lifecycle {
    Idle(mpsc::Receiver<FlushCommand>),
    Running(EngineTasks),
    /// A shutdown is in progress; flips to `true` once it has drained.
    Draining(watch::Receiver<bool>),
    Finished,
}

enum ShutdownStep {
    Drain(EngineTasks, watch::Sender<bool>),
    Wait(watch::Receiver<bool>),
    Done,
}

pub struct LogStreamEngine {
    inner: Arc<EngineInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl LogStreamEngine {
    /// Validates `settings` and builds an idle engine.
    ///
    /// Records may be ingested before [`start`](Self::start); sealed batches
    /// queue until the worker runs.
    pub fn new(settings: StreamSettings, sink: Arc<dyn Sink>) -> Result<Self, EngineError> {
        let encoder = Arc::new(Compressor::new(settings.compression_level));
        Self::with_encoder(settings, sink, encoder)
    }

    /// Like [`new`](Self::new), with a custom group encoder in place of the
    /// gzip [`Compressor`].
    pub fn with_encoder(
        settings: StreamSettings,
        sink: Arc<dyn Sink>,
        encoder: Arc<dyn GroupEncoder>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;

        let (flush_tx, flush_rx) = mpsc::channel(settings.max_pending_flushes);
        let core = Core {
            dedup: dedup::build_index(&settings),
            ring: RingBuffer::new(settings.ring_buffer_capacity),
            ring_bytes: 0,
            batcher: Batcher::new(&settings),
        };

        let inner = EngineInner {
            encoder,
            settings,
            core: Mutex::new(core),
            state: AtomicU8::new(BatcherState::Accumulating.as_u8()),
            metrics: MetricsRecorder::new(),
            sink,
            flush_tx,
            created_at: Instant::now(),
        };

        Ok(Self {
            inner: Arc::new(inner),
            lifecycle: Mutex::new(Lifecycle::Idle(flush_rx)),
        })
    }

    /// Spawns the flush worker, the flush timer and the dedup sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Finished) {
            Lifecycle::Idle(receiver) => {
                *lifecycle = Lifecycle::Running(self.spawn_tasks(receiver));
                info!(
                    batch_size_limit = self.inner.settings.batch_size_limit,
                    flush_interval_ms = self.inner.settings.flush_interval,
                    dedup_strategy = ?self.inner.settings.dedup_strategy,
                    "log stream engine started"
                );
                Ok(())
            }
            Lifecycle::Running(tasks) => {
                *lifecycle = Lifecycle::Running(tasks);
                Err(EngineError::AlreadyStarted)
            }
            Lifecycle::Draining(done) => {
                *lifecycle = Lifecycle::Draining(done);
                Err(EngineError::Stopped)
            }
            Lifecycle::Finished => Err(EngineError::Stopped),
        }
    }

    fn spawn_tasks(&self, receiver: mpsc::Receiver<FlushCommand>) -> EngineTasks {
        let cancel = CancellationToken::new();
        EngineTasks {
            worker: tokio::spawn(Arc::clone(&self.inner).run_worker(receiver)),
            timer: tokio::spawn(Arc::clone(&self.inner).run_flush_timer(cancel.clone())),
            sweeper: tokio::spawn(Arc::clone(&self.inner).run_sweeper(cancel.clone())),
            cancel,
        }
    }

    /// Offers one record to the engine. Never blocks on I/O.
    pub fn ingest(&self, record: LogRecord) -> IngestResult {
        self.inner.ingest(record)
    }

    /// Seals the open batch now. Returns whether a batch was handed off.
    pub fn flush(&self) -> bool {
        let mut core = self.inner.core.lock();
        if !self.inner.accepting() {
            return false;
        }
        self.inner.seal(&mut core, FlushTrigger::Manual, Instant::now())
    }

    /// Runs the dedup sweep immediately. Returns the number of entries evicted.
    pub fn sweep_dedup(&self) -> usize {
        self.inner.sweep_dedup()
    }

    /// Up to `n` most recently accepted records, newest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<EnrichedRecord>> {
        self.inner.core.lock().ring.recent(n)
    }

    pub fn state(&self) -> BatcherState {
        self.inner.state()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let gauges = {
            let core = self.inner.core.lock();
            Gauges {
                state: self.inner.state(),
                current_batch_size: core.batcher.len(),
                estimated_memory_bytes: core.estimated_bytes(),
                dedup_entries: core.dedup.len(),
                ring_buffer_len: core.ring.len(),
                uptime: self.inner.created_at.elapsed(),
            }
        };
        self.inner.metrics.snapshot(gauges)
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Stops intake, flushes everything still buffered and waits for the
    /// sink to finish with it.
    ///
    /// An engine that was never started is started first so nothing is lost.
    /// A call made while another shutdown is draining waits for that drain.
    /// Calling this on a stopped engine is a no-op.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tasks, drained_tx) = match self.begin_shutdown() {
            ShutdownStep::Drain(tasks, drained_tx) => (tasks, drained_tx),
            ShutdownStep::Wait(pending) => return Self::await_drained(pending).await,
            ShutdownStep::Done => return Ok(()),
        };

        {
            let _core = self.inner.core.lock();
            self.inner.set_state(BatcherState::Draining);
        }
        info!("log stream engine draining");

        tasks.cancel.cancel();
        for (name, handle) in [("flush timer", tasks.timer), ("dedup sweeper", tasks.sweeper)] {
            if let Err(err) = handle.await {
                error!(task = name, error = %err, "background task ended abnormally");
            }
        }

        let remaining = {
            let mut core = self.inner.core.lock();
            core.batcher.take(FlushTrigger::Shutdown, Instant::now())
        };

        let drained = self.inner.drain(remaining).await;
        if let Err(err) = tasks.worker.await {
            error!(error = %err, "flush worker ended abnormally");
        }

        self.inner.set_state(BatcherState::Stopped);
        *self.lifecycle.lock() = Lifecycle::Finished;
        let _ = drained_tx.send(true);

        let snapshot = self.snapshot();
        info!(
            total_ingested = snapshot.total_ingested,
            total_deduped = snapshot.total_deduped,
            batches_flushed = snapshot.batches_flushed,
            "log stream engine stopped"
        );
        drained
    }

    fn begin_shutdown(&self) -> ShutdownStep {
        let mut lifecycle = self.lifecycle.lock();
        let (drained_tx, drained_rx) = watch::channel(false);
        match std::mem::replace(&mut *lifecycle, Lifecycle::Draining(drained_rx)) {
            Lifecycle::Idle(receiver) => ShutdownStep::Drain(self.spawn_tasks(receiver), drained_tx),
            Lifecycle::Running(tasks) => ShutdownStep::Drain(tasks, drained_tx),
            Lifecycle::Draining(pending) => {
                *lifecycle = Lifecycle::Draining(pending.clone());
                ShutdownStep::Wait(pending)
            }
            Lifecycle::Finished => {
                *lifecycle = Lifecycle::Finished;
                ShutdownStep::Done
            }
        }
    }

    async fn await_drained(mut pending: watch::Receiver<bool>) -> Result<(), EngineError> {
        pending
            .wait_for(|drained| *drained)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::WorkerGone)
    }
}

impl Drop for LogStreamEngine {
    fn drop(&mut self) {
        if let Lifecycle::Running(tasks) = &*self.lifecycle.lock() {
            tasks.cancel.cancel();
            tasks.worker.abort();
        }
    }
}

impl EngineInner {
    fn state(&self) -> BatcherState {
        BatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BatcherState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn accepting(&self) -> bool {
        matches!(
            self.state(),
            BatcherState::Accumulating | BatcherState::Flushing
        )
    }

    fn ingest(&self, record: LogRecord) -> IngestResult {
        self.metrics.record_ingest();
        let now = Instant::now();
        let fingerprint = Fingerprint::compute(&record);

        let mut core = self.core.lock();
        if !self.accepting() {
            drop(core);
            self.metrics.record_rejected();
            return IngestResult::rejected(IngestReason::ShuttingDown);
        }

        let (fingerprint, malformed) = match fingerprint {
            Ok(fingerprint) => {
                if core.dedup.check_and_mark(fingerprint, now) {
                    drop(core);
                    self.metrics.record_duplicate();
                    return IngestResult::rejected(IngestReason::Duplicate);
                }
                (fingerprint, None)
            }
            Err(err) => (Fingerprint::UNKNOWN, Some(err)),
        };

        let enriched = Arc::new(EnrichedRecord::with_fingerprint(
            record,
            core.batcher.batch_id(),
            Utc::now(),
            fingerprint,
        ));
        core.remember(Arc::clone(&enriched));
        core.batcher.append(enriched, now);
        self.evaluate_triggers(&mut core, now);
        drop(core);

        match malformed {
            Some(err) => {
                self.metrics.record_malformed();
                debug!(error = %err, "accepted malformed record without deduplication");
                IngestResult {
                    accepted: true,
                    reason: Some(IngestReason::Malformed(err)),
                }
            }
            None => IngestResult::accepted(),
        }
    }

    fn evaluate_triggers(&self, core: &mut Core, now: Instant) {
        let memory = core.estimated_bytes();
        if let Some(trigger) = core.batcher.check_triggers(now, memory) {
            self.seal(core, trigger, now);
        }
    }

    /// Hands the open batch to the worker. When the hand-off channel is
    /// full the batch stays open and keeps accumulating.
    fn seal(&self, core: &mut Core, trigger: FlushTrigger, now: Instant) -> bool {
        if core.batcher.is_empty() {
            return false;
        }
        match self.flush_tx.try_reserve() {
            Ok(permit) => match core.batcher.take(trigger, now) {
                Some(batch) => {
                    debug!(
                        batch_id = %batch.id,
                        records = batch.len(),
                        %trigger,
                        "batch sealed"
                    );
                    permit.send(FlushCommand::Flush(batch));
                    true
                }
                None => false,
            },
            Err(mpsc::error::TrySendError::Full(())) => {
                self.metrics.record_deferred();
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                error!(%trigger, "flush worker is gone; batch stays buffered");
                false
            }
        }
    }

    fn sweep_dedup(&self) -> usize {
        let evicted = self.core.lock().dedup.sweep(Instant::now());
        if evicted > 0 {
            debug!(evicted, "dedup sweep");
        }
        evicted
    }

    async fn run_flush_timer(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.flush_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut core = self.core.lock();
                    if self.accepting() {
                        self.evaluate_triggers(&mut core, Instant::now());
                    }
                }
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.sweep_interval_duration();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_dedup();
                }
            }
        }
    }

    async fn run_worker(self: Arc<Self>, mut receiver: mpsc::Receiver<FlushCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                FlushCommand::Flush(batch) => self.process_batch(batch).await,
                FlushCommand::Drain(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("flush worker exited");
    }

    /// Queues the final batch and a drain marker, then waits for the worker
    /// to acknowledge both.
    async fn drain(&self, remaining: Option<Batch>) -> Result<(), EngineError> {
        if let Some(batch) = remaining {
            if self.flush_tx.send(FlushCommand::Flush(batch)).await.is_err() {
                error!("flush worker is gone; final batch lost");
                return Err(EngineError::WorkerGone);
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.flush_tx
            .send(FlushCommand::Drain(done_tx))
            .await
            .map_err(|_| EngineError::WorkerGone)?;
        done_rx.await.map_err(|_| EngineError::WorkerGone)
    }

    async fn process_batch(&self, batch: Batch) {
        let _in_flight = self.metrics.flush_started();
        let entered_flushing = self
            .state
            .compare_exchange(
                BatcherState::Accumulating.as_u8(),
                BatcherState::Flushing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        match self.compress(&batch) {
            Ok(groups) => {
                let original: usize = groups.iter().map(|g| g.original_size).sum();
                let stored: usize = groups.iter().map(|g| g.compressed_size).sum();
                match self.write_batch(groups).await {
                    Ok(report) => {
                        self.metrics
                            .record_batch_written(report.records_written, original, stored);
                        debug!(
                            batch_id = %batch.id,
                            records = report.records_written,
                            groups = report.groups_written,
                            bytes = report.bytes_written,
                            trigger = %batch.trigger,
                            "batch flushed"
                        );
                    }
                    Err(err) => self.degrade(&batch, err).await,
                }
            }
            Err(err) => self.degrade(&batch, err).await,
        }

        self.metrics.record_flush_complete(batch.sealed_at.elapsed());
        if entered_flushing {
            let _ = self.state.compare_exchange(
                BatcherState::Flushing.as_u8(),
                BatcherState::Accumulating.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Groups and compresses a batch. A group that fails to compress is
    /// retried once as pass-through.
    fn compress(&self, batch: &Batch) -> Result<Vec<CompressedGroup>, SinkError> {
        let groups = grouper::group(&batch.records, self.settings.group_window_duration());
        let mut compressed = Vec::with_capacity(groups.len());

        for group in &groups {
            match self.encoder.compress(group) {
                Ok(encoded) => compressed.push(encoded),
                Err(err) => {
                    self.metrics.record_compression_error();
                    warn!(
                        batch_id = %batch.id,
                        source = %group.key.source,
                        records = group.len(),
                        error = %err,
                        "compression failed; storing group uncompressed"
                    );
                    compressed.push(self.encoder.passthrough(group)?);
                }
            }
        }
        Ok(compressed)
    }

    async fn write_batch(&self, groups: Vec<CompressedGroup>) -> Result<WriteReport, SinkError> {
        let limit = self.settings.sink_timeout_duration();
        match tokio::time::timeout(limit, self.sink.write_batch(groups)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(limit)),
        }
    }

    async fn degrade(&self, batch: &Batch, cause: SinkError) {
        warn!(
            batch_id = %batch.id,
            records = batch.len(),
            error = %cause,
            "batch write failed; falling back to per-record writes"
        );

        let report = self.write_each(batch).await;
        self.metrics
            .record_degraded(report.written, report.failed.len());

        if report.failed.is_empty() {
            info!(batch_id = %batch.id, records = report.written, "degraded batch fully written");
        } else {
            warn!(
                batch_id = %batch.id,
                written = report.written,
                failed = report.failed.len(),
                "degraded batch partially lost"
            );
        }
    }

    async fn write_each(&self, batch: &Batch) -> FallbackReport {
        let limit = self.settings.sink_timeout_duration();
        let mut report = FallbackReport::default();

        for (position, record) in batch.records.iter().enumerate() {
            let result = match tokio::time::timeout(limit, self.sink.write_one(Arc::clone(record))).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(limit)),
            };
            match result {
                Ok(()) => report.written += 1,
                Err(err) => {
                    debug!(
                        batch_id = %batch.id,
                        fingerprint = %record.fingerprint,
                        error = %err,
                        "record write failed"
                    );
                    report.failed.push((position, err));
                }
            }
        }
        report
    }
}
