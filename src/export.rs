// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Non-blocking span export.
//!
//! Closed spans flow through a bounded queue to a single background
//! consumer that batches them (by size or time, whichever first) and
//! writes each batch to the trace store on the blocking pool. Producers
//! never wait: when the queue is full, `submit` drops the newest-incoming
//! span and bumps a counter, so a slow or unavailable store cannot stall
//! instrumented code.
//!
//! Backpressure policy: DROP NEWEST. The spans already queued are closest
//! to being durable and keep their slots; the span being submitted is the
//! one sacrificed. The policy is deterministic and observable through
//! [`ExporterStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::TracerConfig;
use crate::error::ExportError;
use crate::span::Span;
use crate::store::TraceStore;

enum ExportMsg {
    Span(Span),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Monotonic counters for the export pipeline.
#[derive(Debug, Default)]
pub struct ExporterStats {
    submitted: AtomicU64,
    exported: AtomicU64,
    dropped: AtomicU64,
    failed_batches: AtomicU64,
}

impl ExporterStats {
    fn incr_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_exported(&self, count: u64) {
        self.exported.fetch_add(count, Ordering::Relaxed);
    }

    fn incr_failed_batches(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self) -> ExporterStatsSnapshot {
        ExporterStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            exported: self.exported.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of exporter counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExporterStatsSnapshot {
    /// Spans handed to `submit`.
    pub submitted: u64,
    /// Spans durably written to the store.
    pub exported: u64,
    /// Spans dropped because the queue was full or closed.
    pub dropped: u64,
    /// Batches discarded after exhausting retries.
    pub failed_batches: u64,
}

struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

/// Bounded-queue exporter with one background consumer.
pub struct BatchExporter {
    tx: mpsc::Sender<ExportMsg>,
    stats: Arc<ExporterStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchExporter {
    /// Spawn the consumer task and return the producer side.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(store: Arc<dyn TraceStore>, config: &TracerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(ExporterStats::default());

        let worker = tokio::spawn(run_worker(
            rx,
            store,
            config.batch_max_spans,
            config.flush_interval,
            RetryPolicy {
                max_retries: config.export_max_retries,
                backoff: config.export_retry_backoff,
            },
            Arc::clone(&stats),
        ));

        Self {
            tx,
            stats,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a closed span for export. Never blocks.
    ///
    /// If the queue is full the span is dropped (drop-newest policy) and
    /// the dropped counter increments; the caller is not told, because
    /// observability must never become a source of application latency.
    pub fn submit(&self, span: Span) {
        self.stats.incr_submitted();
        match self.tx.try_send(ExportMsg::Span(span)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.incr_dropped();
                debug!("Export queue full; dropping newest span");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.incr_dropped();
                debug!("Exporter shut down; dropping span");
            }
        }
    }

    /// Current counter values.
    pub fn stats(&self) -> ExporterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Push everything currently queued through to the store.
    pub async fn flush(&self, timeout: Duration) -> Result<(), ExportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ExportMsg::Flush(ack_tx)).await.is_err() {
            return Err(ExportError::Closed);
        }
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ExportError::FlushTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Final bounded flush, then stop the consumer.
    ///
    /// Spans still unflushed when the deadline passes are discarded with a
    /// warning. Idempotent: later calls return `Ok` immediately.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ExportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ExportMsg::Shutdown(ack_tx)).await.is_err() {
            // Worker already gone.
            return Ok(());
        }

        let flushed = tokio::time::timeout(timeout, ack_rx).await.is_ok();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = worker {
            if flushed {
                let _ = handle.await;
            } else {
                handle.abort();
            }
        }

        if flushed {
            Ok(())
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown flush timed out; remaining spans discarded"
            );
            Err(ExportError::FlushTimeout(timeout.as_millis() as u64))
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ExportMsg>,
    store: Arc<dyn TraceStore>,
    batch_max: usize,
    flush_interval: Duration,
    retry: RetryPolicy,
    stats: Arc<ExporterStats>,
) {
    let mut batch: Vec<Span> = Vec::with_capacity(batch_max);
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ExportMsg::Span(span)) => {
                    batch.push(span);
                    if batch.len() >= batch_max {
                        write_batch(&store, &mut batch, &retry, &stats).await;
                    }
                }
                Some(ExportMsg::Flush(ack)) => {
                    write_batch(&store, &mut batch, &retry, &stats).await;
                    let _ = ack.send(());
                }
                Some(ExportMsg::Shutdown(ack)) => {
                    write_batch(&store, &mut batch, &retry, &stats).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    write_batch(&store, &mut batch, &retry, &stats).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                write_batch(&store, &mut batch, &retry, &stats).await;
            }
        }
    }
}

/// Write the accumulated batch with bounded retry, then clear it.
///
/// Store I/O runs on the blocking pool so the consumer task never parks a
/// runtime worker. A batch that still fails after the retry budget is
/// dropped; retrying forever would let a dead store grow memory without
/// bound.
async fn write_batch(
    store: &Arc<dyn TraceStore>,
    batch: &mut Vec<Span>,
    retry: &RetryPolicy,
    stats: &Arc<ExporterStats>,
) {
    if batch.is_empty() {
        return;
    }
    let spans = Arc::new(std::mem::take(batch));
    let mut attempt: u32 = 0;

    loop {
        let store = Arc::clone(store);
        let spans_ref = Arc::clone(&spans);
        let result =
            tokio::task::spawn_blocking(move || store.append_batch(spans_ref.as_slice())).await;

        match result {
            Ok(Ok(())) => {
                stats.add_exported(spans.len() as u64);
                return;
            }
            Ok(Err(err)) => {
                attempt += 1;
                if attempt > retry.max_retries || !err.is_retryable() {
                    error!(
                        error = %err,
                        spans = spans.len(),
                        "Dropping batch after failed export"
                    );
                    stats.incr_failed_batches();
                    return;
                }
                warn!(error = %err, attempt, "Batch export failed; retrying");
                tokio::time::sleep(retry.backoff * attempt).await;
            }
            Err(join_err) => {
                error!(error = %join_err, "Export write task failed; dropping batch");
                stats.incr_failed_batches();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryTraceStore, Page, TraceFilter, TraceStore, TraceSummary, TraceTree};
    use crate::types::{SpanStatus, SpanType, TraceId};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicU32;

    fn closed_span(trace_id: TraceId) -> Span {
        let mut span = Span::new("step", SpanType::ToolCall, trace_id, None);
        span.close(SpanStatus::Success, None).unwrap();
        span
    }

    fn fast_config() -> TracerConfig {
        TracerConfig::default()
            .with_queue_capacity(128)
            .with_batch_max_spans(4)
            .with_flush_interval(Duration::from_millis(10))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_and_flush() {
        let store = Arc::new(MemoryTraceStore::new());
        let exporter = BatchExporter::start(store.clone(), &fast_config());
        let trace_id = TraceId::new();

        for _ in 0..10 {
            exporter.submit(closed_span(trace_id));
        }
        exporter.flush(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.len(), 10);
        let stats = exporter.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.exported, 10);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_time_based_flush() {
        let store = Arc::new(MemoryTraceStore::new());
        let config = fast_config().with_batch_max_spans(1000);
        let exporter = BatchExporter::start(store.clone(), &config);

        exporter.submit(closed_span(TraceId::new()));

        // Under the batch-size threshold; the interval must flush it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_flushes_then_drops_later_submissions() {
        let store = Arc::new(MemoryTraceStore::new());
        let exporter = BatchExporter::start(store.clone(), &fast_config());

        exporter.submit(closed_span(TraceId::new()));
        exporter.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.len(), 1);

        // After shutdown, submissions count as dropped.
        exporter.submit(closed_span(TraceId::new()));
        assert_eq!(exporter.stats().dropped, 1);
        assert_eq!(store.len(), 1);

        // Idempotent.
        exporter.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    /// Store that blocks long enough for the queue to fill.
    struct SlowStore {
        delay: Duration,
    }

    impl TraceStore for SlowStore {
        fn append(&self, _span: &Span) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn append_batch(&self, _spans: &[Span]) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn get_trace(&self, trace_id: TraceId) -> Result<TraceTree, StoreError> {
            Err(StoreError::NotFound(trace_id))
        }

        fn list_traces(
            &self,
            _filter: &TraceFilter,
            _page: &Page,
        ) -> Result<Vec<TraceSummary>, StoreError> {
            Ok(Vec::new())
        }

        fn delete_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overload_drops_newest_without_blocking() {
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(200),
        });
        let config = TracerConfig::default()
            .with_queue_capacity(4)
            .with_batch_max_spans(2)
            .with_flush_interval(Duration::from_millis(5));
        let exporter = BatchExporter::start(store, &config);

        let started = std::time::Instant::now();
        for _ in 0..200 {
            exporter.submit(closed_span(TraceId::new()));
        }
        let elapsed = started.elapsed();

        // 200 submits against a store that takes 200ms per batch: the
        // producers must not have waited on it.
        assert!(elapsed < Duration::from_millis(150), "submit blocked: {:?}", elapsed);

        let stats = exporter.stats();
        assert_eq!(stats.submitted, 200);
        assert!(stats.dropped > 0);

        // Counter is monotonic under continued pressure.
        exporter.submit(closed_span(TraceId::new()));
        for _ in 0..50 {
            exporter.submit(closed_span(TraceId::new()));
        }
        assert!(exporter.stats().dropped >= stats.dropped);
    }

    /// Store that fails a set number of times before succeeding.
    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
        inner: MemoryTraceStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                inner: MemoryTraceStore::new(),
            }
        }
    }

    impl TraceStore for FlakyStore {
        fn append(&self, span: &Span) -> Result<(), StoreError> {
            self.inner.append(span)
        }

        fn append_batch(&self, spans: &[Span]) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("backend unavailable".to_string()));
            }
            self.inner.append_batch(spans)
        }

        fn get_trace(&self, trace_id: TraceId) -> Result<TraceTree, StoreError> {
            self.inner.get_trace(trace_id)
        }

        fn list_traces(
            &self,
            filter: &TraceFilter,
            page: &Page,
        ) -> Result<Vec<TraceSummary>, StoreError> {
            self.inner.list_traces(filter, page)
        }

        fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_before(cutoff)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_then_success() {
        let store = Arc::new(FlakyStore::new(2));
        let exporter = BatchExporter::start(store.clone(), &fast_config());

        exporter.submit(closed_span(TraceId::new()));
        exporter.flush(Duration::from_secs(2)).await.unwrap();

        assert_eq!(exporter.stats().exported, 1);
        assert_eq!(exporter.stats().failed_batches, 0);
        assert!(store.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_dropped_after_retry_budget() {
        // More failures than the retry budget allows.
        let store = Arc::new(FlakyStore::new(100));
        let exporter = BatchExporter::start(store.clone(), &fast_config());

        exporter.submit(closed_span(TraceId::new()));
        exporter.flush(Duration::from_secs(2)).await.unwrap();

        let stats = exporter.stats();
        assert_eq!(stats.exported, 0);
        assert_eq!(stats.failed_batches, 1);
        // Initial attempt + max_retries, no more.
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }
}
