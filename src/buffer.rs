//! In-memory ingestion buffer.
//!
//! Decouples high-frequency reading arrival from lower-frequency
//! durable writes. A flush is triggered by a size threshold or a fixed
//! timer, whichever comes first; at most one flush is in flight per
//! buffer. A batch rejected at the transaction level is pushed back to
//! the front of the buffer so its readings are retried in original
//! order.

use crate::config::BufferConfig;
use crate::model::Reading;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors a reading sink can report
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transaction-level failure; the whole batch must be retried
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of handing a batch to the sink
#[derive(Debug, Clone, Copy)]
pub struct BatchInsertResult {
    /// Rows durably committed
    pub inserted: usize,
    /// Rows attempted
    pub total: usize,
}

/// Destination for flushed batches.
///
/// Implemented by the persistence layer; tests substitute in-memory
/// sinks to exercise failure paths.
#[async_trait::async_trait]
pub trait ReadingSink: Send + Sync {
    async fn insert_batch(&self, batch: &[BufferedReading]) -> Result<BatchInsertResult, SinkError>;
}

/// A reading staged in the buffer, stamped with its enqueue time
#[derive(Debug, Clone)]
pub struct BufferedReading {
    pub reading: Reading,
    /// Epoch milliseconds at enqueue
    pub enqueued_at: i64,
}

/// Counters exposed through the status API
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped_overflow: u64,
    pub batches: u64,
    pub buffered: usize,
    pub loss_rate: f64,
    pub flushing: bool,
}

/// Append-only staging area between the gateway and the store
pub struct IngestBuffer {
    config: BufferConfig,
    sink: Arc<dyn ReadingSink>,
    queue: Mutex<VecDeque<BufferedReading>>,
    flushing: AtomicBool,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_overflow: AtomicU64,
    batches: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl IngestBuffer {
    pub fn new(config: BufferConfig, sink: Arc<dyn ReadingSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sink,
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Validate and stage one reading.
    ///
    /// Returns false (and counts the loss) when validation fails; the
    /// reading is never buffered in that case. Reaching the size
    /// threshold triggers an immediate flush.
    pub async fn enqueue(&self, reading: Reading) -> bool {
        if let Err(e) = reading.validate() {
            debug!(
                device_id = %reading.device_id,
                sensor_type = %reading.sensor_type.as_str(),
                error = %e,
                "Rejected invalid reading"
            );
            self.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("buffer.readings.rejected").increment(1);
            return false;
        }

        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(BufferedReading {
                reading,
                enqueued_at: Utc::now().timestamp_millis(),
            });
            self.drop_overflow(&mut queue);
            queue.len()
        };

        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("buffer.readings.received").increment(1);

        if len >= self.config.flush_threshold {
            self.flush().await;
        }

        true
    }

    /// Move the current buffer contents into durable storage.
    ///
    /// No-op when a flush is already in flight or the buffer is empty.
    pub async fn flush(&self) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }

        let batch: Vec<BufferedReading> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                self.flushing.store(false, Ordering::Release);
                return;
            }
            queue.drain(..).collect()
        };

        match self.sink.insert_batch(&batch).await {
            Ok(result) => {
                self.processed
                    .fetch_add(result.inserted as u64, Ordering::Relaxed);
                self.batches.fetch_add(1, Ordering::Relaxed);
                let lost = result.total.saturating_sub(result.inserted);
                if lost > 0 {
                    self.failed.fetch_add(lost as u64, Ordering::Relaxed);
                }
                metrics::counter!("buffer.flushes").increment(1);

                debug!(
                    inserted = result.inserted,
                    total = result.total,
                    "Flushed batch"
                );

                let loss_rate = self.loss_rate();
                if loss_rate > self.config.loss_warn_ratio {
                    warn!(
                        loss_rate = loss_rate,
                        threshold = self.config.loss_warn_ratio,
                        "Loss rate above target"
                    );
                }
            }
            Err(e) => {
                warn!(
                    batch_size = batch.len(),
                    error = %e,
                    "Batch insert failed, requeueing at front"
                );
                metrics::counter!("buffer.flushes.failed").increment(1);

                let mut queue = self.queue.lock();
                for buffered in batch.into_iter().rev() {
                    queue.push_front(buffered);
                }
                self.drop_overflow(&mut queue);
            }
        }

        self.flushing.store(false, Ordering::Release);
    }

    /// Enforce the buffered cap, dropping the oldest readings.
    fn drop_overflow(&self, queue: &mut VecDeque<BufferedReading>) {
        while queue.len() > self.config.max_buffered {
            queue.pop_front();
            self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            self.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("buffer.readings.dropped").increment(1);
        }
    }

    /// Run the timer-driven flush loop until shutdown.
    pub async fn run_timer(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.flush_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.flush_interval_ms,
            threshold = self.config.flush_threshold,
            "Flush timer started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Flush timer stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.flush_interval_ms)
    }

    /// Stop the timer and perform one final best-effort flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.flush().await;
        let remaining = self.queue.lock().len();
        if remaining > 0 {
            warn!(remaining, "Readings still buffered after final flush");
        }
    }

    fn loss_rate(&self) -> f64 {
        let received = self.received.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        self.failed.load(Ordering::Relaxed) as f64 / received as f64
    }

    /// Current counters and buffer occupancy
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            buffered: self.queue.lock().len(),
            loss_rate: self.loss_rate(),
            flushing: self.flushing.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SensorType;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn valid_reading(device_id: &str) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            recorded_at: Utc::now().timestamp_millis(),
            sensor_type: SensorType::Accelerometer,
            value: json!({"x": 0.1, "y": 0.2, "z": 9.8}),
            session_id: None,
        }
    }

    fn invalid_reading(device_id: &str) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            recorded_at: Utc::now().timestamp_millis(),
            sensor_type: SensorType::Gps,
            value: json!({"latitude": 95.0, "longitude": 0.0}),
            session_id: None,
        }
    }

    fn test_config(threshold: usize) -> BufferConfig {
        BufferConfig {
            flush_threshold: threshold,
            flush_interval_ms: 5000,
            max_buffered: 100_000,
            loss_warn_ratio: 0.005,
        }
    }

    /// Records every batch it receives.
    #[derive(Default)]
    struct CountingSink {
        batches: Mutex<Vec<Vec<BufferedReading>>>,
        fail: AtomicBool,
        short_by_one: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ReadingSink for CountingSink {
        async fn insert_batch(
            &self,
            batch: &[BufferedReading],
        ) -> Result<BatchInsertResult, SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Unavailable("sink offline".to_string()));
            }
            self.batches.lock().push(batch.to_vec());
            let total = batch.len();
            let inserted = if self.short_by_one.load(Ordering::SeqCst) {
                total.saturating_sub(1)
            } else {
                total
            };
            Ok(BatchInsertResult { inserted, total })
        }
    }

    #[tokio::test]
    async fn threshold_triggers_exactly_one_flush() {
        let sink = Arc::new(CountingSink::default());
        let buffer = IngestBuffer::new(test_config(1000), sink.clone());

        for _ in 0..1500 {
            assert!(buffer.enqueue(valid_reading("AMR-001")).await);
        }

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1000);

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 500);
        assert_eq!(stats.processed, 1000);
        assert_eq!(stats.received, 1500);
        assert_eq!(stats.loss_rate, 0.0);
    }

    #[tokio::test]
    async fn invalid_reading_never_buffered() {
        let sink = Arc::new(CountingSink::default());
        let buffer = IngestBuffer::new(test_config(1000), sink);

        assert!(!buffer.enqueue(invalid_reading("AMR-001")).await);

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.received, 0);
    }

    #[tokio::test]
    async fn failed_batch_requeues_in_order() {
        let sink = Arc::new(CountingSink::default());
        let buffer = IngestBuffer::new(test_config(1000), sink.clone());

        for i in 0..3 {
            let mut reading = valid_reading("AMR-001");
            reading.recorded_at = 1_700_000_000_000 + i;
            buffer.enqueue(reading).await;
        }

        sink.fail.store(true, Ordering::SeqCst);
        buffer.flush().await;

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.processed, 0);

        sink.fail.store(false, Ordering::SeqCst);
        buffer.flush().await;

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        let times: Vec<i64> = batches[0].iter().map(|b| b.reading.recorded_at).collect();
        assert_eq!(
            times,
            vec![1_700_000_000_000, 1_700_000_000_001, 1_700_000_000_002]
        );
        assert_eq!(buffer.stats().buffered, 0);
    }

    #[tokio::test]
    async fn partial_insert_counts_loss() {
        let sink = Arc::new(CountingSink::default());
        sink.short_by_one.store(true, Ordering::SeqCst);
        let buffer = IngestBuffer::new(test_config(1000), sink);

        for _ in 0..4 {
            buffer.enqueue(valid_reading("AMR-001")).await;
        }
        buffer.flush().await;

        let stats = buffer.stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.loss_rate - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let sink = Arc::new(CountingSink::default());
        let mut config = test_config(1000);
        config.max_buffered = 5;
        let buffer = IngestBuffer::new(config, sink);

        for i in 0..7 {
            let mut reading = valid_reading("AMR-001");
            reading.recorded_at = i;
            buffer.enqueue(reading).await;
        }

        let stats = buffer.stats();
        assert_eq!(stats.buffered, 5);
        assert_eq!(stats.dropped_overflow, 2);

        let queue = buffer.queue.lock();
        assert_eq!(queue.front().unwrap().reading.recorded_at, 2);
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let sink = Arc::new(CountingSink::default());
        let buffer = IngestBuffer::new(test_config(1000), sink.clone());

        buffer.flush().await;
        assert!(sink.batches.lock().is_empty());
        assert!(!buffer.stats().flushing);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_below_threshold() {
        let sink = Arc::new(CountingSink::default());
        let buffer = Arc::new(IngestBuffer::new(test_config(1000), sink.clone()));

        let timer = tokio::spawn(buffer.clone().run_timer());

        buffer.enqueue(valid_reading("AMR-001")).await;
        assert_eq!(buffer.stats().buffered, 1);

        // Advance past one flush interval; the paused clock skips
        // straight to the tick.
        tokio::time::sleep(Duration::from_millis(5100)).await;

        assert_eq!(buffer.stats().processed, 1);
        assert_eq!(buffer.stats().buffered, 0);

        buffer.shutdown().await;
        timer.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_performs_final_flush() {
        let sink = Arc::new(CountingSink::default());
        let buffer = IngestBuffer::new(test_config(1000), sink.clone());

        buffer.enqueue(valid_reading("AMR-001")).await;
        buffer.enqueue(valid_reading("AMR-002")).await;
        buffer.shutdown().await;

        assert_eq!(buffer.stats().buffered, 0);
        assert_eq!(buffer.stats().processed, 2);
    }
}
