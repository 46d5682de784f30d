use crate::broker::{BrokerChannel, CircuitBreaker, ConnectionPool, MqttChannel, PublishError};
use crate::config::Config;
use crate::spool::SpillWriter;
use crate::telemetry::{BatchEnvelope, TelemetryBatch, BATCH_FORMAT};
use anyhow::anyhow;
use bytes::Bytes;
use prost::Message;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
const BACKOFF_STEP: Duration = Duration::from_millis(100);
const ENQUEUE_GRACE: Duration = Duration::from_millis(100);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub topic: String,
    pub queue_depth: usize,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_step: Duration,
    pub enqueue_grace: Duration,
    pub shutdown_deadline: Duration,
}

impl PublisherOptions {
    pub fn new(topic: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            topic: topic.into(),
            queue_depth: queue_depth.max(1),
            max_attempts: MAX_ATTEMPTS,
            attempt_timeout: ATTEMPT_TIMEOUT,
            backoff_step: BACKOFF_STEP,
            enqueue_grace: ENQUEUE_GRACE,
            shutdown_deadline: SHUTDOWN_DEADLINE,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.broker.topic(), config.async_queue_depth)
    }
}

/// A serialized envelope ready for the wire or the spill file.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub batch_id: String,
    pub record_count: u32,
    pub payload: Bytes,
}

pub fn encode_batch(batch: &TelemetryBatch) -> OutboundBatch {
    let body = batch.encode_to_vec();
    let record_count = batch.records.len() as u32;
    let envelope = BatchEnvelope {
        format: BATCH_FORMAT.to_string(),
        worker_id: batch.worker_id,
        session_id: batch.session_id.clone(),
        record_count,
        byte_size: body.len() as u64,
        payload: body,
    };
    OutboundBatch {
        batch_id: batch.batch_id.clone(),
        record_count,
        payload: Bytes::from(envelope.encode_to_vec()),
    }
}

#[derive(Debug, Default)]
struct PublishCounters {
    batches: AtomicU64,
    records: AtomicU64,
    bytes: AtomicU64,
    failed_batches: AtomicU64,
    persisted_batches: AtomicU64,
    sync_fallbacks: AtomicU64,
    lost_batches: AtomicU64,
    abandoned_batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub batches: u64,
    pub records: u64,
    pub bytes: u64,
    /// Batches that exhausted their broker attempts.
    pub failed_batches: u64,
    pub persisted_batches: u64,
    pub sync_fallbacks: u64,
    pub lost_batches: u64,
    pub abandoned_batches: u64,
}

impl PublishStats {
    pub fn merge(&mut self, other: &PublishStats) {
        self.batches += other.batches;
        self.records += other.records;
        self.bytes += other.bytes;
        self.failed_batches += other.failed_batches;
        self.persisted_batches += other.persisted_batches;
        self.sync_fallbacks += other.sync_fallbacks;
        self.lost_batches += other.lost_batches;
        self.abandoned_batches += other.abandoned_batches;
    }
}

struct Dispatch<C: BrokerChannel> {
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    options: PublisherOptions,
    spill: Arc<Mutex<SpillWriter>>,
    counters: PublishCounters,
    // fired when the pool shuts down; publishing switches to one attempt
    cancel: CancellationToken,
    // queued or in flight on the dispatcher
    pending: AtomicUsize,
}

impl<C: BrokerChannel> Dispatch<C> {
    async fn publish(&self, batch: OutboundBatch) -> Result<(), PublishError> {
        if !self.breaker.allow_request() {
            tracing::debug!(batch_id = %batch.batch_id, "circuit open; spilling batch");
            return self.spill(&batch).await;
        }

        let attempts = if self.cancel.is_cancelled() {
            1
        } else {
            self.options.max_attempts.max(1)
        };
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.attempt(&batch).await {
                Ok(()) => {
                    self.breaker.record_success();
                    self.counters.batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .records
                        .fetch_add(batch.record_count as u64, Ordering::Relaxed);
                    self.counters
                        .bytes
                        .fetch_add(batch.payload.len() as u64, Ordering::Relaxed);
                    tracing::debug!(
                        batch_id = %batch.batch_id,
                        records = batch.record_count,
                        attempt,
                        "published batch"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(batch_id = %batch.batch_id, attempt, error = %err, "publish attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < attempts && !self.cancel.is_cancelled() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.backoff_step * attempt) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        self.breaker.record_failure();
        self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            batch_id = %batch.batch_id,
            attempts,
            error = %last_error.map(|err| err.to_string()).unwrap_or_default(),
            "broker unavailable; spilling batch"
        );
        self.spill(&batch).await
    }

    async fn attempt(&self, batch: &OutboundBatch) -> Result<(), PublishError> {
        let channel = self.pool.get_channel()?;
        let send = channel.publish(&self.options.topic, batch.payload.clone());
        match tokio::time::timeout(self.options.attempt_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.options.attempt_timeout)),
        }
    }

    /// Appends the batch to the spill segment on the blocking pool.
    async fn spill(&self, batch: &OutboundBatch) -> Result<(), PublishError> {
        let writer = self.spill.clone();
        let payload = batch.payload.clone();
        let result = tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .map_err(|_| anyhow!("spill writer poisoned"))
                .and_then(|mut writer| writer.append(&payload))
        })
        .await
        .map_err(|err| anyhow!("spill task failed: {err}"))
        .and_then(|appended| appended);
        match result {
            Ok(()) => {
                self.counters.persisted_batches.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.lost_batches.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    batch_id = %batch.batch_id,
                    records = batch.record_count,
                    error = %err,
                    "batch lost: broker unavailable and local spillover failed"
                );
                Err(PublishError::SpillFailed(err.to_string()))
            }
        }
    }

    fn stats(&self) -> PublishStats {
        let c = &self.counters;
        PublishStats {
            batches: c.batches.load(Ordering::Relaxed),
            records: c.records.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
            persisted_batches: c.persisted_batches.load(Ordering::Relaxed),
            sync_fallbacks: c.sync_fallbacks.load(Ordering::Relaxed),
            lost_batches: c.lost_batches.load(Ordering::Relaxed),
            abandoned_batches: c.abandoned_batches.load(Ordering::Relaxed),
        }
    }
}

/// Delivers the batches of one session group, in order, through a dedicated
/// background task.
///
/// Once `cancel` fires, [`Publisher::close`] stops waiting after the shutdown
/// deadline. Batches still queued at that point are counted in
/// `abandoned_batches`; they are neither published nor spilled.
pub struct Publisher<C: BrokerChannel = MqttChannel> {
    dispatch: Arc<Dispatch<C>>,
    queue: Option<mpsc::Sender<OutboundBatch>>,
    worker: Option<JoinHandle<()>>,
}

impl<C: BrokerChannel> Publisher<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        breaker: Arc<CircuitBreaker>,
        spill: SpillWriter,
        options: PublisherOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
        let dispatch = Arc::new(Dispatch {
            pool,
            breaker,
            options,
            spill: Arc::new(Mutex::new(spill)),
            counters: PublishCounters::default(),
            cancel,
            pending: AtomicUsize::new(0),
        });
        let worker = spawn_dispatcher(dispatch.clone(), rx);
        Self {
            dispatch,
            queue: Some(tx),
            worker: Some(worker),
        }
    }

    /// Hands the batch to the background task, or publishes inline when the
    /// queue stays full past the grace window.
    pub async fn flush(&self, batch: TelemetryBatch) -> Result<(), PublishError> {
        if batch.records.is_empty() {
            return Ok(());
        }
        let outbound = encode_batch(&batch);
        let Some(queue) = &self.queue else {
            return self.dispatch.publish(outbound).await;
        };

        self.dispatch.pending.fetch_add(1, Ordering::AcqRel);
        match queue.send_timeout(outbound, self.dispatch.options.enqueue_grace).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(outbound)) => {
                self.dispatch.pending.fetch_sub(1, Ordering::AcqRel);
                self.dispatch
                    .counters
                    .sync_fallbacks
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(batch_id = %outbound.batch_id, "publish queue full; publishing inline");
                self.dispatch.publish(outbound).await
            }
            Err(SendTimeoutError::Closed(outbound)) => {
                self.dispatch.pending.fetch_sub(1, Ordering::AcqRel);
                self.dispatch.publish(outbound).await
            }
        }
    }

    /// Publishes on the caller's task, bypassing the queue.
    #[cfg(test)]
    pub async fn publish_now(&self, batch: TelemetryBatch) -> Result<(), PublishError> {
        self.dispatch.publish(encode_batch(&batch)).await
    }

    pub fn stats(&self) -> PublishStats {
        self.dispatch.stats()
    }

    /// Waits until every queued batch is published or spilled, then seals the
    /// spill segment. After cancellation the wait is capped by the shutdown
    /// deadline and whatever is still queued is abandoned.
    pub async fn close(mut self) -> PublishStats {
        drop(self.queue.take());

        if let Some(mut worker) = self.worker.take() {
            let cancel = self.dispatch.cancel.clone();
            let drained = tokio::select! {
                biased;
                _ = &mut worker => true,
                _ = cancel.cancelled() => false,
            };
            let deadline = self.dispatch.options.shutdown_deadline;
            if !drained && tokio::time::timeout(deadline, &mut worker).await.is_err() {
                worker.abort();
                let abandoned = self.dispatch.pending.swap(0, Ordering::AcqRel) as u64;
                self.dispatch
                    .counters
                    .abandoned_batches
                    .fetch_add(abandoned, Ordering::Relaxed);
                tracing::warn!(
                    abandoned,
                    deadline_ms = deadline.as_millis() as u64,
                    "publisher shutdown deadline reached; queued batches abandoned and may be lost"
                );
            }
        }

        let writer = self.dispatch.spill.clone();
        let sealed = tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .map_err(|_| anyhow!("spill writer poisoned"))
                .and_then(|mut writer| writer.seal())
        })
        .await;
        match sealed {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to seal spill segment; it will be recovered on next start")
            }
            Err(err) => tracing::error!(error = %err, "spill seal task failed"),
        }

        self.dispatch.stats()
    }
}

fn spawn_dispatcher<C: BrokerChannel>(
    dispatch: Arc<Dispatch<C>>,
    mut rx: mpsc::Receiver<OutboundBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let batch_id = batch.batch_id.clone();
            if let Err(err) = dispatch.publish(batch).await {
                tracing::debug!(batch_id = %batch_id, error = %err, "queued batch not delivered");
            }
            dispatch.pending.fetch_sub(1, Ordering::AcqRel);
        }
    })
}
