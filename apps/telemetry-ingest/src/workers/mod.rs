mod types;

pub use types::{
    should_retry, PoolMetrics, WorkError, WorkItem, WorkResult, WorkerMetrics, WorkerStatus,
};

use crate::broker::{BrokerChannel, CircuitBreaker, ConnectionPool, MqttChannel};
use crate::config::Config;
use crate::processor::{FileProcessor, ProcessError};
use crate::publisher::PublishStats;
use crate::source::{NdjsonParser, RecordingParser};
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const STOP_GRACE: Duration = Duration::from_secs(5);
const COMPLETION_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("work queue is closed")]
    Closed,
    #[error("worker pool is shutting down")]
    Cancelled,
}

#[derive(Debug, Default)]
struct PoolState {
    files_processed: u64,
    files_failed: u64,
    records: u64,
    batches: u64,
    errors: u64,
    retries_scheduled: u64,
    publish: PublishStats,
    workers: Vec<WorkerMetrics>,
}

struct Shared<C: BrokerChannel, P: RecordingParser> {
    config: Arc<Config>,
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    parser: Arc<P>,
    cancel: CancellationToken,
    // fired by stop(); workers finish their current file but take no new one
    intake_closed: CancellationToken,
    state: Mutex<PoolState>,
    queued: AtomicUsize,
    active_workers: AtomicUsize,
    // submitted files without a final outcome yet, retries included
    outstanding: AtomicUsize,
    started_at: Instant,
}

impl<C: BrokerChannel, P: RecordingParser> Shared<C, P> {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_worker(&self, worker_id: u32, update: impl FnOnce(&mut WorkerMetrics)) {
        let mut state = self.state();
        if let Some(worker) = state.workers.get_mut(worker_id as usize) {
            update(worker);
            worker.last_activity = Utc::now();
        }
    }

    fn record_success(&self, result: &WorkResult) {
        let mut state = self.state();
        state.files_processed += 1;
        state.records += result.records;
        state.batches += result.batches;
        state.publish.merge(&result.publish);
        if let Some(worker) = state.workers.get_mut(result.worker_id as usize) {
            worker.files_processed += 1;
            worker.records += result.records;
            worker.batches += result.batches;
            worker.processing_time += result.duration;
            worker.last_activity = Utc::now();
        }
    }

    fn record_failure(&self, failure: &WorkError) {
        let mut state = self.state();
        state.errors += 1;
        state.publish.merge(&failure.publish);
        if let Some(worker) = state.workers.get_mut(failure.worker_id as usize) {
            worker.error_count += 1;
            worker.processing_time += failure.duration;
            worker.status = WorkerStatus::Error;
            worker.last_activity = failure.at;
        }
    }

    fn finish_failed(&self) {
        self.state().files_failed += 1;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn abandon_retry(&self, file: &str, reason: &str) {
        tracing::warn!(file, reason, "retry abandoned");
        self.finish_failed();
    }
}

/// Bounded pool of file workers fed from one queue.
///
/// Results and errors are folded into the metrics by two collector tasks;
/// retryable failures are re-queued after `retry_delay` until `max_retries`.
pub struct WorkerPool<C: BrokerChannel = MqttChannel, P: RecordingParser = NdjsonParser> {
    shared: Arc<Shared<C, P>>,
    queue: Mutex<Option<mpsc::Sender<WorkItem>>>,
    unstarted: Mutex<Option<mpsc::Receiver<WorkItem>>>,
    intake: Mutex<Option<Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    collectors: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: BrokerChannel, P: RecordingParser> WorkerPool<C, P> {
    pub fn new(config: Arc<Config>, pool: Arc<ConnectionPool<C>>, parser: Arc<P>) -> Self {
        let worker_count = config.worker_count.max(1);
        let (tx, rx) = mpsc::channel(config.file_queue_size.max(1));
        let state = PoolState {
            workers: (0..worker_count as u32).map(WorkerMetrics::new).collect(),
            ..Default::default()
        };
        Self {
            shared: Arc::new(Shared {
                config,
                pool,
                breaker: Arc::new(CircuitBreaker::default()),
                parser,
                cancel: CancellationToken::new(),
                intake_closed: CancellationToken::new(),
                state: Mutex::new(state),
                queued: AtomicUsize::new(0),
                active_workers: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                started_at: Instant::now(),
            }),
            queue: Mutex::new(Some(tx)),
            unstarted: Mutex::new(Some(rx)),
            intake: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            collectors: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let Some(rx) = self.unstarted.lock().ok().and_then(|mut guard| guard.take()) else {
            tracing::warn!("worker pool already started");
            return;
        };
        let Some(requeue) = self
            .queue
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(mpsc::Sender::downgrade))
        else {
            tracing::warn!("worker pool stopped before start");
            return;
        };

        let worker_count = self.shared.config.worker_count.max(1);
        let queue = Arc::new(tokio::sync::Mutex::new(rx));
        let (result_tx, result_rx) = mpsc::channel(worker_count * 2);
        let (error_tx, error_rx) = mpsc::channel(worker_count * 2);

        let collectors = vec![
            tokio::spawn(collect_results(self.shared.clone(), result_rx)),
            tokio::spawn(collect_errors(self.shared.clone(), error_rx, requeue)),
        ];
        let workers = (0..worker_count as u32)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    self.shared.clone(),
                    worker_id,
                    queue.clone(),
                    result_tx.clone(),
                    error_tx.clone(),
                ))
            })
            .collect();

        if let Ok(mut guard) = self.intake.lock() {
            *guard = Some(queue);
        }
        if let Ok(mut guard) = self.collectors.lock() {
            *guard = collectors;
        }
        if let Ok(mut guard) = self.workers.lock() {
            *guard = workers;
        }
        tracing::info!(
            workers = worker_count,
            queue_capacity = self.shared.config.file_queue_size,
            "worker pool started"
        );
    }

    /// Enqueues a file, waiting for room when the queue is full.
    pub async fn submit(&self, item: WorkItem) -> Result<(), SubmitError> {
        let sender = self
            .queue
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().cloned())
            .ok_or(SubmitError::Closed)?;
        if self.shared.cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let sent = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(SubmitError::Cancelled),
            res = sender.send(item) => res.map_err(|_| SubmitError::Closed),
        };
        if sent.is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        sent
    }

    /// Returns once every submitted file has succeeded or failed for good.
    pub async fn wait_for_completion(&self) {
        let mut ticker = tokio::time::interval(COMPLETION_POLL);
        loop {
            ticker.tick().await;
            if self.shared.outstanding.load(Ordering::Acquire) == 0
                || self.shared.cancel.is_cancelled()
            {
                return;
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Closes the queue, gives in-flight files a grace period, then cancels
    /// the rest and closes the broker pool. Files still queued are not
    /// started; they stay on disk for the next run.
    pub async fn stop(&self) {
        drop(self.queue.lock().ok().and_then(|mut guard| guard.take()));
        drop(self.unstarted.lock().ok().and_then(|mut guard| guard.take()));
        self.shared.intake_closed.cancel();

        let workers = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        if !workers.is_empty() {
            let joined = join_all(workers);
            tokio::pin!(joined);
            if tokio::time::timeout(STOP_GRACE, joined.as_mut()).await.is_err() {
                tracing::warn!(
                    grace_ms = STOP_GRACE.as_millis() as u64,
                    "workers still busy after grace period; cancelling"
                );
                self.shared.cancel.cancel();
                joined.as_mut().await;
            }
        }
        self.shared.cancel.cancel();
        self.discard_queued().await;

        let collectors = self
            .collectors
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for collector in collectors {
            if let Err(err) = collector.await {
                tracing::error!(error = %err, "metrics collector failed");
            }
        }

        self.shared.pool.close().await;
        tracing::info!("worker pool stopped");
    }

    async fn discard_queued(&self) {
        let Some(queue) = self.intake.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };
        let mut rx = queue.lock().await;
        rx.close();
        let mut skipped = 0usize;
        while let Ok(item) = rx.try_recv() {
            skipped += 1;
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(file = %item.file_name(), "queued file left for the next run");
        }
        if skipped > 0 {
            tracing::info!(skipped, "queued files not started before shutdown");
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state();
        PoolMetrics {
            files_processed: state.files_processed,
            files_failed: state.files_failed,
            records_processed: state.records,
            batches_processed: state.batches,
            queue_depth: self.shared.queued.load(Ordering::Acquire),
            active_workers: self.shared.active_workers.load(Ordering::Acquire),
            error_count: state.errors,
            retries_scheduled: state.retries_scheduled,
            publish: state.publish,
            circuit_open: self.shared.breaker.is_open(),
            uptime: self.shared.started_at.elapsed(),
            workers: state.workers.clone(),
        }
    }
}

async fn run_worker<C: BrokerChannel, P: RecordingParser>(
    shared: Arc<Shared<C, P>>,
    worker_id: u32,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    results: mpsc::Sender<WorkResult>,
    errors: mpsc::Sender<WorkError>,
) {
    shared.active_workers.fetch_add(1, Ordering::AcqRel);
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                _ = shared.intake_closed.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = next else {
            break;
        };
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        shared.update_worker(worker_id, |worker| {
            worker.status = WorkerStatus::Processing;
            worker.current_file = Some(item.file_name());
        });

        let processor = FileProcessor::new(
            worker_id,
            shared.config.clone(),
            shared.pool.clone(),
            shared.breaker.clone(),
            shared.parser.clone(),
            shared.cancel.child_token(),
        );
        let deadline = shared.config.attempt_deadline();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(deadline, processor.process(&item.path)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProcessError::TimedOut(deadline)),
        };
        let duration = started.elapsed();
        let publish = processor.publish_stats();
        shared.update_worker(worker_id, |worker| {
            worker.current_file = None;
            if worker.status == WorkerStatus::Processing {
                worker.status = WorkerStatus::Idle;
            }
        });

        let delivered = match outcome {
            Ok(file) => results
                .send(WorkResult {
                    item,
                    worker_id,
                    records: file.records,
                    batches: file.batches,
                    duration,
                    publish,
                })
                .await
                .is_ok(),
            Err(error) => {
                let retry = should_retry(&error, item.retry_count, shared.config.max_retries);
                errors
                    .send(WorkError {
                        item,
                        worker_id,
                        error,
                        retry,
                        duration,
                        publish,
                        at: Utc::now(),
                    })
                    .await
                    .is_ok()
            }
        };
        if !delivered {
            break;
        }
    }
    shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    shared.update_worker(worker_id, |worker| worker.status = WorkerStatus::Completed);
}

async fn collect_results<C: BrokerChannel, P: RecordingParser>(
    shared: Arc<Shared<C, P>>,
    mut rx: mpsc::Receiver<WorkResult>,
) {
    while let Some(result) = rx.recv().await {
        tracing::info!(
            worker_id = result.worker_id,
            file = %result.item.file_name(),
            records = result.records,
            batches = result.batches,
            persisted = result.publish.persisted_batches,
            duration_ms = result.duration.as_millis() as u64,
            "file processed"
        );
        shared.record_success(&result);
        shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn collect_errors<C: BrokerChannel, P: RecordingParser>(
    shared: Arc<Shared<C, P>>,
    mut rx: mpsc::Receiver<WorkError>,
    requeue: mpsc::WeakSender<WorkItem>,
) {
    while let Some(failure) = rx.recv().await {
        shared.record_failure(&failure);
        let max_retries = shared.config.max_retries;
        if failure.retry && failure.item.retry_count < max_retries {
            let mut item = failure.item;
            item.retry_count += 1;
            shared.state().retries_scheduled += 1;
            tracing::warn!(
                worker_id = failure.worker_id,
                file = %item.file_name(),
                attempt = item.retry_count,
                max_retries,
                error = %failure.error,
                "file failed; retry scheduled"
            );
            schedule_retry(shared.clone(), requeue.clone(), item);
        } else {
            tracing::error!(
                worker_id = failure.worker_id,
                file = %failure.item.file_name(),
                retries = failure.item.retry_count,
                retryable = failure.error.is_retryable(),
                error = %failure.error,
                "file failed permanently"
            );
            shared.finish_failed();
        }
    }
}

fn schedule_retry<C: BrokerChannel, P: RecordingParser>(
    shared: Arc<Shared<C, P>>,
    requeue: mpsc::WeakSender<WorkItem>,
    item: WorkItem,
) {
    tokio::spawn(async move {
        let file = item.file_name();
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                shared.abandon_retry(&file, "pool shutting down");
                return;
            }
            _ = tokio::time::sleep(shared.config.retry_delay) => {}
        }
        let Some(queue) = requeue.upgrade() else {
            shared.abandon_retry(&file, "work queue closed");
            return;
        };
        shared.queued.fetch_add(1, Ordering::AcqRel);
        let sent = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => false,
            res = queue.send(item) => res.is_ok(),
        };
        if !sent {
            shared.queued.fetch_sub(1, Ordering::AcqRel);
            shared.abandon_retry(&file, "work queue closed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, MockBroker, MockChannel, ScriptedParser};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn item(name: &str) -> WorkItem {
        WorkItem::new(
            PathBuf::from(format!("/data/{name} 2024-05-01 18-22-10.ndjson")),
            128,
            Utc::now(),
        )
    }

    fn pool_with(
        config: Config,
        parser: ScriptedParser,
    ) -> (WorkerPool<MockChannel, ScriptedParser>, Arc<MockBroker>, Arc<ScriptedParser>) {
        let broker = MockBroker::new();
        let parser = Arc::new(parser);
        let pool = WorkerPool::new(Arc::new(config), Arc::new(broker.pool(2)), parser.clone());
        (pool, broker, parser)
    }

    #[tokio::test]
    async fn processes_every_submitted_file() {
        let dir = TempDir::new().unwrap();
        let (pool, broker, _) =
            pool_with(test_config(dir.path()), ScriptedParser::new(vec![("s1", 3)]));
        pool.start();
        for name in ["a", "b", "c", "d"] {
            pool.submit(item(name)).await.unwrap();
        }
        pool.wait_for_completion().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.files_processed, 4);
        assert_eq!(metrics.files_failed, 0);
        assert_eq!(metrics.records_processed, 12);
        assert_eq!(metrics.batches_processed, 4);
        assert_eq!(metrics.publish.batches, 4);
        assert_eq!(metrics.queue_depth, 0);
        assert_eq!(metrics.workers.len(), 2);
        assert_eq!(
            metrics.workers.iter().map(|w| w.files_processed).sum::<u64>(),
            4
        );
        assert_eq!(broker.batches().len(), 4);

        pool.stop().await;
        assert_eq!(pool.metrics().active_workers, 0);
        assert!(pool.shared.pool.is_closing());
    }

    #[tokio::test]
    async fn retryable_failure_runs_max_retries_plus_one_times() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.max_retries = 2;
        let (pool, _, parser) = pool_with(config, ScriptedParser::failing());
        pool.start();
        pool.submit(item("broken")).await.unwrap();
        pool.wait_for_completion().await;

        assert_eq!(parser.calls(), 3);
        let metrics = pool.metrics();
        assert_eq!(metrics.files_failed, 1);
        assert_eq!(metrics.files_processed, 0);
        assert_eq!(metrics.retries_scheduled, 2);
        assert_eq!(metrics.error_count, 3);
        pool.stop().await;
    }

    #[tokio::test]
    async fn zero_retries_means_a_single_attempt() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.max_retries = 0;
        let (pool, _, parser) = pool_with(config, ScriptedParser::failing());
        pool.start();
        pool.submit(item("broken")).await.unwrap();
        pool.wait_for_completion().await;

        assert_eq!(parser.calls(), 1);
        assert_eq!(pool.metrics().retries_scheduled, 0);
        assert_eq!(pool.metrics().files_failed, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn timed_out_file_is_terminal() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.file_timeout = Duration::from_millis(50);
        let parser = ScriptedParser::new(vec![("s1", 3)]).with_delay(Duration::from_millis(300));
        let (pool, _, parser) = pool_with(config, parser);
        pool.start();
        pool.submit(item("slow")).await.unwrap();
        pool.wait_for_completion().await;

        assert_eq!(parser.calls(), 1);
        let metrics = pool.metrics();
        assert_eq!(metrics.files_failed, 1);
        assert_eq!(metrics.retries_scheduled, 0);
        assert_eq!(metrics.workers.iter().map(|w| w.error_count).sum::<u64>(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_finishes_in_flight_files_and_leaves_queued_ones() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.worker_count = 1;
        let parser = ScriptedParser::new(vec![("s1", 3)]).with_delay(Duration::from_millis(100));
        let (pool, broker, parser) = pool_with(config, parser);
        pool.start();
        for name in ["a", "b", "c"] {
            pool.submit(item(name)).await.unwrap();
        }
        while parser.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.stop().await;

        assert_eq!(parser.calls(), 1);
        let metrics = pool.metrics();
        assert_eq!(metrics.files_processed, 1);
        assert_eq!(metrics.queue_depth, 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(broker.batches().len(), 1);
        assert!(metrics
            .workers
            .iter()
            .all(|worker| worker.status == WorkerStatus::Completed));
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (pool, _, _) = pool_with(test_config(dir.path()), ScriptedParser::new(vec![("s1", 1)]));
        pool.start();
        pool.stop().await;

        assert_eq!(pool.submit(item("late")).await, Err(SubmitError::Closed));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn submit_after_cancellation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.file_queue_size = 1;
        let (pool, _, _) = pool_with(config, ScriptedParser::new(vec![("s1", 1)]));
        pool.submit(item("first")).await.unwrap();
        pool.shared.cancel.cancel();

        assert_eq!(pool.submit(item("second")).await, Err(SubmitError::Cancelled));
        assert_eq!(pool.metrics().queue_depth, 1);
        pool.stop().await;
    }
}
