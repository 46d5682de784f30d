use crate::accumulator::{BatchAccumulator, BatchLimits};
use crate::broker::{BrokerChannel, CircuitBreaker, ConnectionPool, MqttChannel, PublishError};
use crate::config::Config;
use crate::publisher::{PublishStats, Publisher, PublisherOptions};
use crate::source::{NdjsonParser, ParseError, ParseEvent, ParseSummary, RecordingParser};
use crate::spool::SpillWriter;
use crate::telemetry::{parse_recording_start, SensorSample, SessionMeta, Telemetry};
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PARSE_CHUNK: usize = 1024;
const PARSE_CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processing cancelled")]
    Cancelled,
    #[error("processing exceeded {0:?}")]
    TimedOut(Duration),
    #[error("file name carries no recording start time: {}", .0.display())]
    InvalidFileName(PathBuf),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("parser task failed: {0}")]
    ParserTask(String),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{0} batches were neither delivered nor spilled")]
    BatchesLost(u64),
}

impl ProcessError {
    /// Cancellation and deadlines are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessError::Cancelled | ProcessError::TimedOut(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub groups: usize,
    pub records: u64,
    pub batches: u64,
}

enum ParsedChunk {
    Group(SessionMeta),
    Samples(Vec<SensorSample>),
}

struct GroupSink<C: BrokerChannel> {
    meta: SessionMeta,
    accumulator: BatchAccumulator,
    publisher: Publisher<C>,
    records: u64,
    batches: u64,
}

impl<C: BrokerChannel> GroupSink<C> {
    async fn push(&mut self, record: Telemetry) -> Result<(), PublishError> {
        self.records += 1;
        if let Some(batch) = self.accumulator.push(record) {
            self.batches += 1;
            self.publisher.flush(batch).await?;
        }
        Ok(())
    }

    async fn extend(&mut self, records: Vec<Telemetry>) -> Result<(), PublishError> {
        self.records += records.len() as u64;
        if let Some(batch) = self.accumulator.extend(records) {
            self.batches += 1;
            self.publisher.flush(batch).await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> (u64, u64, PublishStats, Result<(), PublishError>) {
        let flushed = match self.accumulator.finish() {
            Some(batch) => {
                self.batches += 1;
                self.publisher.flush(batch).await
            }
            None => Ok(()),
        };
        let stats = self.publisher.close().await;
        (self.records, self.batches, stats, flushed)
    }
}

/// Drives the parser over one file and feeds its groups through a
/// per-group accumulator/publisher pair.
pub struct FileProcessor<C: BrokerChannel = MqttChannel, P: RecordingParser = NdjsonParser> {
    worker_id: u32,
    config: Arc<Config>,
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    parser: Arc<P>,
    cancel: CancellationToken,
    publish_stats: Mutex<PublishStats>,
}

impl<C: BrokerChannel, P: RecordingParser> FileProcessor<C, P> {
    pub fn new(
        worker_id: u32,
        config: Arc<Config>,
        pool: Arc<ConnectionPool<C>>,
        breaker: Arc<CircuitBreaker>,
        parser: Arc<P>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            config,
            pool,
            breaker,
            parser,
            cancel,
            publish_stats: Mutex::new(PublishStats::default()),
        }
    }

    /// Publisher counters of every group closed so far, including groups of a
    /// failed attempt.
    pub fn publish_stats(&self) -> PublishStats {
        self.publish_stats
            .lock()
            .map(|stats| *stats)
            .unwrap_or_default()
    }

    pub async fn process(&self, path: &Path) -> Result<FileOutcome, ProcessError> {
        let recording_start = parse_recording_start(path)
            .ok_or_else(|| ProcessError::InvalidFileName(path.to_path_buf()))?;
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let (tx, mut rx) = mpsc::channel(PARSE_CHANNEL_DEPTH);
        let parser = self.parser.clone();
        let parse_path = path.to_path_buf();
        let parse_task =
            tokio::task::spawn_blocking(move || run_parser(parser.as_ref(), &parse_path, tx));

        let mut outcome = FileOutcome::default();
        let mut current: Option<GroupSink<C>> = None;
        let driven = self
            .drive(&mut rx, &mut current, &mut outcome, recording_start)
            .await;
        let closed = match current.take() {
            Some(group) => self.close_group(group, &mut outcome).await,
            None => Ok(()),
        };
        // unblocks the parser thread if we stopped early
        drop(rx);
        let parsed = parse_task.await;

        driven?;
        closed?;
        let summary = parsed.map_err(|err| ProcessError::ParserTask(err.to_string()))??;
        tracing::debug!(
            worker_id = self.worker_id,
            path = %path.display(),
            groups = summary.groups,
            samples = summary.samples,
            "recording parsed"
        );

        let stats = self.publish_stats();
        let undelivered = stats.lost_batches + stats.abandoned_batches;
        if undelivered > 0 {
            return Err(ProcessError::BatchesLost(undelivered));
        }
        Ok(outcome)
    }

    async fn drive(
        &self,
        rx: &mut mpsc::Receiver<ParsedChunk>,
        current: &mut Option<GroupSink<C>>,
        outcome: &mut FileOutcome,
        recording_start: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        while let Some(chunk) = rx.recv().await {
            match chunk {
                ParsedChunk::Group(meta) => {
                    if let Some(done) = current.take() {
                        self.close_group(done, outcome).await?;
                    }
                    if self.cancel.is_cancelled() {
                        return Err(ProcessError::Cancelled);
                    }
                    outcome.groups += 1;
                    *current = Some(self.open_group(meta));
                }
                ParsedChunk::Samples(samples) => {
                    let Some(group) = current.as_mut() else {
                        continue;
                    };
                    let records: Vec<Telemetry> = samples
                        .into_iter()
                        .map(|sample| sample.into_record(&group.meta, recording_start, self.worker_id))
                        .collect();
                    if self.config.bulk_append {
                        group.extend(records).await?;
                    } else {
                        for record in records {
                            group.push(record).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn open_group(&self, meta: SessionMeta) -> GroupSink<C> {
        let limits = BatchLimits {
            max_records: self.config.batch_size_records,
            max_bytes: self.config.batch_size_bytes,
            max_age: self.config.batch_timeout,
        };
        let publisher = Publisher::new(
            self.pool.clone(),
            self.breaker.clone(),
            SpillWriter::new(&self.config.spool_dir, self.worker_id),
            PublisherOptions::from_config(&self.config),
            self.cancel.clone(),
        );
        GroupSink {
            accumulator: BatchAccumulator::new(meta.sub_session_id.clone(), self.worker_id, limits),
            meta,
            publisher,
            records: 0,
            batches: 0,
        }
    }

    async fn close_group(
        &self,
        group: GroupSink<C>,
        outcome: &mut FileOutcome,
    ) -> Result<(), ProcessError> {
        let session_id = group.meta.sub_session_id.clone();
        let (records, batches, stats, flushed) = group.finish().await;
        outcome.records += records;
        outcome.batches += batches;
        if let Ok(mut total) = self.publish_stats.lock() {
            total.merge(&stats);
        }
        tracing::debug!(
            worker_id = self.worker_id,
            session_id = %session_id,
            records,
            batches,
            persisted = stats.persisted_batches,
            "session group closed"
        );
        flushed.map_err(ProcessError::from)
    }
}

fn run_parser<P: RecordingParser + ?Sized>(
    parser: &P,
    path: &Path,
    tx: mpsc::Sender<ParsedChunk>,
) -> Result<ParseSummary, ParseError> {
    let mut chunk: Vec<SensorSample> = Vec::with_capacity(PARSE_CHUNK);
    let parsed = parser.parse(path, &mut |event| {
        match event {
            ParseEvent::Group(meta) => {
                if !chunk.is_empty()
                    && tx
                        .blocking_send(ParsedChunk::Samples(std::mem::take(&mut chunk)))
                        .is_err()
                {
                    return ControlFlow::Break(());
                }
                if tx.blocking_send(ParsedChunk::Group(meta)).is_err() {
                    return ControlFlow::Break(());
                }
            }
            ParseEvent::Sample(sample) => {
                chunk.push(sample);
                if chunk.len() >= PARSE_CHUNK
                    && tx
                        .blocking_send(ParsedChunk::Samples(std::mem::take(&mut chunk)))
                        .is_err()
                {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    });
    if !chunk.is_empty() {
        // receiver gone means the file was abandoned; nothing left to report
        let _ = tx.blocking_send(ParsedChunk::Samples(chunk));
    }
    parsed
}
