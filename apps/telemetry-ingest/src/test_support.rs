use crate::broker::{BrokerChannel, ConnectionPool, PublishError};
use crate::config::{BrokerConfig, Config};
use crate::source::{ParseError, ParseEvent, ParseSummary, RecordingParser};
use crate::telemetry::{BatchEnvelope, SensorSample, SessionMeta, Telemetry, TelemetryBatch};
use bytes::Bytes;
use prost::Message;
use std::ops::{ControlFlow, Range};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn test_config(dir: &Path) -> Config {
    Config {
        worker_count: 2,
        file_queue_size: 16,
        worker_timeout: Duration::from_secs(30),
        file_timeout: Duration::from_secs(30),
        batch_size_bytes: usize::MAX,
        batch_size_records: 1000,
        batch_timeout: Duration::from_secs(3600),
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        broker: BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "telemetry-ingest-test".to_string(),
            topic_prefix: "telemetry".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
            max_packet_size: 1024 * 1024,
        },
        broker_pool_size: 2,
        async_queue_depth: 4,
        bulk_append: false,
        file_age_threshold: Duration::ZERO,
        data_dir: dir.to_path_buf(),
        spool_dir: dir.join("spool"),
        runtime_threads: 1,
        status_socket: None,
        otlp_endpoint: None,
    }
}

/// Every tick encodes to the same length.
pub fn tick(session: &str, i: u64) -> Telemetry {
    Telemetry {
        session_id: session.to_string(),
        session_time: i as f64 + 1.0,
        speed: 100.0,
        tick_time_ns: 1_700_000_000_000_000_000 + i as i64,
        ..Default::default()
    }
}

pub fn batch_of(session: &str, range: Range<u64>) -> TelemetryBatch {
    TelemetryBatch {
        batch_id: format!("{session}-{}", range.start),
        session_id: session.to_string(),
        worker_id: 1,
        created_unix_ns: 1_700_000_000_000_000_000,
        records: range.map(|i| tick(session, i)).collect(),
    }
}

/// In-memory broker shared by every channel it hands out.
#[derive(Default)]
pub struct MockBroker {
    failing: AtomicBool,
    closed: AtomicBool,
    attempts: AtomicUsize,
    published: Mutex<Vec<Bytes>>,
    stall: Mutex<Option<Arc<Notify>>>,
    delay: Mutex<Duration>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pool(self: &Arc<Self>, size: usize) -> ConnectionPool<MockChannel> {
        let channels = (0..size)
            .map(|slot| MockChannel::with_broker(slot, self.clone()))
            .collect();
        ConnectionPool::from_channels(channels).expect("non-empty pool")
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn close_all_channels(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// The next publish waits until the returned handle is notified.
    pub fn stall_next_publish(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stall.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Every publish takes `delay` before it is acknowledged.
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.published.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<TelemetryBatch> {
        self.payloads()
            .into_iter()
            .map(|payload| {
                let envelope = BatchEnvelope::decode(payload).expect("envelope");
                TelemetryBatch::decode(envelope.payload.as_slice()).expect("batch")
            })
            .collect()
    }

    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.stall.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Client("broker refused publish".to_string()));
        }
        self.published.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct MockChannel {
    slot: usize,
    broker: Arc<MockBroker>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockChannel {
    pub fn new(slot: usize) -> Self {
        Self::with_broker(slot, MockBroker::new())
    }

    fn with_broker(slot: usize, broker: Arc<MockBroker>) -> Self {
        Self {
            slot,
            broker,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl BrokerChannel for MockChannel {
    fn slot(&self) -> usize {
        self.slot
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.broker.closed.load(Ordering::SeqCst)
    }

    async fn publish(&self, _topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.broker.publish(payload).await
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Emits a fixed list of `(session, samples)` groups for any path.
#[derive(Default)]
pub struct ScriptedParser {
    groups: Vec<(String, usize)>,
    cancel_on: Option<(usize, CancellationToken)>,
    fail_after: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedParser {
    pub fn new(groups: Vec<(&str, usize)>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|(session, samples)| (session.to_string(), samples))
                .collect(),
            ..Default::default()
        }
    }

    /// Fails on every call without emitting anything.
    pub fn failing() -> Self {
        Self {
            fail_after: true,
            ..Default::default()
        }
    }

    /// Cancels `token` right before group `index` is emitted.
    pub fn cancel_on_group(mut self, index: usize, token: CancellationToken) -> Self {
        self.cancel_on = Some((index, token));
        self
    }

    /// Emits every group, then reports a malformed line.
    pub fn fail_after_groups(mut self) -> Self {
        self.fail_after = true;
        self
    }

    /// Blocks the parsing thread for `delay` before emitting anything.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecordingParser for ScriptedParser {
    fn accepts(&self, path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some("ndjson")
    }

    fn parse(
        &self,
        _path: &Path,
        visit: &mut dyn FnMut(ParseEvent) -> ControlFlow<()>,
    ) -> Result<ParseSummary, ParseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut summary = ParseSummary::default();
        let mut line = 0;
        for (index, (session, samples)) in self.groups.iter().enumerate() {
            if let Some((at, token)) = &self.cancel_on {
                if *at == index {
                    token.cancel();
                }
            }
            line += 1;
            summary.groups += 1;
            let meta = SessionMeta {
                sub_session_id: session.clone(),
                track_name: "spa".to_string(),
                ..Default::default()
            };
            if visit(ParseEvent::Group(meta)).is_break() {
                summary.stopped = true;
                return Ok(summary);
            }
            for i in 0..*samples {
                line += 1;
                summary.samples += 1;
                let sample = SensorSample {
                    session_time: i as f64 + 1.0,
                    speed: 100.0,
                    ..Default::default()
                };
                if visit(ParseEvent::Sample(sample)).is_break() {
                    summary.stopped = true;
                    return Ok(summary);
                }
            }
        }
        if self.fail_after {
            return Err(ParseError::Malformed {
                line: line + 1,
                message: "truncated record".to_string(),
            });
        }
        Ok(summary)
    }
}
