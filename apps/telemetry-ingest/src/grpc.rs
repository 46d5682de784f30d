use crate::broker::{BrokerChannel, MqttChannel};
use crate::source::{NdjsonParser, RecordingParser};
use crate::workers::{PoolMetrics, WorkerMetrics, WorkerPool};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("telemetry.ingest");
}

use proto::ingest_status_server::{IngestStatus, IngestStatusServer};
use proto::{MetricsReply, MetricsRequest, WorkerSnapshot};

pub struct StatusService<C: BrokerChannel = MqttChannel, P: RecordingParser = NdjsonParser> {
    pool: Arc<WorkerPool<C, P>>,
}

impl<C: BrokerChannel, P: RecordingParser> StatusService<C, P> {
    pub fn new(pool: Arc<WorkerPool<C, P>>) -> Self {
        Self { pool }
    }
}

fn to_snapshot(worker: &WorkerMetrics) -> WorkerSnapshot {
    WorkerSnapshot {
        worker_id: worker.worker_id,
        status: worker.status.as_str().to_string(),
        current_file: worker.current_file.clone().unwrap_or_default(),
        files_processed: worker.files_processed,
        records: worker.records,
        batches: worker.batches,
        error_count: worker.error_count,
        records_per_second: worker.records_per_second(),
        avg_file_millis: worker.avg_time_per_file().as_millis() as u64,
        last_activity_unix_ms: worker.last_activity.timestamp_millis(),
    }
}

fn to_reply(metrics: &PoolMetrics) -> MetricsReply {
    MetricsReply {
        files_processed: metrics.files_processed,
        files_failed: metrics.files_failed,
        records_processed: metrics.records_processed,
        batches_processed: metrics.batches_processed,
        queue_depth: metrics.queue_depth as u64,
        active_workers: metrics.active_workers as u32,
        error_count: metrics.error_count,
        retries_scheduled: metrics.retries_scheduled,
        persisted_batches: metrics.publish.persisted_batches,
        failed_batches: metrics.publish.failed_batches,
        lost_batches: metrics.publish.lost_batches,
        abandoned_batches: metrics.publish.abandoned_batches,
        circuit_open: metrics.circuit_open,
        uptime_seconds: metrics.uptime.as_secs(),
        workers: metrics.workers.iter().map(to_snapshot).collect(),
        build: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[tonic::async_trait]
impl<C: BrokerChannel, P: RecordingParser> IngestStatus for StatusService<C, P> {
    async fn get_metrics(
        &self,
        _request: Request<MetricsRequest>,
    ) -> Result<Response<MetricsReply>, Status> {
        Ok(Response::new(to_reply(&self.pool.metrics())))
    }
}

pub async fn serve_uds<C: BrokerChannel, P: RecordingParser>(
    socket_path: &str,
    service: StatusService<C, P>,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<IngestStatusServer<StatusService<C, P>>>()
        .await;

    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(health_service)
        .add_service(IngestStatusServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}
