mod accumulator;
mod broker;
mod config;
mod grpc;
mod processor;
mod publisher;
mod scan;
mod source;
mod spool;
mod telemetry;
#[cfg(test)]
mod test_support;
mod workers;

use crate::broker::ConnectionPool;
use crate::config::Config;
use crate::grpc::{serve_uds, StatusService};
use crate::publisher::PublisherOptions;
use crate::scan::scan_ready_files;
use crate::source::NdjsonParser;
use crate::spool::{replay_spilled, ReplaySummary};
use crate::workers::{PoolMetrics, WorkerPool};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn main() -> Result<()> {
    let config = Config::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime_threads)
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    init_tracing(&config)?;
    let config = Arc::new(config);
    let topic = config.broker.topic();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        workers = config.worker_count,
        pool_size = config.broker_pool_size,
        topic = %topic,
        bulk_append = config.bulk_append,
        "telemetry ingest starting"
    );

    let pool = Arc::new(
        ConnectionPool::connect(&config.broker, config.broker_pool_size)
            .await
            .context("failed to connect to broker")?,
    );

    let attempt_timeout = PublisherOptions::from_config(&config).attempt_timeout;
    match replay_spilled(&config.spool_dir, &pool, &topic, attempt_timeout).await {
        Ok(summary) if summary != ReplaySummary::default() => tracing::info!(
            recovered = summary.recovered,
            segments = summary.segments_replayed,
            frames = summary.frames_replayed,
            remaining = summary.segments_remaining,
            quarantined = summary.segments_quarantined,
            "spillover replayed"
        ),
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "spillover replay failed; segments kept"),
    }

    let parser = Arc::new(NdjsonParser);
    let files = scan_ready_files(&config.data_dir, config.file_age_threshold, parser.as_ref())?;
    if files.is_empty() {
        tracing::info!(data_dir = %config.data_dir.display(), "no recordings ready for ingest");
        pool.close().await;
        return Ok(());
    }
    let total_bytes: u64 = files.iter().map(|item| item.size_bytes).sum();
    tracing::info!(
        files = files.len(),
        total_mb = total_bytes / (1024 * 1024),
        "recordings ready for ingest"
    );

    let workers = Arc::new(WorkerPool::new(config.clone(), pool, parser));
    workers.start();

    let status_handle = config.status_socket.clone().map(|socket| {
        let service = StatusService::new(workers.clone());
        tokio::spawn(async move {
            if let Err(err) = serve_uds(&socket, service).await {
                tracing::error!(error = %err, socket = %socket, "status server exited");
            }
        })
    });
    let health_handle = spawn_health_log(workers.clone());

    let started = Instant::now();
    let interrupted = tokio::select! {
        _ = shutdown_signal() => true,
        _ = async {
            for item in files {
                if let Err(err) = workers.submit(item).await {
                    tracing::warn!(error = %err, "stopped submitting recordings");
                    break;
                }
            }
            workers.wait_for_completion().await;
        } => false,
    };
    if interrupted {
        tracing::info!("shutdown signal received; stopping workers");
    }

    workers.stop().await;
    health_handle.abort();
    if let Some(handle) = status_handle {
        handle.abort();
    }
    log_final_metrics(&workers.metrics(), started.elapsed());
    if config.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error = %err, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}

fn spawn_health_log(workers: Arc<WorkerPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let metrics = workers.metrics();
            tracing::info!(
                files_processed = metrics.files_processed,
                files_failed = metrics.files_failed,
                records = metrics.records_processed,
                queue_depth = metrics.queue_depth,
                outstanding = workers.outstanding(),
                active_workers = metrics.active_workers,
                persisted_batches = metrics.publish.persisted_batches,
                circuit_open = metrics.circuit_open,
                "ingest progress"
            );
        }
    })
}

fn log_final_metrics(metrics: &PoolMetrics, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let records_per_second = if secs > 0.0 {
        metrics.records_processed as f64 / secs
    } else {
        0.0
    };
    tracing::info!(
        files_processed = metrics.files_processed,
        files_failed = metrics.files_failed,
        records = metrics.records_processed,
        batches = metrics.batches_processed,
        retries = metrics.retries_scheduled,
        errors = metrics.error_count,
        persisted_batches = metrics.publish.persisted_batches,
        sync_fallbacks = metrics.publish.sync_fallbacks,
        lost_batches = metrics.publish.lost_batches,
        abandoned_batches = metrics.publish.abandoned_batches,
        elapsed_secs = elapsed.as_secs(),
        records_per_second = records_per_second as u64,
        "ingest finished"
    );
    for worker in &metrics.workers {
        tracing::debug!(
            worker_id = worker.worker_id,
            status = worker.status.as_str(),
            files = worker.files_processed,
            records = worker.records,
            errors = worker.error_count,
            records_per_second = worker.records_per_second() as u64,
            avg_file_ms = worker.avg_time_per_file().as_millis() as u64,
            "worker summary"
        );
    }
}
