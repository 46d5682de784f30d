mod config;
mod health;
mod sanitize;
mod storage;
mod subscriber;
mod telemetry;
#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::storage::{ensure_table, SenderPool};
use crate::subscriber::WriterStats;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_writer=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!(
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        topic = %config.topic(),
        questdb = %config.questdb_url,
        table = %config.table,
        senders = config.sender_pool_size,
        "telemetry writer starting"
    );

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to build QuestDB http client")?;
    ensure_table(&http, &config.questdb_url, &config.table)
        .await
        .context("failed to create QuestDB table")?;
    let pool = Arc::new(
        SenderPool::connect(
            &http,
            &config.questdb_url,
            &config.table,
            config.sender_pool_size,
            config.auto_flush_rows,
        )
        .await
        .context("failed to connect to QuestDB")?,
    );

    let shutdown = CancellationToken::new();
    let (subscribed_tx, subscribed_rx) = watch::channel(false);
    let stats = Arc::new(WriterStats::default());

    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received; draining deliveries");
            shutdown.cancel();
        })
    };
    let health_handle = config.health_socket.clone().map(|socket| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = health::serve_uds(&socket, subscribed_rx, shutdown).await {
                tracing::error!(error = %err, socket = %socket, "health server exited");
            }
        })
    });
    let stats_handle = spawn_stats_log(stats.clone(), pool.clone());

    let result = subscriber::run(&config, pool.clone(), stats.clone(), shutdown.clone(), subscribed_tx).await;
    shutdown.cancel();
    if let Err(err) = &result {
        tracing::error!(error = %err, "subscriber stopped");
    }

    pool.close().await;
    signal_handle.abort();
    stats_handle.abort();
    if let Some(handle) = health_handle {
        handle.await.ok();
    }

    let totals = stats.snapshot();
    tracing::info!(
        deliveries = totals.deliveries,
        batches = totals.batches_written,
        records = totals.records_written,
        skipped = totals.records_skipped,
        poison = totals.poison,
        write_retries = totals.write_retries,
        failed_writes = totals.failed_writes,
        reconnects = totals.reconnects,
        "telemetry writer stopped"
    );
    result
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

fn spawn_stats_log(stats: Arc<WriterStats>, pool: Arc<SenderPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
        ticker.tick().await;
        let mut last = stats.snapshot();
        loop {
            ticker.tick().await;
            let now = stats.snapshot();
            if now == last {
                continue;
            }
            tracing::info!(
                deliveries = now.deliveries - last.deliveries,
                records = now.records_written - last.records_written,
                failed_writes = now.failed_writes - last.failed_writes,
                total_records = now.records_written,
                busy_senders = pool.size() - pool.available(),
                "writer progress"
            );
            last = now;
        }
    })
}
