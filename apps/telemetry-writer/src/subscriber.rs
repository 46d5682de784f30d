use crate::config::Config;
use crate::sanitize::is_valid_record;
use crate::storage::{RowSink, SenderPool};
use crate::telemetry::decode_delivery;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const CLIENT_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct WriterStats {
    deliveries: AtomicU64,
    batches_written: AtomicU64,
    records_written: AtomicU64,
    records_skipped: AtomicU64,
    poison: AtomicU64,
    write_retries: AtomicU64,
    failed_writes: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub deliveries: u64,
    pub batches_written: u64,
    pub records_written: u64,
    pub records_skipped: u64,
    pub poison: u64,
    pub write_retries: u64,
    pub failed_writes: u64,
    pub reconnects: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Written { records: usize, skipped: usize },
    /// Undecodable; acked so the broker stops redelivering it.
    Poison,
    /// Storage write failed on every attempt; left unacked for redelivery.
    Failed,
}

impl DeliveryOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, DeliveryOutcome::Failed)
    }
}

/// Decodes one broker delivery and writes its valid records through `sink`,
/// retrying failed writes with a doubling delay.
pub async fn handle_delivery<S: RowSink>(
    sink: &mut S,
    payload: &[u8],
    stats: &WriterStats,
) -> DeliveryOutcome {
    stats.deliveries.fetch_add(1, Ordering::Relaxed);

    let mut batch = match decode_delivery(payload) {
        Ok(batch) => batch,
        Err(err) => {
            stats.poison.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, bytes = payload.len(), "dropping undecodable delivery");
            return DeliveryOutcome::Poison;
        }
    };

    let total = batch.records.len();
    batch.records.retain(is_valid_record);
    let skipped = total - batch.records.len();
    if skipped > 0 {
        stats
            .records_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
        tracing::debug!(batch_id = %batch.batch_id, skipped, "skipped records without session or track");
    }
    if batch.records.is_empty() {
        return DeliveryOutcome::Written {
            records: 0,
            skipped,
        };
    }

    let mut attempt = 1;
    let written = loop {
        match sink.write_records(&batch.records).await {
            Ok(records) => break Ok(records),
            Err(err) if attempt < WRITE_ATTEMPTS => {
                let delay = WRITE_RETRY_BASE.saturating_mul(1 << (attempt - 1));
                stats.write_retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "batch write failed; retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => break Err(err),
        }
    };

    match written {
        Ok(records) => {
            stats.batches_written.fetch_add(1, Ordering::Relaxed);
            stats
                .records_written
                .fetch_add(records as u64, Ordering::Relaxed);
            tracing::debug!(
                batch_id = %batch.batch_id,
                session_id = %batch.session_id,
                worker_id = batch.worker_id,
                records,
                "batch written"
            );
            DeliveryOutcome::Written { records, skipped }
        }
        Err(err) => {
            stats.failed_writes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                batch_id = %batch.batch_id,
                session_id = %batch.session_id,
                attempts = WRITE_ATTEMPTS,
                error = %err,
                "batch write failed; leaving delivery unacked"
            );
            DeliveryOutcome::Failed
        }
    }
}

/// Handles a delivery and acks it, or asks the run loop for a new connection
/// when it has to stay unacked: the broker only redelivers on reconnect.
async fn settle_delivery<S: RowSink>(
    sink: &mut S,
    publish: &Publish,
    stats: &WriterStats,
    client: &AsyncClient,
    write_failed: &Notify,
) -> DeliveryOutcome {
    let outcome = handle_delivery(sink, &publish.payload, stats).await;
    if outcome.should_ack() {
        if let Err(err) = client.ack(publish).await {
            tracing::warn!(error = %err, pkid = publish.pkid, "failed to queue ack");
        }
    } else {
        write_failed.notify_one();
    }
    outcome
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &config.broker_username {
        options.set_credentials(
            username.clone(),
            config.broker_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Consumes batches until `shutdown` fires. Each delivery holds a pool
/// checkout for its whole lifetime, so in-flight deliveries never exceed the
/// pool size. A delivery left unacked drops the connection so the broker
/// hands it out again instead of holding its in-flight slot.
pub async fn run<S: RowSink>(
    config: &Config,
    pool: Arc<SenderPool<S>>,
    stats: Arc<WriterStats>,
    shutdown: CancellationToken,
    subscribed: watch::Sender<bool>,
) -> Result<()> {
    let topic = config.topic();
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), CLIENT_CHANNEL_CAPACITY);
    let mut deliveries = JoinSet::new();
    let write_failed = Arc::new(Notify::new());

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = write_failed.notified() => {
                subscribed.send_replace(false);
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("storage write failed; reconnecting so the broker redelivers unacked batches");
                eventloop.clean();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
                continue;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.session_present {
                    tracing::info!(topic = %topic, "broker session resumed");
                    subscribed.send_replace(true);
                } else if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                    tracing::warn!(error = %err, topic = %topic, "failed to queue subscribe");
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(_))) => {
                tracing::info!(topic = %topic, "subscribed to telemetry batches");
                subscribed.send_replace(true);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let checkout = tokio::select! {
                    biased;
                    // Left unacked; the persistent session redelivers it.
                    _ = shutdown.cancelled() => break,
                    checkout = pool.acquire() => checkout?,
                };
                let client = client.clone();
                let stats = Arc::clone(&stats);
                let write_failed = Arc::clone(&write_failed);
                deliveries.spawn(async move {
                    let mut checkout = checkout;
                    let outcome =
                        settle_delivery(&mut *checkout, &publish, &stats, &client, &write_failed).await;
                    if let DeliveryOutcome::Written { records, skipped } = outcome {
                        tracing::trace!(pkid = publish.pkid, records, skipped, "delivery acked");
                    }
                    drop(checkout);
                });
            }
            Ok(_) => {}
            Err(err) => {
                subscribed.send_replace(false);
                tracing::warn!(error = %err, "broker connection dropped; reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }

        while let Some(result) = deliveries.try_join_next() {
            log_task_failure(result);
        }
    }

    subscribed.send_replace(false);
    let in_flight = deliveries.len();
    tracing::info!(in_flight, "stopping subscriber; draining in-flight deliveries");
    let grace = config.request_timeout.saturating_mul(2);
    if timeout(grace, drain_deliveries(&mut eventloop, &mut deliveries))
        .await
        .is_err()
    {
        tracing::warn!(
            remaining = deliveries.len(),
            "drain deadline reached; abandoning deliveries for redelivery"
        );
        deliveries.abort_all();
    }
    disconnect(&client, &mut eventloop).await;
    Ok(())
}

/// Keeps polling the event loop so acks queued by finishing tasks reach the
/// broker.
async fn drain_deliveries(eventloop: &mut EventLoop, deliveries: &mut JoinSet<()>) {
    let mut connected = true;
    while !deliveries.is_empty() {
        tokio::select! {
            Some(result) = deliveries.join_next() => log_task_failure(result),
            event = eventloop.poll(), if connected => {
                if let Err(err) = event {
                    tracing::warn!(error = %err, "broker lost while draining; unacked deliveries will be redelivered");
                    connected = false;
                }
            }
        }
    }
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    // The disconnect is queued behind any pending acks.
    let flushed = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        tracing::debug!("broker disconnect not confirmed");
    }
}

fn log_task_failure(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            tracing::error!(error = %err, "delivery task panicked");
        }
    }
}
