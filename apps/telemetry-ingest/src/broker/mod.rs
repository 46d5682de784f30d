mod breaker;
mod pool;

pub use breaker::CircuitBreaker;
pub use pool::ConnectionPool;

use crate::config::BrokerConfig;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const CLIENT_CHANNEL_CAPACITY: usize = 64;
const POLLER_STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("connection pool is closing")]
    PoolClosing,
    #[error("broker channel {slot} is closed")]
    ChannelClosed { slot: usize },
    #[error("broker client error: {0}")]
    Client(String),
    #[error("publish attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("batch lost: broker unavailable and local spillover failed: {0}")]
    SpillFailed(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool needs at least one channel")]
    Empty,
    #[error("failed to open broker connection {slot}: {reason}")]
    Connect { slot: usize, reason: String },
}

/// One pooled broker connection.
pub trait BrokerChannel: Send + Sync + 'static {
    fn slot(&self) -> usize;

    fn is_closed(&self) -> bool;

    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Best-effort; errors are logged and swallowed.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub struct MqttChannel {
    slot: usize,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttChannel {
    /// Dials the broker and waits for CONNACK before handing out the slot.
    pub async fn connect(config: &BrokerConfig, slot: usize) -> Result<Self, PoolError> {
        let mut options = MqttOptions::new(config.client_id(slot), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(PoolError::Connect { slot, reason }),
            Err(_) => {
                return Err(PoolError::Connect {
                    slot,
                    reason: format!("no CONNACK within {:?}", config.connect_timeout),
                })
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let poller = spawn_poller(slot, eventloop, connected.clone(), closing.clone());
        tracing::debug!(slot, host = %config.host, port = config.port, "broker channel opened");

        Ok(Self {
            slot,
            client,
            connected,
            closing,
            poller: Mutex::new(Some(poller)),
        })
    }
}

impl BrokerChannel for MqttChannel {
    fn slot(&self) -> usize {
        self.slot
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| PublishError::Client(err.to_string()))
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(slot = self.slot, error = %err, "broker disconnect failed");
        }
        let handle = self
            .poller
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(POLLER_STOP_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(err) => return Err(err.to_string()),
        }
    }
}

fn spawn_poller(
    slot: usize,
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if !connected.swap(true, Ordering::AcqRel) {
                        tracing::info!(slot, "broker channel reconnected");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Release);
                    if closing.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!(slot, error = %err, "broker channel error; slot unavailable");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}
