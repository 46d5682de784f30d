use super::{BrokerChannel, MqttChannel, PoolError, PublishError};
use crate::config::BrokerConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Fixed set of broker channels handed out round robin.
///
/// Slots are never reopened by the pool: a slot that reports itself closed
/// yields `PublishError::ChannelClosed` and the caller moves on to the next
/// slot on its next attempt.
pub struct ConnectionPool<C: BrokerChannel = MqttChannel> {
    channels: Vec<Arc<C>>,
    next: AtomicUsize,
    closing: AtomicBool,
}

impl ConnectionPool<MqttChannel> {
    /// Opens `size` connections eagerly. Any failure closes the ones already
    /// opened and fails the whole pool.
    pub async fn connect(config: &BrokerConfig, size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let mut channels = Vec::with_capacity(size);
        for slot in 0..size {
            match MqttChannel::connect(config, slot).await {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    for opened in &channels {
                        opened.close().await;
                    }
                    return Err(err);
                }
            }
        }
        tracing::info!(size, host = %config.host, port = config.port, "broker connection pool ready");
        Self::from_channels(channels)
    }
}

impl<C: BrokerChannel> ConnectionPool<C> {
    pub fn from_channels(channels: Vec<C>) -> Result<Self, PoolError> {
        if channels.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self {
            channels: channels.into_iter().map(Arc::new).collect(),
            next: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.channels.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn get_channel(&self) -> Result<Arc<C>, PublishError> {
        if self.is_closing() {
            return Err(PublishError::PoolClosing);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        let channel = &self.channels[idx];
        if channel.is_closed() {
            return Err(PublishError::ChannelClosed { slot: channel.slot() });
        }
        Ok(Arc::clone(channel))
    }

    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        for channel in &self.channels {
            channel.close().await;
        }
        tracing::info!(size = self.channels.len(), "broker connection pool closed");
    }
}
