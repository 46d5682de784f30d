use super::{probe_with_backoff, LineSender, RowSink, StorageError};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

const PING_ATTEMPTS: u32 = 10;
const PING_BASE_DELAY: Duration = Duration::from_secs(1);

/// Fixed set of senders handed out one delivery at a time. A permit is held
/// for every checked-out sender, so `available()` always equals the idle count.
pub struct SenderPool<S: RowSink = LineSender> {
    idle: Mutex<Vec<S>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl SenderPool<LineSender> {
    /// Waits for QuestDB to answer, then builds `size` senders.
    pub async fn connect(
        client: &reqwest::Client,
        base: &Url,
        table: &str,
        size: usize,
        auto_flush_rows: usize,
    ) -> Result<Self, StorageError> {
        let probe = LineSender::new(client.clone(), base, table, auto_flush_rows)?;
        probe_with_backoff(PING_ATTEMPTS, PING_BASE_DELAY, || probe.ping()).await?;

        let senders = (0..size.max(1))
            .map(|_| LineSender::new(client.clone(), base, table, auto_flush_rows))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(size = senders.len(), %base, table, "QuestDB sender pool ready");
        Ok(Self::from_senders(senders))
    }
}

impl<S: RowSink> SenderPool<S> {
    pub fn from_senders(senders: Vec<S>) -> Self {
        let size = senders.len();
        Self {
            idle: Mutex::new(senders),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free sender. Fails once the pool is closed.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSender<S>, StorageError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::PoolClosed)?;
        let sender = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(StorageError::PoolClosed)?;
        Ok(PooledSender {
            sender: Some(sender),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Resolves once every sender is back in the pool.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size as u32).await {
            drop(all);
        }
    }

    /// Waits for outstanding checkouts, then refuses new ones.
    pub async fn close(&self) {
        self.wait_idle().await;
        self.permits.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(size = self.size, "sender pool closed");
    }

    fn release(&self, sender: S) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
    }
}

/// A sender on loan from the pool; returned when dropped.
pub struct PooledSender<S: RowSink = LineSender> {
    sender: Option<S>,
    pool: Arc<SenderPool<S>>,
    // Freed after `Drop` has returned the sender to `idle`.
    _permit: OwnedSemaphorePermit,
}

impl<S: RowSink> Deref for PooledSender<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.sender {
            Some(sender) => sender,
            None => unreachable!("sender is only taken on drop"),
        }
    }
}

impl<S: RowSink> DerefMut for PooledSender<S> {
    fn deref_mut(&mut self) -> &mut S {
        match &mut self.sender {
            Some(sender) => sender,
            None => unreachable!("sender is only taken on drop"),
        }
    }
}

impl<S: RowSink> Drop for PooledSender<S> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.pool.release(sender);
        }
    }
}
