mod line;
mod pool;
mod schema;

pub use line::LineSender;
pub use pool::SenderPool;
pub use schema::ensure_table;

use crate::telemetry::Telemetry;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("QuestDB request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("QuestDB rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("QuestDB unreachable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },
    #[error("invalid QuestDB url: {0}")]
    Url(#[from] url::ParseError),
    #[error("sender pool is closed")]
    PoolClosed,
}

/// Destination for decoded rows.
pub trait RowSink: Send + 'static {
    /// Writes and flushes every record; returns once all rows are durable.
    fn write_records(
        &mut self,
        records: &[Telemetry],
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

/// Runs `probe` until it succeeds, doubling the delay after each failure.
pub(crate) async fn probe_with_backoff<F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut probe: F,
) -> Result<(), StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let attempts = attempts.max(1);
    let mut reason = String::new();
    for attempt in 0..attempts {
        match probe().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                reason = err.to_string();
                if attempt + 1 < attempts {
                    let delay = base_delay.saturating_mul(1 << attempt.min(16));
                    tracing::warn!(
                        attempt = attempt + 1,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "QuestDB request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(StorageError::Unavailable { attempts, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_success() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        probe_with_backoff(5, Duration::from_secs(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(StorageError::PoolClosed)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_gives_up_after_last_attempt() {
        let calls = AtomicU32::new(0);
        let err = probe_with_backoff(3, Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::PoolClosed)
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, StorageError::Unavailable { attempts: 3, ref reason } if reason == "sender pool is closed"));
    }
}
