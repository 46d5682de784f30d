use crate::processor::ProcessError;
use crate::publisher::PublishStats;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub retry_count: u32,
}

impl WorkItem {
    pub fn new(path: PathBuf, size_bytes: u64, modified: DateTime<Utc>) -> Self {
        Self {
            path,
            size_bytes,
            modified,
            retry_count: 0,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WorkResult {
    pub item: WorkItem,
    pub worker_id: u32,
    pub records: u64,
    pub batches: u64,
    pub duration: Duration,
    pub publish: PublishStats,
}

#[derive(Debug)]
pub struct WorkError {
    pub item: WorkItem,
    pub worker_id: u32,
    pub error: ProcessError,
    pub retry: bool,
    pub duration: Duration,
    pub publish: PublishStats,
    pub at: DateTime<Utc>,
}

/// Retry only while the item has attempts left and the failure is not terminal.
pub fn should_retry(error: &ProcessError, retry_count: u32, max_retries: u32) -> bool {
    error.is_retryable() && retry_count < max_retries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Processing,
    Error,
    /// The worker has left its loop for good.
    Completed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Error => "error",
            WorkerStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: u32,
    pub status: WorkerStatus,
    pub current_file: Option<String>,
    pub files_processed: u64,
    pub records: u64,
    pub batches: u64,
    pub error_count: u64,
    pub processing_time: Duration,
    pub last_activity: DateTime<Utc>,
}

impl WorkerMetrics {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_file: None,
            files_processed: 0,
            records: 0,
            batches: 0,
            error_count: 0,
            processing_time: Duration::ZERO,
            last_activity: Utc::now(),
        }
    }

    pub fn records_per_second(&self) -> f64 {
        let secs = self.processing_time.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.records as f64 / secs
    }

    pub fn avg_time_per_file(&self) -> Duration {
        if self.files_processed == 0 {
            return Duration::ZERO;
        }
        self.processing_time / self.files_processed as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub files_processed: u64,
    pub files_failed: u64,
    pub records_processed: u64,
    pub batches_processed: u64,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub error_count: u64,
    pub retries_scheduled: u64,
    pub publish: PublishStats,
    pub circuit_open: bool,
    pub uptime: Duration,
    pub workers: Vec<WorkerMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_respects_cap_and_terminal_errors() {
        let parse = ProcessError::BatchesLost(1);
        assert!(should_retry(&parse, 0, 3));
        assert!(should_retry(&parse, 2, 3));
        assert!(!should_retry(&parse, 3, 3));
        assert!(!should_retry(&ProcessError::Cancelled, 0, 3));
        assert!(!should_retry(&ProcessError::TimedOut(Duration::from_secs(1)), 0, 3));
    }

    #[test]
    fn worker_rates_handle_idle_workers() {
        let mut metrics = WorkerMetrics::new(1);
        assert_eq!(metrics.records_per_second(), 0.0);
        assert_eq!(metrics.avg_time_per_file(), Duration::ZERO);

        metrics.files_processed = 2;
        metrics.records = 500;
        metrics.processing_time = Duration::from_secs(5);
        assert_eq!(metrics.records_per_second(), 100.0);
        assert_eq!(metrics.avg_time_per_file(), Duration::from_millis(2500));
    }
}
