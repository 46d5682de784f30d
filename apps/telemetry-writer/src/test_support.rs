use crate::storage::{RowSink, StorageError};
use crate::telemetry::{encode_delivery, Telemetry, TelemetryBatch};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Sink that keeps every row it is handed, or fails on demand.
#[derive(Clone, Default)]
pub struct RecordingSink {
    rows: Arc<Mutex<Vec<Telemetry>>>,
    failing: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
}

impl RecordingSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The next `count` writes fail, later ones succeed.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Telemetry> {
        self.rows.lock().unwrap().clone()
    }
}

impl RowSink for RecordingSink {
    async fn write_records(&mut self, records: &[Telemetry]) -> Result<usize, StorageError> {
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected {
                status: 500,
                message: "disk full".to_string(),
            });
        }
        self.rows.lock().unwrap().extend_from_slice(records);
        Ok(records.len())
    }
}

pub fn tick(session: &str, i: u32) -> Telemetry {
    Telemetry {
        session_id: session.to_string(),
        track_name: "monza".to_string(),
        lap_id: "1".to_string(),
        gear: i % 6,
        speed: f64::from(i),
        tick_time_ns: 1_700_000_000_000_000_000 + i64::from(i),
        ..Default::default()
    }
}

pub fn delivery(session: &str, records: Vec<Telemetry>) -> Vec<u8> {
    encode_delivery(&TelemetryBatch {
        batch_id: format!("{session}-batch"),
        session_id: session.to_string(),
        worker_id: 1,
        created_unix_ns: 1_700_000_000_000_000_000,
        records,
    })
}
