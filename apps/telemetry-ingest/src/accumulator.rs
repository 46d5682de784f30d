use crate::telemetry::{Telemetry, TelemetryBatch};
use chrono::Utc;
use prost::Message;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_age: Duration,
}

/// Pending records of one session group plus running totals.
///
/// `push` includes the triggering record in the flushed batch. `extend` never
/// splits the incoming group: it flushes what was already pending when the
/// group would overflow the limits, then takes the whole group. Both paths are
/// used on purpose.
#[derive(Debug)]
pub struct BatchAccumulator {
    session_id: String,
    worker_id: u32,
    limits: BatchLimits,
    records: Vec<Telemetry>,
    bytes: usize,
    last_flush: Instant,
    sequence: u64,
}

impl BatchAccumulator {
    pub fn new(session_id: impl Into<String>, worker_id: u32, limits: BatchLimits) -> Self {
        Self {
            session_id: session_id.into(),
            worker_id,
            limits,
            records: Vec::new(),
            bytes: 0,
            last_flush: Instant::now(),
            sequence: 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    pub fn push(&mut self, record: Telemetry) -> Option<TelemetryBatch> {
        self.bytes += record.encoded_len();
        self.records.push(record);
        if self.should_flush() {
            return Some(self.take_batch());
        }
        None
    }

    pub fn extend(&mut self, group: Vec<Telemetry>) -> Option<TelemetryBatch> {
        if group.is_empty() {
            return None;
        }
        let incoming_bytes: usize = group.iter().map(Message::encoded_len).sum();
        let flushed = if !self.records.is_empty()
            && (self.records.len() + group.len() > self.limits.max_records
                || self.bytes + incoming_bytes > self.limits.max_bytes
                || self.age_exceeded())
        {
            Some(self.take_batch())
        } else {
            None
        };
        self.records.extend(group);
        self.bytes += incoming_bytes;
        flushed
    }

    /// Flushes whatever is pending, regardless of the limits.
    pub fn finish(&mut self) -> Option<TelemetryBatch> {
        if self.records.is_empty() {
            return None;
        }
        Some(self.take_batch())
    }

    fn should_flush(&self) -> bool {
        self.records.len() >= self.limits.max_records
            || self.bytes >= self.limits.max_bytes
            || self.age_exceeded()
    }

    fn age_exceeded(&self) -> bool {
        self.last_flush.elapsed() > self.limits.max_age
    }

    fn take_batch(&mut self) -> TelemetryBatch {
        let records = std::mem::take(&mut self.records);
        let bytes = std::mem::replace(&mut self.bytes, 0);
        self.last_flush = Instant::now();
        self.sequence += 1;

        let created_unix_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        tracing::trace!(
            session_id = %self.session_id,
            records = records.len(),
            bytes,
            sequence = self.sequence,
            "batch cut"
        );
        TelemetryBatch {
            batch_id: format!("{}-{}-{}", self.worker_id, self.sequence, created_unix_ns),
            session_id: self.session_id.clone(),
            worker_id: self.worker_id,
            created_unix_ns,
            records,
        }
    }
}
