use prost::Message;
use thiserror::Error;

pub mod proto {
    tonic::include_proto!("telemetry.batch");
}

pub use proto::{BatchEnvelope, Telemetry, TelemetryBatch};

pub const BATCH_FORMAT: &str = "telemetry-batch/protobuf-v1";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("undecodable envelope: {0}")]
    Envelope(#[source] prost::DecodeError),
    #[error("unsupported batch format {0:?}")]
    Format(String),
    #[error("undecodable batch body: {0}")]
    Batch(#[source] prost::DecodeError),
}

pub fn decode_delivery(payload: &[u8]) -> Result<TelemetryBatch, DeliveryError> {
    let envelope = BatchEnvelope::decode(payload).map_err(DeliveryError::Envelope)?;
    if envelope.format != BATCH_FORMAT {
        return Err(DeliveryError::Format(envelope.format));
    }
    let batch = TelemetryBatch::decode(envelope.payload.as_slice()).map_err(DeliveryError::Batch)?;
    if batch.records.len() != envelope.record_count as usize {
        tracing::warn!(
            batch_id = %batch.batch_id,
            declared = envelope.record_count,
            actual = batch.records.len(),
            "envelope record count mismatch"
        );
    }
    Ok(batch)
}

#[cfg(test)]
pub(crate) fn encode_delivery(batch: &TelemetryBatch) -> Vec<u8> {
    let body = batch.encode_to_vec();
    BatchEnvelope {
        format: BATCH_FORMAT.to_string(),
        worker_id: batch.worker_id,
        session_id: batch.session_id.clone(),
        record_count: batch.records.len() as u32,
        byte_size: body.len() as u64,
        payload: body,
    }
    .encode_to_vec()
}
