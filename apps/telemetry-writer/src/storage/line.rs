use super::{RowSink, StorageError};
use crate::sanitize::{sanitize_symbol, validate_double, validate_int};
use crate::telemetry::Telemetry;
use chrono::Utc;
use std::fmt::Write as _;
use url::Url;

const MAX_ERROR_BODY: usize = 512;

type SymbolColumn = (&'static str, fn(&Telemetry) -> &str);
type IntColumn = (&'static str, fn(&Telemetry) -> u32);
type DoubleColumn = (&'static str, fn(&Telemetry) -> f64);

pub(super) const SYMBOL_COLUMNS: &[SymbolColumn] = &[
    ("session_id", |r| r.session_id.as_str()),
    ("track_name", |r| r.track_name.as_str()),
    ("track_id", |r| r.track_id.as_str()),
    ("lap_id", |r| r.lap_id.as_str()),
    ("session_num", |r| r.session_num.as_str()),
    ("session_type", |r| r.session_type.as_str()),
    ("session_name", |r| r.session_name.as_str()),
    ("car_id", |r| r.car_id.as_str()),
];

pub(super) const INT_COLUMNS: &[IntColumn] = &[
    ("gear", |r| r.gear),
    ("player_car_position", |r| r.player_car_position),
];

// Column names match the existing dashboard queries, camelCase included.
pub(super) const DOUBLE_COLUMNS: &[DoubleColumn] = &[
    ("speed", |r| r.speed),
    ("lap_dist_pct", |r| r.lap_dist_pct),
    ("session_time", |r| r.session_time),
    ("lat", |r| r.lat),
    ("lon", |r| r.lon),
    ("lap_current_lap_time", |r| r.lap_current_lap_time),
    ("lapLastLapTime", |r| r.lap_last_lap_time),
    ("lapDeltaToBestLap", |r| r.lap_delta_to_best_lap),
    ("throttle", |r| r.throttle),
    ("brake", |r| r.brake),
    ("steering_wheel_angle", |r| r.steering_wheel_angle),
    ("rpm", |r| r.rpm),
    ("velocity_x", |r| r.velocity_x),
    ("velocity_y", |r| r.velocity_y),
    ("velocity_z", |r| r.velocity_z),
    ("fuel_level", |r| r.fuel_level),
    ("alt", |r| r.alt),
    ("lat_accel", |r| r.lat_accel),
    ("long_accel", |r| r.long_accel),
    ("vert_accel", |r| r.vert_accel),
    ("pitch", |r| r.pitch),
    ("roll", |r| r.roll),
    ("yaw", |r| r.yaw),
    ("yaw_north", |r| r.yaw_north),
    ("voltage", |r| r.voltage),
    ("waterTemp", |r| r.water_temp),
    ("lFpressure", |r| r.lf_tire_pressure),
    ("rFpressure", |r| r.rf_tire_pressure),
    ("lRpressure", |r| r.lr_tire_pressure),
    ("rRpressure", |r| r.rr_tire_pressure),
    ("lFtempM", |r| r.lf_temp_m),
    ("rFtempM", |r| r.rf_temp_m),
    ("lRtempM", |r| r.lr_temp_m),
    ("rRtempM", |r| r.rr_temp_m),
];

/// Appends one line-protocol row. Records without a tick time are stamped
/// with `fallback_ns`.
pub(super) fn encode_row(out: &mut String, table: &str, record: &Telemetry, fallback_ns: i64) {
    out.push_str(table);
    for (name, value) in SYMBOL_COLUMNS {
        let _ = write!(out, ",{name}={}", sanitize_symbol(value(record)));
    }
    let mut separator = ' ';
    for (name, value) in INT_COLUMNS {
        let _ = write!(out, "{separator}{name}={}i", validate_int(value(record)));
        separator = ',';
    }
    for (name, value) in DOUBLE_COLUMNS {
        let _ = write!(out, ",{name}={}", validate_double(value(record)));
    }
    let timestamp = if record.tick_time_ns > 0 {
        record.tick_time_ns
    } else {
        fallback_ns
    };
    let _ = writeln!(out, " {timestamp}");
}

/// Buffers rows for one table and ships them over QuestDB's HTTP endpoint.
pub struct LineSender {
    client: reqwest::Client,
    write_url: Url,
    ping_url: Url,
    table: String,
    auto_flush_rows: usize,
    buffer: String,
    rows: usize,
}

impl LineSender {
    pub fn new(
        client: reqwest::Client,
        base: &Url,
        table: impl Into<String>,
        auto_flush_rows: usize,
    ) -> Result<Self, StorageError> {
        let mut write_url = base.join("/write")?;
        write_url.set_query(Some("precision=n"));
        Ok(Self {
            client,
            write_url,
            ping_url: base.join("/ping")?,
            table: table.into(),
            auto_flush_rows: auto_flush_rows.max(1),
            buffer: String::new(),
            rows: 0,
        })
    }

    pub fn append(&mut self, record: &Telemetry) {
        let fallback_ns = if record.tick_time_ns > 0 {
            0
        } else {
            tracing::warn!(session_id = %record.session_id, "record has no tick time; using now");
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        };
        encode_row(&mut self.buffer, &self.table, record, fallback_ns);
        self.rows += 1;
    }

    /// Sends the buffered rows. The buffer is cleared whatever the outcome.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if self.rows == 0 {
            return Ok(());
        }
        let body = std::mem::take(&mut self.buffer);
        let rows = std::mem::replace(&mut self.rows, 0);

        let response = self
            .client
            .post(self.write_url.clone())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(MAX_ERROR_BODY);
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        tracing::debug!(rows, table = %self.table, "rows flushed");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let response = self.client.get(self.ping_url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message: "ping failed".to_string(),
            });
        }
        Ok(())
    }
}

impl RowSink for LineSender {
    async fn write_records(&mut self, records: &[Telemetry]) -> Result<usize, StorageError> {
        for record in records {
            self.append(record);
            if self.rows >= self.auto_flush_rows {
                self.flush().await?;
            }
        }
        self.flush().await?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Telemetry {
        Telemetry {
            session_id: "1234".to_string(),
            track_name: "Spa Francorchamps".to_string(),
            gear: u32::MAX,
            player_car_position: 3,
            speed: 71.5,
            rpm: f64::NAN,
            tick_time_ns: 1_714_587_730_000_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn row_has_symbols_fields_and_timestamp() {
        let mut out = String::new();
        encode_row(&mut out, "TelemetryTicks", &record(), 7);

        assert!(out.starts_with(
            "TelemetryTicks,session_id=1234,track_name=Spa_Francorchamps,track_id=unknown,"
        ));
        assert!(out.contains(",car_id=unknown gear=0i,player_car_position=3i,speed=71.5,"));
        assert!(out.contains(",rpm=0,"));
        assert!(out.contains(",waterTemp=0,"));
        assert!(out.ends_with(",rRtempM=0 1714587730000000000\n"));
        assert_eq!(out.matches('\n').count(), 1);
    }

    #[test]
    fn missing_tick_time_uses_fallback() {
        let mut record = record();
        record.tick_time_ns = 0;
        let mut out = String::new();
        encode_row(&mut out, "t", &record, 99);
        assert!(out.ends_with(" 99\n"));
    }

    #[test]
    fn sender_targets_nanosecond_write_endpoint() {
        let base = Url::parse("http://questdb:9000").unwrap();
        let mut sender = LineSender::new(reqwest::Client::new(), &base, "TelemetryTicks", 2).unwrap();
        assert_eq!(sender.write_url.as_str(), "http://questdb:9000/write?precision=n");
        assert_eq!(sender.ping_url.as_str(), "http://questdb:9000/ping");

        sender.append(&record());
        sender.append(&record());
        assert_eq!(sender.rows, 2);
        assert_eq!(sender.buffer.lines().count(), 2);
    }
}
