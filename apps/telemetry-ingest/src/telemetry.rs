use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::path::Path;

pub mod proto {
    tonic::include_proto!("telemetry.batch");
}

pub use proto::{BatchEnvelope, Telemetry, TelemetryBatch};

/// Format tag carried in every envelope so consumers can reject foreign payloads.
pub const BATCH_FORMAT: &str = "telemetry-batch/protobuf-v1";

const RECORDING_TIME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
const RECORDING_TIME_LEN: usize = 19;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionEntry {
    pub num: i32,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// Metadata the parser attaches to each group of samples.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionMeta {
    pub sub_session_id: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

impl SessionMeta {
    pub fn session(&self, num: i32) -> Option<&SessionEntry> {
        self.sessions.iter().find(|entry| entry.num == num)
    }
}

/// One sampled instant as produced by the parser, before session enrichment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SensorSample {
    pub session_num: i32,
    pub session_time: f64,
    pub lap: i32,
    pub car_idx: i32,
    pub speed: f64,
    pub lap_dist_pct: f64,
    pub throttle: f64,
    pub brake: f64,
    pub gear: u32,
    pub rpm: f64,
    pub steering_wheel_angle: f64,
    pub velocity_x: f64,
    pub velocity_y: f64,
    pub velocity_z: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub player_car_position: u32,
    pub fuel_level: f64,
    pub lat_accel: f64,
    pub long_accel: f64,
    pub vert_accel: f64,
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
    pub yaw_north: f64,
    pub voltage: f64,
    pub water_temp: f64,
    pub lap_last_lap_time: f64,
    pub lap_delta_to_best_lap: f64,
    pub lap_current_lap_time: f64,
    pub lf_tire_pressure: f64,
    pub rf_tire_pressure: f64,
    pub lr_tire_pressure: f64,
    pub rr_tire_pressure: f64,
    pub lf_temp_m: f64,
    pub rf_temp_m: f64,
    pub lr_temp_m: f64,
    pub rr_temp_m: f64,
}

impl SensorSample {
    pub fn into_record(
        self,
        meta: &SessionMeta,
        recording_start: DateTime<Utc>,
        worker_id: u32,
    ) -> Telemetry {
        let (session_type, session_name) = meta
            .session(self.session_num)
            .map(|entry| (entry.kind.clone(), entry.name.clone()))
            .unwrap_or_default();

        Telemetry {
            lap_id: self.lap.to_string(),
            session_id: meta.sub_session_id.clone(),
            session_num: self.session_num.to_string(),
            session_type,
            session_name,
            car_id: self.car_idx.to_string(),
            track_name: meta.track_name.clone(),
            track_id: meta.track_id.clone(),
            worker_id: worker_id.to_string(),
            speed: self.speed,
            lap_dist_pct: self.lap_dist_pct,
            throttle: self.throttle,
            brake: self.brake,
            gear: self.gear,
            rpm: self.rpm,
            steering_wheel_angle: self.steering_wheel_angle,
            velocity_x: self.velocity_x,
            velocity_y: self.velocity_y,
            velocity_z: self.velocity_z,
            lat: self.lat,
            lon: self.lon,
            alt: self.alt,
            session_time: self.session_time,
            player_car_position: self.player_car_position,
            fuel_level: self.fuel_level,
            lat_accel: self.lat_accel,
            long_accel: self.long_accel,
            vert_accel: self.vert_accel,
            pitch: self.pitch,
            roll: self.roll,
            yaw: self.yaw,
            yaw_north: self.yaw_north,
            voltage: self.voltage,
            water_temp: self.water_temp,
            lap_last_lap_time: self.lap_last_lap_time,
            lap_delta_to_best_lap: self.lap_delta_to_best_lap,
            lap_current_lap_time: self.lap_current_lap_time,
            lf_tire_pressure: self.lf_tire_pressure,
            rf_tire_pressure: self.rf_tire_pressure,
            lr_tire_pressure: self.lr_tire_pressure,
            rr_tire_pressure: self.rr_tire_pressure,
            lf_temp_m: self.lf_temp_m,
            rf_temp_m: self.rf_temp_m,
            lr_temp_m: self.lr_temp_m,
            rr_temp_m: self.rr_temp_m,
            tick_time_ns: tick_time_ns(recording_start, self.session_time),
        }
    }
}

fn tick_time_ns(recording_start: DateTime<Utc>, session_time: f64) -> i64 {
    let base = recording_start.timestamp_nanos_opt().unwrap_or(0);
    if !session_time.is_finite() || session_time < 0.0 {
        return base;
    }
    base.saturating_add((session_time * 1_000_000_000.0) as i64)
}

/// Extracts the `YYYY-MM-DD HH-MM-SS` recording start embedded in a file name.
pub fn parse_recording_start(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let bytes = name.as_bytes();
    let last_start = bytes.len().checked_sub(RECORDING_TIME_LEN)?;
    (0..=last_start).find_map(|start| {
        let end = start + RECORDING_TIME_LEN;
        let digit_before = start > 0 && bytes[start - 1].is_ascii_digit();
        let digit_after = bytes.get(end).is_some_and(u8::is_ascii_digit);
        if digit_before || digit_after || !has_recording_time_shape(&bytes[start..end]) {
            return None;
        }
        NaiveDateTime::parse_from_str(name.get(start..end)?, RECORDING_TIME_FORMAT)
            .ok()
            .map(|ts| ts.and_utc())
    })
}

// `YYYY-MM-DD HH-MM-SS`; chrono alone tolerates padding and short fields.
fn has_recording_time_shape(window: &[u8]) -> bool {
    window.len() == RECORDING_TIME_LEN
        && window.iter().enumerate().all(|(i, b)| match i {
            4 | 7 | 13 | 16 => *b == b'-',
            10 => *b == b' ',
            _ => b.is_ascii_digit(),
        })
}
