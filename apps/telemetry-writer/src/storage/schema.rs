use super::{probe_with_backoff, StorageError};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const EXEC_ATTEMPTS: u32 = 3;
const EXEC_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct ExecFailure {
    error: String,
}

pub(super) fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            session_id SYMBOL CAPACITY 50000 INDEX,
            track_name SYMBOL CAPACITY 100 INDEX,
            track_id SYMBOL CAPACITY 100 INDEX,
            lap_id SYMBOL CAPACITY 500,
            session_num SYMBOL CAPACITY 20,
            session_type SYMBOL CAPACITY 10 INDEX,
            session_name SYMBOL CAPACITY 50 INDEX,
            car_id SYMBOL CAPACITY 1000 INDEX,
            gear INT,
            player_car_position INT,
            speed DOUBLE,
            lap_dist_pct DOUBLE,
            session_time DOUBLE,
            lat DOUBLE,
            lon DOUBLE,
            lap_current_lap_time DOUBLE,
            lapLastLapTime DOUBLE,
            lapDeltaToBestLap DOUBLE,
            throttle FLOAT,
            brake FLOAT,
            steering_wheel_angle FLOAT,
            rpm FLOAT,
            velocity_x FLOAT,
            velocity_y FLOAT,
            velocity_z FLOAT,
            fuel_level FLOAT,
            alt FLOAT,
            lat_accel FLOAT,
            long_accel FLOAT,
            vert_accel FLOAT,
            pitch FLOAT,
            roll FLOAT,
            yaw FLOAT,
            yaw_north FLOAT,
            voltage FLOAT,
            waterTemp FLOAT,
            lFpressure FLOAT,
            rFpressure FLOAT,
            lRpressure FLOAT,
            rRpressure FLOAT,
            lFtempM FLOAT,
            rFtempM FLOAT,
            lRtempM FLOAT,
            rRtempM FLOAT,
            timestamp TIMESTAMP
        ) TIMESTAMP(timestamp) PARTITION BY DAY
        WAL
        WITH maxUncommittedRows=1000000
        DEDUP UPSERT KEYS(timestamp, session_id);"
    )
}

async fn exec(client: &reqwest::Client, url: &Url, sql: &str) -> Result<(), StorageError> {
    let response = client
        .get(url.clone())
        .query(&[("query", sql)])
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ExecFailure>(&body)
        .map(|failure| failure.error)
        .unwrap_or(body);
    Err(StorageError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Creates the telemetry table if it does not exist yet.
pub async fn ensure_table(
    client: &reqwest::Client,
    base: &Url,
    table: &str,
) -> Result<(), StorageError> {
    let url = base.join("/exec")?;
    let sql = create_table_sql(table);
    probe_with_backoff(EXEC_ATTEMPTS, EXEC_BASE_DELAY, || exec(client, &url, &sql)).await?;
    tracing::info!(table, "QuestDB table ready");
    Ok(())
}
