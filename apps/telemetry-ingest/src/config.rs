use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_BROKER_URL: &str = "mqtt://127.0.0.1:1883";

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl BrokerConfig {
    pub fn topic(&self) -> String {
        format!("{}/ticks", self.topic_prefix.trim_end_matches('/'))
    }

    pub fn client_id(&self, slot: usize) -> String {
        format!("{}-{}", self.client_id_prefix, slot)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub worker_count: usize,
    pub file_queue_size: usize,
    pub worker_timeout: Duration,
    pub file_timeout: Duration,
    pub batch_size_bytes: usize,
    pub batch_size_records: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub broker: BrokerConfig,
    pub broker_pool_size: usize,
    pub async_queue_depth: usize,
    pub bulk_append: bool,
    pub file_age_threshold: Duration,
    pub data_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub runtime_threads: usize,
    pub status_socket: Option<String>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    worker_count: Option<usize>,
    #[serde(default)]
    file_queue_size: Option<usize>,
    #[serde(default)]
    batch_size_records: Option<usize>,
    #[serde(default)]
    batch_size_bytes: Option<usize>,
    #[serde(default)]
    broker_url: Option<String>,
    #[serde(default)]
    broker_pool_size: Option<usize>,
    #[serde(default)]
    data_dir: Option<String>,
    #[serde(default)]
    spool_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let cpus = available_cpus();
        let worker_count = env_u64("INGEST_WORKER_COUNT", Some(default_worker_count(cpus) as u64))?
            .max(1) as usize;
        let file_queue_size = env_u64("INGEST_FILE_QUEUE_SIZE", Some(1000))?.max(1) as usize;
        let worker_timeout =
            Duration::from_secs(env_u64("INGEST_WORKER_TIMEOUT_SECS", Some(30 * 60))?);
        let file_timeout = Duration::from_secs(env_u64("INGEST_FILE_TIMEOUT_SECS", Some(10 * 60))?);
        let batch_size_bytes =
            env_u64("INGEST_BATCH_SIZE_BYTES", Some(32 * 1024 * 1024))?.max(1) as usize;
        let batch_size_records = env_u64("INGEST_BATCH_SIZE_RECORDS", Some(16_000))?.max(1) as usize;
        let batch_timeout = Duration::from_millis(env_u64("INGEST_BATCH_TIMEOUT_MS", Some(50))?);
        let max_retries = env_u64("INGEST_MAX_RETRIES", Some(3))? as u32;
        let retry_delay = Duration::from_millis(env_u64("INGEST_RETRY_DELAY_MS", Some(250))?);

        let broker_url = env_string("INGEST_BROKER_URL", Some(DEFAULT_BROKER_URL.to_string()))?;
        let (host, port) = parse_broker_url(&broker_url)?;
        let broker = BrokerConfig {
            host,
            port,
            username: env_optional("INGEST_BROKER_USERNAME"),
            password: env_optional("INGEST_BROKER_PASSWORD"),
            client_id_prefix: env_string(
                "INGEST_CLIENT_ID",
                Some(format!("telemetry-ingest-{}", std::process::id())),
            )?,
            topic_prefix: env_string("INGEST_TOPIC_PREFIX", Some("telemetry".to_string()))?,
            keep_alive: Duration::from_secs(env_u64("INGEST_KEEPALIVE_SECS", Some(30))?),
            connect_timeout: Duration::from_secs(env_u64("INGEST_CONNECT_TIMEOUT_SECS", Some(5))?),
            max_packet_size: env_u64("INGEST_MAX_PACKET_BYTES", Some(256 * 1024 * 1024))? as usize,
        };
        let broker_pool_size =
            env_u64("INGEST_BROKER_POOL_SIZE", Some(worker_count as u64))?.max(1) as usize;
        let async_queue_depth = env_u64("INGEST_ASYNC_QUEUE_DEPTH", Some(20))?.max(1) as usize;
        let bulk_append = env_optional("INGEST_BULK_APPEND")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let file_age_threshold =
            Duration::from_secs(env_u64("INGEST_FILE_AGE_THRESHOLD_SECS", Some(30))?);
        let data_dir = match env::args().nth(1).filter(|arg| !arg.trim().is_empty()) {
            Some(arg) => PathBuf::from(arg),
            None => PathBuf::from(env_string("INGEST_DATA_DIR", Some("./ibt_files/".to_string()))?),
        };
        let spool_dir = PathBuf::from(env_string("INGEST_SPOOL_DIR", Some("./spool".to_string()))?);
        let runtime_threads = env_u64("INGEST_RUNTIME_THREADS", Some(cpus as u64))?.max(1) as usize;
        let status_socket = env_optional("INGEST_STATUS_SOCKET");
        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            worker_count,
            file_queue_size,
            worker_timeout,
            file_timeout,
            batch_size_bytes,
            batch_size_records,
            batch_timeout,
            max_retries,
            retry_delay,
            broker,
            broker_pool_size,
            async_queue_depth,
            bulk_append,
            file_age_threshold,
            data_dir,
            spool_dir,
            runtime_threads,
            status_socket,
            otlp_endpoint,
        };

        if let Some(overrides) = load_overrides() {
            apply_overrides(&mut config, &overrides, |key| env_optional(key).is_none())?;
        }

        Ok(config)
    }

    /// Deadline for a single processing attempt of one file.
    pub fn attempt_deadline(&self) -> Duration {
        self.worker_timeout.min(self.file_timeout)
    }
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn default_worker_count(cpus: usize) -> usize {
    (cpus + cpus / 4).max(4)
}

pub fn parse_broker_url(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw).with_context(|| format!("invalid broker url {raw}"))?;
    match url.scheme() {
        "mqtt" | "tcp" => {}
        other => return Err(anyhow!("unsupported broker url scheme {other}")),
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("broker url missing host"))?
        .to_string();
    let port = url.port().unwrap_or(1883);
    Ok((host, port))
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = env_optional("INGEST_CONFIG_PATH").map(PathBuf::from)?;
    let contents = match std::fs::read(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read ingest config overrides; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents;
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse ingest config overrides; using env defaults"
            );
            None
        }
    }
}

fn apply_overrides(
    config: &mut Config,
    overrides: &ConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) -> Result<()> {
    if env_allows("INGEST_WORKER_COUNT") {
        if let Some(value) = overrides.worker_count.filter(|v| *v != 0) {
            config.worker_count = value;
        }
    }
    if env_allows("INGEST_FILE_QUEUE_SIZE") {
        if let Some(value) = overrides.file_queue_size.filter(|v| *v != 0) {
            config.file_queue_size = value;
        }
    }
    if env_allows("INGEST_BATCH_SIZE_RECORDS") {
        if let Some(value) = overrides.batch_size_records.filter(|v| *v != 0) {
            config.batch_size_records = value;
        }
    }
    if env_allows("INGEST_BATCH_SIZE_BYTES") {
        if let Some(value) = overrides.batch_size_bytes.filter(|v| *v != 0) {
            config.batch_size_bytes = value;
        }
    }
    if env_allows("INGEST_BROKER_URL") {
        if let Some(url) = overrides
            .broker_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            let (host, port) = parse_broker_url(url)?;
            config.broker.host = host;
            config.broker.port = port;
        }
    }
    if env_allows("INGEST_BROKER_POOL_SIZE") {
        if let Some(value) = overrides.broker_pool_size.filter(|v| *v != 0) {
            config.broker_pool_size = value;
        }
    }
    if env_allows("INGEST_DATA_DIR") {
        if let Some(dir) = overrides
            .data_dir
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.data_dir = PathBuf::from(dir);
        }
    }
    if env_allows("INGEST_SPOOL_DIR") {
        if let Some(dir) = overrides
            .spool_dir
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.spool_dir = PathBuf::from(dir);
        }
    }
    Ok(())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    #[test]
    fn default_worker_count_scales_with_cpus() {
        assert_eq!(default_worker_count(1), 4);
        assert_eq!(default_worker_count(8), 10);
        assert_eq!(default_worker_count(16), 20);
    }

    #[test]
    fn parse_broker_url_defaults_port() {
        let (host, port) = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);

        let (_, port) = parse_broker_url("tcp://10.0.0.2:2883").unwrap();
        assert_eq!(port, 2883);

        assert!(parse_broker_url("amqp://guest@localhost:5672").is_err());
    }

    #[test]
    fn overrides_only_apply_where_env_is_unset() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        let mut bytes = br#"{"worker_count": 12, "batch_size_records": 500, "broker_url": "mqtt://other:1999"}"#.to_vec();
        let overrides: ConfigOverrides = simd_json::serde::from_slice(&mut bytes).unwrap();

        apply_overrides(&mut config, &overrides, |key| key != "INGEST_WORKER_COUNT").unwrap();

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.batch_size_records, 500);
        assert_eq!(config.broker.host, "other");
        assert_eq!(config.broker.port, 1999);
    }

    #[test]
    fn topic_uses_ticks_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.broker.topic_prefix = "sim/".to_string();
        assert_eq!(config.broker.topic(), "sim/ticks");
    }
}
