use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
    pub questdb_url: Url,
    pub table: String,
    pub sender_pool_size: usize,
    pub auto_flush_rows: usize,
    pub request_timeout: Duration,
    pub health_socket: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let broker_url = env_string("WRITER_BROKER_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let (broker_host, broker_port) = parse_broker_url(&broker_url)?;
        let questdb_raw = env_string("WRITER_QUESTDB_URL", Some("http://127.0.0.1:9000".to_string()))?;
        let questdb_url =
            Url::parse(&questdb_raw).with_context(|| format!("invalid WRITER_QUESTDB_URL {questdb_raw}"))?;
        let table = env_string("WRITER_TABLE", Some("TelemetryTicks".to_string()))?;
        if table.is_empty() || table.contains(|c: char| c.is_whitespace() || c == ',') {
            return Err(anyhow!("invalid WRITER_TABLE {table:?}"));
        }

        Ok(Self {
            broker_host,
            broker_port,
            broker_username: env_optional("WRITER_BROKER_USERNAME"),
            broker_password: env_optional("WRITER_BROKER_PASSWORD"),
            // must stay stable across restarts for the persistent session
            client_id: env_string("WRITER_CLIENT_ID", Some("telemetry-writer".to_string()))?,
            topic_prefix: env_string("WRITER_TOPIC_PREFIX", Some("telemetry".to_string()))?,
            keep_alive: Duration::from_secs(env_u64("WRITER_KEEPALIVE_SECS", Some(30))?),
            max_packet_size: env_u64("WRITER_MAX_PACKET_BYTES", Some(256 * 1024 * 1024))? as usize,
            questdb_url,
            table,
            sender_pool_size: env_u64(
                "WRITER_SENDER_POOL_SIZE",
                Some(default_sender_pool_size(available_cpus()) as u64),
            )?
            .max(1) as usize,
            auto_flush_rows: env_u64("WRITER_AUTO_FLUSH_ROWS", Some(10_000))?.max(1) as usize,
            request_timeout: Duration::from_secs(env_u64("WRITER_REQUEST_TIMEOUT_SECS", Some(60))?),
            health_socket: env_optional("WRITER_HEALTH_SOCKET"),
        })
    }

    pub fn topic(&self) -> String {
        format!("{}/ticks", self.topic_prefix.trim_end_matches('/'))
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn default_sender_pool_size(cpus: usize) -> usize {
    (cpus * 2 + cpus / 2).min(50)
}

fn parse_broker_url(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw).with_context(|| format!("invalid WRITER_BROKER_URL {raw}"))?;
    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(anyhow!("unsupported broker url scheme {}", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("broker url missing host"))?
        .to_string();
    Ok((host, url.port().unwrap_or(1883)))
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
