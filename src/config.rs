use crate::broadcast::DEFAULT_SUBSCRIBER_QUEUE;
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::history::DEFAULT_MAX_HISTORY_LIMIT;
use crate::metric::MetricSet;
use crate::source::cloud::{CloudFeedSettings, DEFAULT_CLOUD_BASE_URL};
use crate::source::serial::{KeyMap, SerialSettings, DEFAULT_KEY_MAP};
use anyhow::{anyhow, bail, Context, Result};
use chrono::FixedOffset;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreDriver {
    Memory,
    Postgres(String),
}

#[derive(Clone, Debug)]
pub enum SourceConfig {
    Cloud(CloudFeedSettings),
    Serial(SerialSettings),
    /// Random values; `seed` fixes the sequence.
    Simulated { seed: Option<u64> },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreDriver,
    pub db_pool_size: u32,
    pub metrics: MetricSet,
    pub poll_interval_secs: u64,
    pub source: SourceConfig,
    pub http_bind: String,
    pub subscriber_queue: usize,
    pub history_max_limit: usize,
    pub local_utc_offset_minutes: Option<i32>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = get("RELAY_DATABASE_URL")
            .or_else(|| get("DATABASE_URL"))
            .context("RELAY_DATABASE_URL or DATABASE_URL is required (use `memory` for the in-process store)")?;
        let store = if database_url.eq_ignore_ascii_case("memory") {
            StoreDriver::Memory
        } else {
            StoreDriver::Postgres(normalize_database_url(database_url))
        };

        let metrics_raw = get("RELAY_METRICS")
            .or_else(|| get("ADAFRUIT_FEEDS"))
            .context("RELAY_METRICS (or ADAFRUIT_FEEDS) must list at least one metric")?;
        let metrics = MetricSet::new(metrics_raw.split(','));
        if metrics.is_empty() {
            bail!("RELAY_METRICS must list at least one metric");
        }

        let parse_u64 = |key: &str, fallback: Option<&str>, default: u64| -> Result<u64> {
            match get(key).or_else(|| fallback.and_then(|k| get(k))) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
                None => Ok(default),
            }
        };

        let db_pool_size = u32::try_from(parse_u64("RELAY_DB_POOL_SIZE", None, 10)?)
            .context("RELAY_DB_POOL_SIZE is too large")?;
        let poll_interval_secs =
            parse_u64("RELAY_POLL_INTERVAL_SECS", Some("ADAFRUIT_POLL_INTERVAL"), 3)?.max(1);

        let source = match get("RELAY_SOURCE").as_deref().unwrap_or("cloud") {
            "cloud" => SourceConfig::Cloud(CloudFeedSettings {
                base_url: get("RELAY_CLOUD_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_CLOUD_BASE_URL.to_string()),
                username: get("ADAFRUIT_USERNAME")
                    .context("ADAFRUIT_USERNAME is required for the cloud source")?,
                key: get("ADAFRUIT_KEY").context("ADAFRUIT_KEY is required for the cloud source")?,
                timeout: Duration::from_millis(parse_u64("RELAY_CLOUD_TIMEOUT_MS", None, 5000)?),
            }),
            "serial" => {
                let path = get("RELAY_SERIAL_PATH")
                    .context("RELAY_SERIAL_PATH is required for the serial source")?;
                let key_map = KeyMap::parse(
                    get("RELAY_SERIAL_KEY_MAP")
                        .as_deref()
                        .unwrap_or(DEFAULT_KEY_MAP),
                )
                .map_err(|err| anyhow!("RELAY_SERIAL_KEY_MAP: {err}"))?;
                let max_frame_len = parse_u64(
                    "RELAY_FRAME_MAX_BYTES",
                    None,
                    DEFAULT_MAX_FRAME_LEN as u64,
                )?;
                SourceConfig::Serial(SerialSettings {
                    path: PathBuf::from(path),
                    reconnect_delay: Duration::from_millis(parse_u64(
                        "RELAY_SERIAL_RECONNECT_MS",
                        None,
                        5000,
                    )?),
                    key_map,
                    max_frame_len: usize::try_from(max_frame_len)
                        .context("RELAY_FRAME_MAX_BYTES is too large")?,
                })
            }
            "simulated" => SourceConfig::Simulated {
                seed: get("RELAY_SIM_SEED")
                    .map(|raw| {
                        raw.parse::<u64>().with_context(|| {
                            format!("RELAY_SIM_SEED must be a non-negative integer, got {raw:?}")
                        })
                    })
                    .transpose()?,
            },
            other => bail!("RELAY_SOURCE must be `cloud`, `serial` or `simulated`, got {other:?}"),
        };

        let http_bind = get("RELAY_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8000".to_string());
        let subscriber_queue = parse_u64(
            "RELAY_SUBSCRIBER_QUEUE",
            None,
            DEFAULT_SUBSCRIBER_QUEUE as u64,
        )?
        .max(1) as usize;
        let history_max_limit = parse_u64(
            "RELAY_HISTORY_MAX_LIMIT",
            None,
            DEFAULT_MAX_HISTORY_LIMIT as u64,
        )?
        .max(1) as usize;

        let local_utc_offset_minutes = match get("RELAY_LOCAL_UTC_OFFSET_MINUTES") {
            Some(raw) => {
                let minutes = raw.parse::<i32>().with_context(|| {
                    format!("RELAY_LOCAL_UTC_OFFSET_MINUTES must be an integer, got {raw:?}")
                })?;
                if FixedOffset::east_opt(minutes.saturating_mul(60)).is_none() {
                    bail!("RELAY_LOCAL_UTC_OFFSET_MINUTES out of range: {minutes}");
                }
                Some(minutes)
            }
            None => None,
        };

        Ok(Self {
            store,
            db_pool_size,
            metrics,
            poll_interval_secs,
            source,
            http_bind,
            subscriber_queue,
            history_max_limit,
            local_utc_offset_minutes,
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn local_offset(&self) -> Option<FixedOffset> {
        self.local_utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
