use crate::ingest::{ReconnectPolicy, RetryBudget, WriteMode};
use anyhow::{bail, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/seismic.json";
const DEFAULT_LOG_FILE: &str = "logs/seismic_ingest.log";
const DEFAULT_SERVER: &str = "rtserve.iris.washington.edu:18000";
const DEFAULT_STREAMS: [[&str; 3]; 5] = [
    ["IU", "INCN", "BHZ"],
    ["IU", "ANMO", "BHZ"],
    ["CI", "SVD", "EHZ"],
    ["IU", "HRV", "BHZ"],
    ["II", "PFO", "BHZ"],
];

/// Raw selector entries as configured. They are validated by the stream
/// session so that malformed entries are logged and skipped there.
pub type SelectorParts = Vec<String>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    store_host: Option<String>,
    #[serde(default)]
    store_port: Option<u16>,
    #[serde(default)]
    store_database: Option<String>,
    #[serde(default)]
    store_user: Option<String>,
    #[serde(default)]
    store_password: Option<String>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    streams: Option<Vec<SelectorParts>>,
    #[serde(default)]
    feeds: Option<Vec<FeedOverride>>,
    #[serde(default)]
    pool_min: Option<u32>,
    #[serde(default)]
    pool_max: Option<u32>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_base_delay_secs: Option<u64>,
    #[serde(default)]
    retry_reset_on_streaming: Option<bool>,
    #[serde(default)]
    write_mode: Option<String>,
    #[serde(default)]
    recreate_table: Option<bool>,
    #[serde(default)]
    log_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FeedOverride {
    server: String,
    #[serde(default)]
    streams: Vec<SelectorParts>,
}

fn setup_config_path(env: &EnvSource<'_>) -> PathBuf {
    env.string("SEISMIC_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "seismic-ingest failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "seismic-ingest failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Environment lookup with blank values treated as unset.
struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvSource<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|value| value.parse::<T>().ok())
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.string(key).and_then(|value| parse_flag(&value))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub acquire_timeout_secs: u64,
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Connection target for logs; never includes credentials.
    pub fn display_target(&self) -> String {
        match &self.database_url {
            Some(_) => "database url".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeedEndpoint {
    pub server: String,
    pub streams: Vec<SelectorParts>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreConfig,
    pub feeds: Vec<FeedEndpoint>,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_reset_on_streaming: bool,
    pub write_mode: WriteMode,
    pub recreate_table: bool,
    pub connect_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
    pub progress_every: u64,
    pub log_file: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| std::env::var(key).ok();
        let env = EnvSource { lookup: &lookup };
        let overrides = load_setup_config_overrides(&setup_config_path(&env));
        Self::from_sources(&lookup, overrides.unwrap_or_default())
    }

    fn from_sources(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Result<Self> {
        let env = EnvSource { lookup };

        let database_url = env
            .string("SEISMIC_DATABASE_URL")
            .or_else(|| env.string("DATABASE_URL"))
            .or_else(|| non_blank(overrides.database_url.as_deref()))
            .map(normalize_database_url);

        let pool_max = env
            .parse::<u32>("SEISMIC_DB_POOL_MAX")
            .or(overrides.pool_max)
            .unwrap_or(10)
            .max(1);
        let pool_min = env
            .parse::<u32>("SEISMIC_DB_POOL_MIN")
            .or(overrides.pool_min)
            .unwrap_or(1)
            .min(pool_max);

        let store = StoreConfig {
            database_url,
            host: env
                .string("QDB_PG_HOST")
                .or_else(|| non_blank(overrides.store_host.as_deref()))
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env
                .parse::<u16>("QDB_PG_PORT")
                .or(overrides.store_port.filter(|port| *port != 0))
                .unwrap_or(8812),
            database: env
                .string("QDB_PG_NAME")
                .or_else(|| non_blank(overrides.store_database.as_deref()))
                .unwrap_or_else(|| "qdb".to_string()),
            user: env
                .string("QDB_PG_USER")
                .or_else(|| non_blank(overrides.store_user.as_deref()))
                .unwrap_or_else(|| "admin".to_string()),
            password: env
                .string("QDB_PG_PASSWORD")
                .or_else(|| overrides.store_password.clone())
                .unwrap_or_else(|| "quest".to_string()),
            pool_min,
            pool_max,
            acquire_timeout_secs: env
                .parse::<u64>("SEISMIC_DB_ACQUIRE_TIMEOUT_SECS")
                .unwrap_or(8),
        };

        let feeds = resolve_feeds(&env, &overrides);
        if feeds.is_empty() {
            bail!("no feed endpoints configured");
        }

        let write_mode = match env
            .string("SEISMIC_WRITE_MODE")
            .or_else(|| non_blank(overrides.write_mode.as_deref()))
        {
            Some(raw) => raw.parse::<WriteMode>()?,
            None => WriteMode::PerSample,
        };

        let log_file = match env
            .string("SEISMIC_LOG_FILE")
            .or_else(|| overrides.log_file.clone())
        {
            Some(path) if path.trim().is_empty() || path.trim() == "-" => None,
            Some(path) => Some(PathBuf::from(path.trim())),
            None if (lookup)("SEISMIC_LOG_FILE").is_some() => None,
            None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };

        Ok(Self {
            store,
            feeds,
            max_retries: env
                .parse::<u32>("SEISMIC_MAX_RETRIES")
                .or(overrides.max_retries)
                .unwrap_or(5)
                .max(1),
            retry_base_delay_secs: env
                .parse::<u64>("SEISMIC_RETRY_BASE_DELAY_SECS")
                .or(overrides.retry_base_delay_secs)
                .unwrap_or(5),
            retry_reset_on_streaming: env
                .flag("SEISMIC_RETRY_RESET_ON_STREAMING")
                .or(overrides.retry_reset_on_streaming)
                .unwrap_or(false),
            write_mode,
            recreate_table: env
                .flag("SEISMIC_RECREATE_TABLE")
                .or(overrides.recreate_table)
                .unwrap_or(true),
            connect_timeout_secs: env
                .parse::<u64>("SEISMIC_CONNECT_TIMEOUT_SECS")
                .unwrap_or(30)
                .max(1),
            shutdown_grace_ms: env
                .parse::<u64>("SEISMIC_SHUTDOWN_GRACE_MS")
                .unwrap_or(2000),
            progress_every: env
                .parse::<u64>("SEISMIC_PROGRESS_EVERY")
                .unwrap_or(500)
                .max(1),
            log_file,
            otlp_endpoint: env.string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            budget: if self.retry_reset_on_streaming {
                RetryBudget::ResetOnStreaming
            } else {
                RetryBudget::Lifetime
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn resolve_feeds(env: &EnvSource<'_>, overrides: &SetupConfigOverrides) -> Vec<FeedEndpoint> {
    let env_server = env.string("SEISMIC_SERVER");
    let env_streams = env.string("SEISMIC_STREAMS").map(|raw| parse_streams(&raw));

    if env_server.is_none() && env_streams.is_none() {
        if let Some(feeds) = overrides.feeds.as_ref().filter(|feeds| !feeds.is_empty()) {
            return feeds
                .iter()
                .filter_map(|feed| {
                    let server = non_blank(Some(feed.server.as_str()))?;
                    let streams = if feed.streams.is_empty() {
                        default_streams()
                    } else {
                        feed.streams.clone()
                    };
                    Some(FeedEndpoint { server, streams })
                })
                .collect();
        }
    }

    let server = env_server
        .or_else(|| non_blank(overrides.server.as_deref()))
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let streams = env_streams
        .or_else(|| overrides.streams.clone())
        .filter(|streams| !streams.is_empty())
        .unwrap_or_else(default_streams);
    vec![FeedEndpoint { server, streams }]
}

/// Parses `NET.STA.CHA,NET.STA.CHA`. Entries that do not have three parts
/// are kept as-is.
pub fn parse_streams(raw: &str) -> Vec<SelectorParts> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.split('.').map(|part| part.trim().to_string()).collect())
        .collect()
}

fn default_streams() -> Vec<SelectorParts> {
    DEFAULT_STREAMS
        .iter()
        .map(|parts| parts.iter().map(|part| part.to_string()).collect())
        .collect()
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
