//! Sink configuration.
//!
//! [Settings] is the user facing configuration object, keyed the same way as the connector's
//! documented config (`elasticSearchUrl`, `indexName`, `bulkActions`, ...). It is validated and
//! converted once into the typed [SinkConfig] that the rest of the crate consumes.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use numaflow_elasticsearch::{ElasticsearchAuth, IndexSettings};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::info;

use crate::Result;
use crate::error::Error;

const ENV_ES_SINK_CONFIG_OBJECT: &str = "ES_SINK_CONFIG_OBJECT";
const ENV_ES_SINK_CONFIG_PATH: &str = "ES_SINK_CONFIG_PATH";

const DEFAULT_INDEX_NUMBER_OF_SHARDS: i64 = 1;
const DEFAULT_INDEX_NUMBER_OF_REPLICAS: i64 = 1;
const DEFAULT_MODE: &str = "single";
const DEFAULT_BULK_CONCURRENT_REQUESTS: i64 = 0;
const DEFAULT_BULK_ACTIONS: i64 = 500;
const DEFAULT_BULK_SIZE_IN_MB: i64 = 4;
const DEFAULT_BULK_FLUSH_INTERVAL_IN_MS: i64 = 2000;
const DEFAULT_BULK_BACKOFF_INTERVAL_IN_MS: i64 = 1000;
const DEFAULT_BULK_BACKOFF_RETRIES: i64 = 3;
const DEFAULT_BULK_BACKOFF_JITTER: f64 = 0.0;
const DEFAULT_BULK_AWAIT_CLOSE_IN_MS: i64 = 3000;
const DEFAULT_REQUEST_TIMEOUT_IN_MS: i64 = 30_000;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Processing mode of the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One write per record, acknowledged before `process` returns.
    Single,
    /// Records are buffered and written with the bulk API.
    Bulk,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Mode::Single),
            "bulk" => Ok(Mode::Bulk),
            _ => Err(Error::Config(format!(
                "Invalid Mode [{s}]. Must be [single,bulk]."
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Single => write!(f, "single"),
            Mode::Bulk => write!(f, "bulk"),
        }
    }
}

/// User facing settings. Unknown keys are ignored, missing keys take their defaults.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub elastic_search_url: String,
    pub index_name: String,
    pub index_number_of_shards: i64,
    pub index_number_of_replicas: i64,
    pub username: String,
    pub password: String,
    pub mode: String,
    pub bulk_concurrent_requests: i64,
    pub bulk_actions: i64,
    /// in MB
    pub bulk_size: i64,
    /// in milliseconds
    pub bulk_flush_interval: i64,
    /// in milliseconds
    pub bulk_backoff_interval: i64,
    pub bulk_backoff_retries: i64,
    pub bulk_backoff_jitter: f64,
    /// in milliseconds
    pub bulk_await_close: i64,
    /// in milliseconds
    pub request_timeout: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            elastic_search_url: String::new(),
            index_name: String::new(),
            index_number_of_shards: DEFAULT_INDEX_NUMBER_OF_SHARDS,
            index_number_of_replicas: DEFAULT_INDEX_NUMBER_OF_REPLICAS,
            username: String::new(),
            password: String::new(),
            mode: DEFAULT_MODE.to_string(),
            bulk_concurrent_requests: DEFAULT_BULK_CONCURRENT_REQUESTS,
            bulk_actions: DEFAULT_BULK_ACTIONS,
            bulk_size: DEFAULT_BULK_SIZE_IN_MB,
            bulk_flush_interval: DEFAULT_BULK_FLUSH_INTERVAL_IN_MS,
            bulk_backoff_interval: DEFAULT_BULK_BACKOFF_INTERVAL_IN_MS,
            bulk_backoff_retries: DEFAULT_BULK_BACKOFF_RETRIES,
            bulk_backoff_jitter: DEFAULT_BULK_BACKOFF_JITTER,
            bulk_await_close: DEFAULT_BULK_AWAIT_CLOSE_IN_MS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_IN_MS,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("elastic_search_url", &self.elastic_search_url)
            .field("index_name", &self.index_name)
            .field("index_number_of_shards", &self.index_number_of_shards)
            .field("index_number_of_replicas", &self.index_number_of_replicas)
            .field("username", &self.username)
            .field("password", &"****")
            .field("mode", &self.mode)
            .field("bulk_concurrent_requests", &self.bulk_concurrent_requests)
            .field("bulk_actions", &self.bulk_actions)
            .field("bulk_size", &self.bulk_size)
            .field("bulk_flush_interval", &self.bulk_flush_interval)
            .field("bulk_backoff_interval", &self.bulk_backoff_interval)
            .field("bulk_backoff_retries", &self.bulk_backoff_retries)
            .field("bulk_backoff_jitter", &self.bulk_backoff_jitter)
            .field("bulk_await_close", &self.bulk_await_close)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Settings {
    /// Loads settings from a generic key/value map, e.g. the config map handed over by the host.
    pub fn from_map(map: HashMap<String, serde_json::Value>) -> Result<Self> {
        let object = serde_json::Value::Object(map.into_iter().collect());
        serde_json::from_value(object).map_err(|e| Error::Config(format!("parsing settings: {e}")))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Config(format!("parsing settings: {e}")))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            Error::Config(format!("reading settings file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Loads settings from the environment. A base64 encoded JSON object in
    /// `ES_SINK_CONFIG_OBJECT` takes precedence over a JSON file named by `ES_SINK_CONFIG_PATH`.
    pub fn from_env() -> Result<Self> {
        if let Ok(encoded) = env::var(ENV_ES_SINK_CONFIG_OBJECT) {
            let decoded = BASE64_STANDARD
                .decode(encoded.trim().as_bytes())
                .map_err(|e| Error::Config(format!("decoding {ENV_ES_SINK_CONFIG_OBJECT}: {e}")))?;
            return Self::from_json(&decoded);
        }

        match env::var(ENV_ES_SINK_CONFIG_PATH) {
            Ok(path) => {
                info!(%path, "Loading settings from file");
                Self::from_file(path)
            }
            Err(_) => Err(Error::Config(format!(
                "neither {ENV_ES_SINK_CONFIG_OBJECT} nor {ENV_ES_SINK_CONFIG_PATH} is set"
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.elastic_search_url.is_empty() || self.index_name.is_empty() {
            return Err(Error::Config("Required property not set.".to_string()));
        }

        if self.username.is_empty() != self.password.is_empty() {
            return Err(Error::Config(
                "Values for both Username & password are required.".to_string(),
            ));
        }

        if self.index_number_of_shards < 1 {
            return Err(Error::Config(
                "indexNumberOfShards must be a strictly positive integer".to_string(),
            ));
        }

        if self.index_number_of_replicas < 0 {
            return Err(Error::Config(
                "indexNumberOfReplicas must be a positive integer".to_string(),
            ));
        }

        bounded::<u32>("indexNumberOfShards", self.index_number_of_shards)?;
        bounded::<u32>("indexNumberOfReplicas", self.index_number_of_replicas)?;

        if self.request_timeout <= 0 {
            return Err(Error::Config(
                "requestTimeout must be a strictly positive integer".to_string(),
            ));
        }

        let mode: Mode = self.mode.parse()?;
        if mode == Mode::Bulk {
            let non_negative = [
                ("bulkConcurrentRequests", self.bulk_concurrent_requests),
                ("bulkBackoffInterval", self.bulk_backoff_interval),
                ("bulkBackoffRetries", self.bulk_backoff_retries),
                ("bulkAwaitClose", self.bulk_await_close),
            ];
            for (name, value) in non_negative {
                if value < 0 {
                    return Err(Error::Config(format!(
                        "{name} must be a positive integer, got {value}"
                    )));
                }
            }

            let slots = bounded::<usize>("bulkConcurrentRequests", self.bulk_concurrent_requests)?;
            if slots > Semaphore::MAX_PERMITS {
                return Err(Error::Config(format!(
                    "bulkConcurrentRequests must not exceed {}",
                    Semaphore::MAX_PERMITS
                )));
            }

            if self.bulk_backoff_retries > i64::from(u16::MAX) {
                return Err(Error::Config(format!(
                    "bulkBackoffRetries must not exceed {}",
                    u16::MAX
                )));
            }

            if !(0.0..=1.0).contains(&self.bulk_backoff_jitter) {
                return Err(Error::Config(
                    "bulkBackoffJitter must be between 0.0 and 1.0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Backoff applied to a bulk call that failed as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_interval: Duration,
    pub max_retries: u16,
    pub jitter: f64,
}

/// Bulk mode knobs. A `None` threshold never triggers a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkConfig {
    pub max_actions: Option<usize>,
    pub max_bytes: Option<usize>,
    pub flush_interval: Option<Duration>,
    /// 0 runs every flush inline in the caller that triggered it.
    pub concurrent_requests: usize,
    pub backoff: BackoffConfig,
    pub await_close: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModeConfig {
    Single,
    Bulk(BulkConfig),
}

/// Validated, immutable sink configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub url: String,
    pub index: Arc<str>,
    pub auth: Option<ElasticsearchAuth>,
    pub index_settings: IndexSettings,
    pub request_timeout: Duration,
    pub mode: ModeConfig,
}

fn bounded<T: TryFrom<i64>>(name: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::Config(format!("{name} is out of range, got {value}")))
}

fn positive_or_none(value: i64) -> Option<usize> {
    (value > 0).then_some(value as usize)
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

impl TryFrom<Settings> for SinkConfig {
    type Error = Error;

    fn try_from(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let auth = (!settings.username.is_empty()).then(|| ElasticsearchAuth::Basic {
            username: settings.username.clone(),
            password: settings.password.clone(),
        });

        let mode = match settings.mode.parse::<Mode>()? {
            Mode::Single => ModeConfig::Single,
            Mode::Bulk => ModeConfig::Bulk(BulkConfig {
                max_actions: positive_or_none(settings.bulk_actions),
                max_bytes: positive_or_none(settings.bulk_size)
                    .map(|mb| mb.saturating_mul(BYTES_PER_MB)),
                flush_interval: (settings.bulk_flush_interval > 0)
                    .then(|| millis(settings.bulk_flush_interval)),
                concurrent_requests: bounded(
                    "bulkConcurrentRequests",
                    settings.bulk_concurrent_requests,
                )?,
                backoff: BackoffConfig {
                    base_interval: millis(settings.bulk_backoff_interval),
                    max_retries: bounded("bulkBackoffRetries", settings.bulk_backoff_retries)?,
                    jitter: settings.bulk_backoff_jitter,
                },
                await_close: millis(settings.bulk_await_close),
            }),
        };

        Ok(SinkConfig {
            url: settings.elastic_search_url,
            index: Arc::from(settings.index_name),
            auth,
            index_settings: IndexSettings {
                number_of_shards: bounded("indexNumberOfShards", settings.index_number_of_shards)?,
                number_of_replicas: bounded(
                    "indexNumberOfReplicas",
                    settings.index_number_of_replicas,
                )?,
            },
            request_timeout: millis(settings.request_timeout),
            mode,
        })
    }
}

impl SinkConfig {
    pub fn client_config(&self) -> numaflow_elasticsearch::Config {
        numaflow_elasticsearch::Config {
            url: self.url.clone(),
            auth: self.auth.clone(),
            request_timeout: self.request_timeout,
        }
    }
}
