//! Elasticsearch REST client used by the Elasticsearch sink.
//!
//! Only the handful of endpoints the sink needs are covered: single document writes
//! (`POST /{index}/_doc`), bulk writes (`POST /_bulk`) and index provisioning
//! (`HEAD /{index}`, `PUT /{index}`). The client knows nothing about records, acks or batching.

use std::time::Duration;

pub mod bulk;
pub mod client;

pub use bulk::{BulkItem, BulkItemResult, BulkResponse, ErrorCause, single_line_source};
pub use client::{CreateIndexResponse, DocWriteResult, ElasticsearchClient, IndexResponse};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP Error - {0}")]
    Http(#[from] reqwest::Error),

    #[error("Elasticsearch responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Invalid document - {0}")]
    InvalidDocument(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(value)
    }
}

#[derive(Clone, PartialEq)]
pub enum ElasticsearchAuth {
    Basic { username: String, password: String },
}

impl std::fmt::Debug for ElasticsearchAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElasticsearchAuth::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username}, password: **** }}")
            }
        }
    }
}

/// Configuration for creating an [ElasticsearchClient].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Base URL of the cluster, e.g. `http://localhost:9200`.
    pub url: String,
    /// Credentials sent with every request.
    pub auth: Option<ElasticsearchAuth>,
    /// Timeout of a single round trip.
    pub request_timeout: Duration,
}

/// Settings applied when the target index has to be created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_debug_masks_password() {
        let auth = ElasticsearchAuth::Basic {
            username: "elastic".to_string(),
            password: "changeme".to_string(),
        };
        let printed = format!("{auth:?}");
        assert!(printed.contains("elastic"));
        assert!(!printed.contains("changeme"));
    }

    #[test]
    fn test_decode_error_from_serde() {
        let err: Error = serde_json::from_str::<u64>("not-a-number")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Decode(_)));
    }
}
