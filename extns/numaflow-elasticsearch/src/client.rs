use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::bulk::{self, BulkResponse};
use crate::{Config, ElasticsearchAuth, Error, IndexSettings, Result};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Outcome of a document write as reported by the `result` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocWriteResult {
    Created,
    Updated,
    Deleted,
    NotFound,
    Noop,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for DocWriteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocWriteResult::Created => "created",
            DocWriteResult::Updated => "updated",
            DocWriteResult::Deleted => "deleted",
            DocWriteResult::NotFound => "not_found",
            DocWriteResult::Noop => "noop",
            DocWriteResult::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Response of `POST /{index}/_doc`.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexResponse {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    pub result: DocWriteResult,
}

/// Response of `PUT /{index}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateIndexResponse {
    pub acknowledged: bool,
    #[serde(default)]
    pub shards_acknowledged: bool,
}

/// Thin async client over the Elasticsearch REST API. It is cheap to clone.
#[derive(Clone)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Option<ElasticsearchAuth>,
}

impl ElasticsearchClient {
    pub fn new(config: Config) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::Other(format!("Invalid Elasticsearch URL {}: {e}", config.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Other(format!(
                "Elasticsearch URL {} cannot be used as a base URL",
                config.url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        if config.auth.is_none() {
            info!("No authentication mechanism specified for Elasticsearch");
        }

        Ok(Self {
            http,
            base_url,
            auth: config.auth,
        })
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Other(format!("Invalid base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);

        let builder = self.http.request(method, url);
        Ok(match &self.auth {
            Some(ElasticsearchAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        })
    }

    /// Indexes a single JSON document into `index`, letting the cluster assign the id.
    pub async fn index(&self, index: &str, source: Bytes) -> Result<IndexResponse> {
        let response = self
            .request(Method::POST, &[index, "_doc"])?
            .header(CONTENT_TYPE, "application/json")
            .body(source)
            .send()
            .await?;
        decode(response).await
    }

    /// Sends all `(index, source)` pairs as one bulk request. The items of the returned response
    /// are in the order of `documents`.
    pub async fn bulk<'a, I>(&self, documents: I) -> Result<BulkResponse>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let body = bulk::encode_body(documents)?;
        let response = self
            .request(Method::POST, &["_bulk"])?
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self.request(Method::HEAD, &[index])?.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::Status {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    pub async fn create_index(
        &self,
        index: &str,
        settings: IndexSettings,
    ) -> Result<CreateIndexResponse> {
        let body = json!({
            "settings": {
                "index.number_of_shards": settings.number_of_shards,
                "index.number_of_replicas": settings.number_of_replicas,
            }
        });
        let response = self
            .request(Method::PUT, &[index])?
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    /// Creates `index` with `settings` unless it already exists.
    pub async fn ensure_index(&self, index: &str, settings: IndexSettings) -> Result<()> {
        if self.index_exists(index).await? {
            return Ok(());
        }

        let created = self.create_index(index, settings).await?;
        if !created.acknowledged || !created.shards_acknowledged {
            return Err(Error::Other(format!("Unable to create index {index}")));
        }
        info!(index, ?settings, "Created index");
        Ok(())
    }
}

async fn decode<T>(response: reqwest::Response) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(Error::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(serde_json::from_slice(&body)?)
}
