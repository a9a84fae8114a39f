//! The outbound side of the sink: a writer that persists documents to the remote store.

use std::time::Duration;

use numaflow_elasticsearch::{DocWriteResult, ElasticsearchClient};

use crate::Result;
use crate::record::Document;

/// Result of a single document write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The document was created.
    Created,
    /// Any other well-formed answer of the store, e.g. `updated` or `noop`.
    Other(String),
}

/// Result of one item of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Success,
    Failure(String),
}

/// Result of a bulk write. `items[i]` is the outcome of the i-th document that was sent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchOutcome {
    pub items: Vec<OutcomeStatus>,
    pub took: Duration,
    pub ingest_took: Option<Duration>,
}

impl BatchOutcome {
    pub fn failures(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, OutcomeStatus::Failure(_)))
            .count()
    }
}

/// Writes documents to the remote store. An `Err` means the whole call failed (transport
/// failure); rejections of individual documents are reported inside the `Ok` value.
#[trait_variant::make(RemoteWriter: Send)]
#[allow(dead_code)]
pub trait LocalRemoteWriter {
    async fn index(&self, document: &Document) -> Result<WriteOutcome>;

    async fn bulk_index(&self, documents: &[Document]) -> Result<BatchOutcome>;
}

impl RemoteWriter for ElasticsearchClient {
    async fn index(&self, document: &Document) -> Result<WriteOutcome> {
        let response = ElasticsearchClient::index(
            self,
            &document.index,
            document.payload.clone(),
        )
        .await?;

        Ok(match response.result {
            DocWriteResult::Created => WriteOutcome::Created,
            other => WriteOutcome::Other(other.to_string()),
        })
    }

    async fn bulk_index(&self, documents: &[Document]) -> Result<BatchOutcome> {
        let response = self
            .bulk(
                documents
                    .iter()
                    .map(|doc| (doc.index.as_ref(), doc.payload.as_ref())),
            )
            .await?;

        let items = response
            .items
            .iter()
            .map(|item| {
                if item.is_failed() {
                    OutcomeStatus::Failure(item.failure_message())
                } else {
                    OutcomeStatus::Success
                }
            })
            .collect();

        Ok(BatchOutcome {
            items,
            took: Duration::from_millis(response.took),
            ingest_took: response.ingest_took.map(Duration::from_millis),
        })
    }
}
