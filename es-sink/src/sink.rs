//! The Elasticsearch sink as seen by the host pipeline: open once, write records, close.

use numaflow_elasticsearch::ElasticsearchClient;
use tracing::{debug, info};

use crate::Result;
use crate::config::{Mode, Settings, SinkConfig};
use crate::engine::ProcessingEngine;
use crate::error::Error;
use crate::metrics::SinkMetrics;
use crate::record::Record;

pub struct ElasticSearchSink {
    engine: ProcessingEngine<ElasticsearchClient>,
}

impl ElasticSearchSink {
    /// Validates `settings`, connects to the cluster and creates the target index when it does
    /// not exist yet.
    pub async fn open(settings: Settings, metrics: SinkMetrics) -> Result<Self> {
        let config = SinkConfig::try_from(settings)?;
        info!(url = %config.url, index = %config.index, "Opening Elasticsearch sink");

        let client = ElasticsearchClient::new(config.client_config())
            .map_err(|e| Error::Connection(format!("creating Elasticsearch client: {e}")))?;

        client
            .ensure_index(&config.index, config.index_settings)
            .await
            .map_err(|e| Error::Connection(format!("provisioning index {}: {e}", config.index)))?;

        Ok(Self {
            engine: ProcessingEngine::with_config(&config, client, metrics),
        })
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    /// Writes the value of `record` as a document. The outcome is reported through the record.
    pub async fn write(&self, record: Box<dyn Record>) {
        debug!(
            key = record.key().unwrap_or(""),
            sequence = record.sequence(),
            len = record.value().len(),
            "Writing record"
        );
        self.engine.process(record).await;
    }

    pub async fn close(&self) -> Result<()> {
        self.engine.close().await
    }
}
