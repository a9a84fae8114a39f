use std::sync::Arc;

use tracing::info;

use crate::Result;
use crate::config::{Mode, Settings, SinkConfig};
use crate::metrics::SinkMetrics;
use crate::processor::Processor;
use crate::record::{Record, RecordRequest};
use crate::writer::RemoteWriter;

/// Routes every record to the processor selected at open. Safe to share between tasks, all
/// operations take `&self`.
pub struct ProcessingEngine<W> {
    index: Arc<str>,
    processor: Processor<W>,
}

impl<W> ProcessingEngine<W>
where
    W: RemoteWriter + Sync + 'static,
{
    /// Validates `settings` and builds the processor of the configured mode.
    pub fn open(settings: Settings, writer: W, metrics: SinkMetrics) -> Result<Self> {
        let config = SinkConfig::try_from(settings)?;
        Ok(Self::with_config(&config, writer, metrics))
    }

    pub fn with_config(config: &SinkConfig, writer: W, metrics: SinkMetrics) -> Self {
        let processor = Processor::new(&config.mode, writer, metrics);
        info!(index = %config.index, mode = %processor.mode(), "Opened processing engine");
        Self {
            index: Arc::clone(&config.index),
            processor,
        }
    }

    pub fn mode(&self) -> Mode {
        self.processor.mode()
    }

    /// Hands `record` to the active processor. The outcome reaches the record through its `ack`
    /// or `fail`, never as an error of this call.
    pub async fn process(&self, record: Box<dyn Record>) {
        let payload = record.value().clone();
        let request = RecordRequest::new(Arc::clone(&self.index), payload, record);
        self.processor.process(request).await;
    }

    pub async fn close(&self) -> Result<()> {
        info!(mode = %self.mode(), "Closing processing engine");
        self.processor.close().await
    }
}
