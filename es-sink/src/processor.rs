//! The two ways of turning records into writes. Exactly one of them is active for the lifetime of
//! an engine.

use crate::Result;
use crate::config::{Mode, ModeConfig};
use crate::metrics::SinkMetrics;
use crate::record::RecordRequest;
use crate::writer::RemoteWriter;

pub(crate) mod accumulator;
pub(crate) mod bulk;
pub(crate) mod single;

use bulk::BulkProcessor;
use single::SingleProcessor;

pub(crate) enum Processor<W> {
    Single(SingleProcessor<W>),
    Bulk(BulkProcessor<W>),
}

impl<W> Processor<W>
where
    W: RemoteWriter + Sync + 'static,
{
    pub(crate) fn new(mode: &ModeConfig, writer: W, metrics: SinkMetrics) -> Self {
        match mode {
            ModeConfig::Single => Processor::Single(SingleProcessor::new(writer, metrics)),
            ModeConfig::Bulk(config) => {
                Processor::Bulk(BulkProcessor::new(config, writer, metrics))
            }
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        match self {
            Processor::Single(_) => Mode::Single,
            Processor::Bulk(_) => Mode::Bulk,
        }
    }

    pub(crate) async fn process(&self, request: RecordRequest) {
        match self {
            Processor::Single(processor) => processor.process(request).await,
            Processor::Bulk(processor) => processor.process(request).await,
        }
    }

    pub(crate) async fn close(&self) -> Result<()> {
        match self {
            Processor::Single(_) => Ok(()),
            Processor::Bulk(processor) => processor.close().await,
        }
    }
}
