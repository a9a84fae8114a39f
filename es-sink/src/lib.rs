//! Elasticsearch sink.
//!
//! Every record handed to the sink is written as a document to one index and then acknowledged
//! or failed back to its source, exactly once. Two modes are supported:
//! - single: one write per record, resolved before `write` returns.
//! - bulk: records are buffered and flushed with the bulk API once a count, size or age
//!   threshold is reached. The number of flushes in flight is bounded and failed bulk calls are
//!   retried with exponential backoff.

mod error;
pub use crate::error::{Error, Result};

mod backoff;
pub mod config;
pub mod engine;
pub mod metrics;
mod processor;
pub mod record;
pub mod sink;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::config::{Mode, Settings, SinkConfig};
pub use crate::engine::ProcessingEngine;
pub use crate::metrics::SinkMetrics;
pub use crate::record::{Document, ReadAck, Record, RecordRequest, SourceRecord};
pub use crate::sink::ElasticSearchSink;
pub use crate::writer::{BatchOutcome, OutcomeStatus, RemoteWriter, WriteOutcome};
