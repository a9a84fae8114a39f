//! Inbound records and the requests that pair them with an outbound document.
//!
//! The central contract: every [RecordRequest] resolves to exactly one of `ack` or `fail` on its
//! record. Resolution consumes the request, and a request that is dropped unresolved fails its
//! record on the way out.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use numaflow_elasticsearch::single_line_source;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// A record handed over by the host pipeline. `ack` and `fail` consume the record, so it can be
/// resolved at most once.
pub trait Record: Send + Sync + 'static {
    fn key(&self) -> Option<&str>;

    fn value(&self) -> &Bytes;

    /// Position of the record in its source, used for diagnostics.
    fn sequence(&self) -> u64;

    /// The record was persisted.
    fn ack(self: Box<Self>);

    /// The record could not be persisted, the source decides whether to redeliver it.
    fn fail(self: Box<Self>);
}

/// Outcome reported back to the source of a [SourceRecord].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAck {
    /// Record was successfully persisted.
    Ack,
    /// Record was not persisted and should be redelivered.
    Nak,
}

/// A [Record] whose outcome is delivered through a oneshot channel.
pub struct SourceRecord {
    key: Option<String>,
    value: Bytes,
    sequence: u64,
    ack_tx: oneshot::Sender<ReadAck>,
}

impl SourceRecord {
    pub fn new(
        key: Option<String>,
        value: impl Into<Bytes>,
        sequence: u64,
    ) -> (Self, oneshot::Receiver<ReadAck>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        (
            Self {
                key,
                value: value.into(),
                sequence,
                ack_tx,
            },
            ack_rx,
        )
    }

    fn resolve(self, outcome: ReadAck) {
        if self.ack_tx.send(outcome).is_err() {
            warn!(
                sequence = self.sequence,
                ?outcome,
                "Source is no longer waiting for the outcome"
            );
        }
    }
}

impl fmt::Debug for SourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRecord")
            .field("key", &self.key)
            .field("sequence", &self.sequence)
            .field("value_len", &self.value.len())
            .finish()
    }
}

impl Record for SourceRecord {
    fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn value(&self) -> &Bytes {
        &self.value
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn ack(self: Box<Self>) {
        self.resolve(ReadAck::Ack)
    }

    fn fail(self: Box<Self>) {
        self.resolve(ReadAck::Nak)
    }
}

/// A document to be written to `index`. Cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub index: Arc<str>,
    pub payload: Bytes,
}

impl Document {
    /// Size accounted against the bulk byte threshold.
    pub(crate) fn estimated_size(&self) -> usize {
        // action line overhead, e.g. {"index":{"_index":"..."}}\n plus the source line break
        const ACTION_OVERHEAD: usize = 50;
        self.payload.len() + self.index.len() + ACTION_OVERHEAD
    }
}

/// Pairs an outbound [Document] with the record it came from, so the write outcome can be routed
/// back to the source.
pub struct RecordRequest {
    document: Document,
    record: Option<Box<dyn Record>>,
}

impl RecordRequest {
    pub fn new(index: Arc<str>, payload: Bytes, record: Box<dyn Record>) -> Self {
        Self {
            document: Document { index, payload },
            record: Some(record),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn sequence(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.sequence())
    }

    /// Rewrites the payload as one line, so it takes exactly one entry of a bulk body.
    pub(crate) fn compact_payload(&mut self) -> Result<()> {
        let line = match single_line_source(&self.document.payload) {
            Ok(Cow::Borrowed(_)) => return Ok(()),
            Ok(Cow::Owned(line)) => line,
            Err(e) => return Err(Error::InvalidDocument(e.to_string())),
        };
        self.document.payload = Bytes::from(line);
        Ok(())
    }

    pub fn ack(mut self) {
        if let Some(record) = self.record.take() {
            record.ack();
        }
    }

    /// Fails the record. `reason` is only used for diagnostics.
    pub fn fail(mut self, reason: &str) {
        if let Some(record) = self.record.take() {
            warn!(
                index = %self.document.index,
                sequence = record.sequence(),
                reason,
                "Failing record"
            );
            record.fail();
        }
    }
}

impl fmt::Debug for RecordRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRequest")
            .field("index", &self.document.index)
            .field("sequence", &self.sequence())
            .field("payload_len", &self.document.payload.len())
            .finish()
    }
}

impl Drop for RecordRequest {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            error!(
                index = %self.document.index,
                sequence = record.sequence(),
                "Record request dropped without an outcome, failing the record"
            );
            record.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sequence: u64) -> (RecordRequest, oneshot::Receiver<ReadAck>) {
        let (record, rx) = SourceRecord::new(Some("k".to_string()), "{}", sequence);
        let req = RecordRequest::new(Arc::from("logs"), Bytes::from_static(b"{}"), Box::new(record));
        (req, rx)
    }

    #[tokio::test]
    async fn test_ack() {
        let (req, rx) = request(1);
        assert_eq!(req.sequence(), 1);
        req.ack();
        assert_eq!(rx.await.unwrap(), ReadAck::Ack);
    }

    #[tokio::test]
    async fn test_fail() {
        let (req, rx) = request(2);
        req.fail("rejected");
        assert_eq!(rx.await.unwrap(), ReadAck::Nak);
    }

    #[tokio::test]
    async fn test_drop_fails_record() {
        let (req, rx) = request(3);
        drop(req);
        assert_eq!(rx.await.unwrap(), ReadAck::Nak);
    }

    #[test]
    fn test_compact_payload() {
        let (record, _rx) = SourceRecord::new(None, "", 5);
        let mut req = RecordRequest::new(
            Arc::from("logs"),
            Bytes::from_static(b"{\n  \"a\": 1,\n  \"b\": [true]\n}\n"),
            Box::new(record),
        );
        req.compact_payload().unwrap();
        assert_eq!(req.document().payload.as_ref(), br#"{"a":1,"b":[true]}"#);

        let (record, _rx) = SourceRecord::new(None, "", 6);
        let mut req = RecordRequest::new(
            Arc::from("logs"),
            Bytes::from_static(b"{\"a\":1}\n{\"index\":{}}"),
            Box::new(record),
        );
        assert!(matches!(req.compact_payload(), Err(Error::InvalidDocument(_))));
        req.fail("invalid");
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let (req, rx) = request(4);
        drop(rx);
        // must not panic
        req.ack();
    }

    #[test]
    fn test_source_record_accessors() {
        let (record, _rx) = SourceRecord::new(None, Bytes::from_static(b"payload"), 9);
        assert_eq!(record.key(), None);
        assert_eq!(record.value().as_ref(), b"payload");
        assert_eq!(record.sequence(), 9);
    }

    #[test]
    fn test_estimated_size() {
        let doc = Document {
            index: Arc::from("logs"),
            payload: Bytes::from_static(b"0123456789"),
        };
        assert_eq!(doc.estimated_size(), 10 + 4 + 50);
    }
}
