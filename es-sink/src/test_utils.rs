//! Helpers shared by the unit tests: a scripted [RemoteWriter] and record constructors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Result;
use crate::error::Error;
use crate::record::{Document, ReadAck, RecordRequest, SourceRecord};
use crate::writer::{BatchOutcome, OutcomeStatus, RemoteWriter, WriteOutcome};

pub(crate) const TEST_INDEX: &str = "test-index";

pub(crate) fn record(sequence: u64) -> (Box<SourceRecord>, oneshot::Receiver<ReadAck>) {
    let (record, rx) = SourceRecord::new(
        Some(format!("key-{sequence}")),
        format!(r#"{{"seq":{sequence}}}"#),
        sequence,
    );
    (Box::new(record), rx)
}

pub(crate) fn request_with_payload(
    sequence: u64,
    payload: &str,
) -> (RecordRequest, oneshot::Receiver<ReadAck>) {
    let payload = Bytes::copy_from_slice(payload.as_bytes());
    let (record, rx) = SourceRecord::new(None, payload.clone(), sequence);
    (
        RecordRequest::new(Arc::from(TEST_INDEX), payload, Box::new(record)),
        rx,
    )
}

/// Scripted answer of [MockWriter::bulk_index].
#[derive(Debug, Clone)]
pub(crate) enum BulkReply {
    /// One `Success` per document.
    Success,
    Items(Vec<OutcomeStatus>),
    Error(Error),
    /// Never answers.
    Pending,
}

#[derive(Debug, Clone)]
pub(crate) struct BulkCall {
    pub(crate) at: Instant,
    pub(crate) documents: Vec<Document>,
}

#[derive(Default)]
struct MockState {
    index_replies: Mutex<VecDeque<Result<WriteOutcome>>>,
    bulk_replies: Mutex<VecDeque<BulkReply>>,
    index_calls: Mutex<Vec<Document>>,
    bulk_calls: Mutex<Vec<BulkCall>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A [RemoteWriter] answering from a script. Without a scripted reply, single writes are
/// `Created` and bulk writes succeed for every document. Clones share the script and the
/// recorded calls.
#[derive(Clone, Default)]
pub(crate) struct MockWriter {
    state: Arc<MockState>,
}

impl MockWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_index_reply(&self, reply: Result<WriteOutcome>) -> &Self {
        self.state.index_replies.lock().push_back(reply);
        self
    }

    pub(crate) fn push_bulk_reply(&self, reply: BulkReply) -> &Self {
        self.state.bulk_replies.lock().push_back(reply);
        self
    }

    /// Delay applied to every bulk call before it answers.
    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    pub(crate) fn index_calls(&self) -> Vec<Document> {
        self.state.index_calls.lock().clone()
    }

    pub(crate) fn bulk_calls(&self) -> Vec<BulkCall> {
        self.state.bulk_calls.lock().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteWriter for MockWriter {
    async fn index(&self, document: &Document) -> Result<WriteOutcome> {
        self.state.index_calls.lock().push(document.clone());
        let reply = self.state.index_replies.lock().pop_front();
        reply.unwrap_or(Ok(WriteOutcome::Created))
    }

    async fn bulk_index(&self, documents: &[Document]) -> Result<BatchOutcome> {
        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.state.in_flight);
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.state.bulk_calls.lock().push(BulkCall {
            at: Instant::now(),
            documents: documents.to_vec(),
        });

        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = self
            .state
            .bulk_replies
            .lock()
            .pop_front()
            .unwrap_or(BulkReply::Success);
        match reply {
            BulkReply::Success => Ok(BatchOutcome {
                items: vec![OutcomeStatus::Success; documents.len()],
                took: Duration::from_millis(1),
                ingest_took: None,
            }),
            BulkReply::Items(items) => Ok(BatchOutcome {
                items,
                took: Duration::from_millis(1),
                ingest_took: None,
            }),
            BulkReply::Error(e) => Err(e),
            BulkReply::Pending => std::future::pending().await,
        }
    }
}
