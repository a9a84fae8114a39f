//! Bulk mode: requests are buffered by the [Accumulator] and every sealed buffer is flushed as one
//! bulk call. The outcome of the call is fanned out to the records by position.
//!
//! A flush needs a slot from a bounded pool before it starts. When no slot is free the call that
//! sealed the buffer waits, which is the only backpressure towards the source. A call that fails
//! as a whole is retried with exponential backoff, rejected items are never retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::backoff::ExponentialBackoff;
use crate::config::{BackoffConfig, BulkConfig};
use crate::error::Error;
use crate::metrics::SinkMetrics;
use crate::processor::accumulator::{Accumulator, Append, SealedBatch, Thresholds};
use crate::record::{Document, RecordRequest};
use crate::writer::{BatchOutcome, OutcomeStatus, RemoteWriter};

pub(crate) struct BulkProcessor<W> {
    inner: Arc<Inner<W>>,
}

struct Inner<W> {
    writer: W,
    accumulator: Accumulator,
    flush_interval: Option<Duration>,
    /// flush slots
    slots: Arc<Semaphore>,
    /// the caller that seals a buffer waits for its flush
    inline: bool,
    backoff: BackoffConfig,
    await_close: Duration,
    /// flush and timer tasks, and callers of `process`
    tracker: TaskTracker,
    /// abandons in-flight flushes once the drain timed out
    flush_cancel: CancellationToken,
    timer_cancel: CancellationToken,
    abandoned: AtomicUsize,
    metrics: SinkMetrics,
}

/// Keeps the in-flight gauge right on every exit path of a flush.
struct InflightGuard<'a>(&'a SinkMetrics);

impl<'a> InflightGuard<'a> {
    fn new(metrics: &'a SinkMetrics) -> Self {
        metrics.flush_started();
        Self(metrics)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.flush_finished();
    }
}

impl<W> BulkProcessor<W>
where
    W: RemoteWriter + Sync + 'static,
{
    pub(crate) fn new(config: &BulkConfig, writer: W, metrics: SinkMetrics) -> Self {
        let inline = config.concurrent_requests == 0;
        let slots = config.concurrent_requests.max(1);
        info!(
            max_actions = ?config.max_actions,
            max_bytes = ?config.max_bytes,
            flush_interval = ?config.flush_interval,
            slots,
            inline,
            "Starting bulk processor"
        );

        Self {
            inner: Arc::new(Inner {
                writer,
                accumulator: Accumulator::new(Thresholds {
                    max_actions: config.max_actions,
                    max_bytes: config.max_bytes,
                }),
                flush_interval: config.flush_interval,
                slots: Arc::new(Semaphore::new(slots)),
                inline,
                backoff: config.backoff.clone(),
                await_close: config.await_close,
                tracker: TaskTracker::new(),
                flush_cancel: CancellationToken::new(),
                timer_cancel: CancellationToken::new(),
                abandoned: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Buffers the request. Waits only when it sealed a buffer and no flush slot is free, or, in
    /// inline mode, until that flush is done.
    pub(crate) async fn process(&self, mut request: RecordRequest) {
        // close waits for a caller still queued for a flush slot
        let _in_progress = self.inner.tracker.token();

        // a payload that spans lines would shift every later item of the bulk response
        if let Err(e) = request.compact_payload() {
            warn!(sequence = request.sequence(), ?e, "Record cannot be bulk indexed");
            self.inner.metrics.record_fail(1);
            request.fail(&e.to_string());
            return;
        }

        match self.inner.accumulator.append(request) {
            Append::Buffered {
                start_timer: Some(generation),
            } => {
                if let Some(max_age) = self.inner.flush_interval {
                    self.inner
                        .start_timer(generation, Instant::now() + max_age);
                }
            }
            Append::Buffered { start_timer: None } => {}
            Append::Sealed(batch) => self.inner.dispatch(batch).await,
            Append::Rejected(request) => {
                self.inner.metrics.record_fail(1);
                request.fail("sink is closed");
            }
        }
    }

    /// Flushes what is still buffered and waits for every flush to finish, at most for the
    /// configured drain timeout. Flushes still running after that are cancelled and their records
    /// failed.
    pub(crate) async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.await_close;
        inner.timer_cancel.cancel();

        if let Some(batch) = inner.accumulator.close() {
            info!(id = batch.id, count = batch.requests.len(), "Flushing remaining buffer");
            match timeout_at(deadline, Arc::clone(&inner.slots).acquire_owned()).await {
                Ok(Ok(permit)) => {
                    let task_inner = Arc::clone(inner);
                    inner
                        .tracker
                        .spawn(async move { task_inner.flush(batch, permit).await });
                }
                _ => inner.abandon(batch.requests, &Error::Cancelled),
            }
        }

        inner.tracker.close();
        if timeout_at(deadline, inner.tracker.wait()).await.is_ok() {
            let abandoned = inner.abandoned.load(Ordering::SeqCst);
            if abandoned > 0 {
                return Err(Error::DrainTimeout { abandoned });
            }
            info!("All bulk flushes completed");
            return Ok(());
        }

        error!(
            await_close = ?inner.await_close,
            "Timed out waiting for bulk flushes, cancelling them"
        );
        inner.flush_cancel.cancel();
        inner.tracker.wait().await;

        Err(Error::DrainTimeout {
            abandoned: inner.abandoned.load(Ordering::SeqCst),
        })
    }
}

impl<W> Inner<W>
where
    W: RemoteWriter + Sync + 'static,
{
    /// Arms the age trigger of the buffer `generation`, which seals it at `deadline`.
    fn start_timer(self: &Arc<Self>, generation: u64, deadline: Instant) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = inner.timer_cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            if let Some(batch) = inner.accumulator.seal_if_generation(generation) {
                debug!(id = batch.id, "Buffer reached its maximum age");
                inner.dispatch(batch).await;
            }
        });
    }

    /// Acquires a flush slot for `batch` and starts its flush.
    async fn dispatch(self: &Arc<Self>, batch: SealedBatch) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit,
            _ = self.flush_cancel.cancelled() => {
                self.abandon(batch.requests, &Error::Cancelled);
                return;
            }
        };
        let Ok(permit) = permit else {
            self.metrics.record_fail(batch.requests.len());
            fail_all(batch.requests, "flush slots are closed");
            return;
        };

        let inner = Arc::clone(self);
        let handle = self
            .tracker
            .spawn(async move { inner.flush(batch, permit).await });

        if self.inline {
            if let Err(e) = handle.await {
                error!(?e, "Bulk flush task failed");
            }
        }
    }

    /// Writes `batch` and resolves each of its requests. The slot is released when this returns.
    async fn flush(&self, batch: SealedBatch, _permit: OwnedSemaphorePermit) {
        let _inflight = InflightGuard::new(&self.metrics);
        let SealedBatch {
            id,
            requests,
            bytes,
        } = batch;

        let documents: Vec<Document> = requests.iter().map(|r| r.document().clone()).collect();
        info!(id, count = documents.len(), bytes, "Bulk executing requests");
        self.metrics.observe_bulk_size(documents.len());

        let start = Instant::now();
        match self.write_with_retry(id, &documents).await {
            Ok(outcome) => {
                self.metrics.observe_write_time(start.elapsed());
                self.fan_out(id, requests, outcome);
            }
            Err(Error::Cancelled) => {
                warn!(id, count = requests.len(), "Bulk flush abandoned");
                self.abandon(requests, &Error::Cancelled);
            }
            Err(e) => {
                error!(id, ?e, count = requests.len(), "Bulk failed, failing all records");
                self.metrics.record_bulk_failure();
                self.metrics.record_fail(requests.len());
                fail_all(requests, &e.to_string());
            }
        }
    }

    /// Issues the bulk call, retrying the whole call with backoff while it fails.
    async fn write_with_retry(&self, id: u64, documents: &[Document]) -> Result<BatchOutcome> {
        let mut backoff = ExponentialBackoff::new(&self.backoff);
        loop {
            self.metrics.record_bulk_request();
            let result = tokio::select! {
                biased;
                _ = self.flush_cancel.cancelled() => return Err(Error::Cancelled),
                result = self.writer.bulk_index(documents) => result,
            };

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            let Some(delay) = backoff.next() else {
                error!(
                    id,
                    retries = backoff.retries(),
                    ?err,
                    "Bulk call failed, retries exhausted"
                );
                return Err(err);
            };

            warn!(
                id,
                retry = backoff.retries(),
                ?delay,
                ?err,
                "Bulk call failed, retrying after backoff"
            );
            self.metrics.record_bulk_retry();

            tokio::select! {
                biased;
                _ = self.flush_cancel.cancelled() => {
                    info!(id, "Cancellation received, stopping retry loop");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Resolves `requests[i]` with `outcome.items[i]`. Requests without a matching item fail.
    fn fan_out(&self, id: u64, requests: Vec<RecordRequest>, outcome: BatchOutcome) {
        info!(
            id,
            count = requests.len(),
            failures = outcome.failures(),
            took_ms = outcome.took.as_millis() as u64,
            ingest_took_ms = outcome.ingest_took.map(|d| d.as_millis() as u64),
            "Bulk completed"
        );

        if outcome.items.len() != requests.len() {
            warn!(
                id,
                requests = requests.len(),
                responses = outcome.items.len(),
                "Bulk response does not match the request, failing unmatched records"
            );
            self.metrics.record_response_mismatch();
        }

        let mut items = outcome.items.into_iter();
        for request in requests {
            match items.next() {
                Some(OutcomeStatus::Success) => {
                    self.metrics.record_ack();
                    request.ack();
                }
                Some(OutcomeStatus::Failure(reason)) => {
                    self.metrics.record_fail(1);
                    request.fail(&reason);
                }
                None => {
                    self.metrics.record_fail(1);
                    request.fail("missing from bulk response");
                }
            }
        }
    }

    fn abandon(&self, requests: Vec<RecordRequest>, reason: &Error) {
        let count = requests.len();
        self.abandoned.fetch_add(count, Ordering::SeqCst);
        self.metrics.record_drain_abandoned(count);
        self.metrics.record_fail(count);
        fail_all(requests, &reason.to_string());
    }
}

fn fail_all(requests: Vec<RecordRequest>, reason: &str) {
    for request in requests {
        request.fail(reason);
    }
}
