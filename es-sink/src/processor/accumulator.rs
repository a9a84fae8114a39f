//! The bulk buffer: accumulates requests until a count or size threshold trips, then hands the
//! whole buffer over as a [SealedBatch] and opens a fresh one.
//!
//! Each buffer is a generation. The age trigger lives outside (a timer per generation) and seals
//! through [Accumulator::seal_if_generation], which is a no-op once that generation is gone.

use std::mem;

use parking_lot::Mutex;

use crate::record::RecordRequest;

/// Count and byte thresholds, `None` disables the trigger.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Thresholds {
    pub(crate) max_actions: Option<usize>,
    pub(crate) max_bytes: Option<usize>,
}

/// A buffer taken out of the accumulator. Nothing appends to it anymore.
#[derive(Debug)]
pub(crate) struct SealedBatch {
    /// Execution id, increasing per sealed buffer.
    pub(crate) id: u64,
    pub(crate) requests: Vec<RecordRequest>,
    pub(crate) bytes: usize,
}

#[derive(Debug)]
pub(crate) enum Append {
    /// The request joined the open buffer. `start_timer` carries the buffer's generation when it
    /// was the first request, so the caller can arm the age trigger.
    Buffered { start_timer: Option<u64> },
    /// The request tripped a threshold and the buffer, including the request, was sealed.
    Sealed(SealedBatch),
    /// The accumulator is closed, the request is handed back.
    Rejected(RecordRequest),
}

#[derive(Debug, Default)]
struct OpenBuffer {
    requests: Vec<RecordRequest>,
    bytes: usize,
}

#[derive(Debug)]
struct State {
    buffer: OpenBuffer,
    generation: u64,
    closed: bool,
}

impl State {
    fn seal(&mut self) -> SealedBatch {
        let buffer = mem::take(&mut self.buffer);
        let id = self.generation;
        self.generation += 1;
        SealedBatch {
            id,
            requests: buffer.requests,
            bytes: buffer.bytes,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Accumulator {
    thresholds: Thresholds,
    state: Mutex<State>,
}

impl Accumulator {
    pub(crate) fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: Mutex::new(State {
                buffer: OpenBuffer::default(),
                generation: 1,
                closed: false,
            }),
        }
    }

    pub(crate) fn append(&self, request: RecordRequest) -> Append {
        let mut state = self.state.lock();
        if state.closed {
            return Append::Rejected(request);
        }

        let first = state.buffer.requests.is_empty();
        state.buffer.bytes += request.document().estimated_size();
        state.buffer.requests.push(request);

        let count_reached = self
            .thresholds
            .max_actions
            .is_some_and(|max| state.buffer.requests.len() >= max);
        let size_reached = self
            .thresholds
            .max_bytes
            .is_some_and(|max| state.buffer.bytes >= max);

        if count_reached || size_reached {
            return Append::Sealed(state.seal());
        }

        Append::Buffered {
            start_timer: first.then_some(state.generation),
        }
    }

    /// Seals the open buffer if it still is the buffer of `generation`.
    pub(crate) fn seal_if_generation(&self, generation: u64) -> Option<SealedBatch> {
        let mut state = self.state.lock();
        if state.generation != generation || state.buffer.requests.is_empty() {
            return None;
        }
        Some(state.seal())
    }

    /// Rejects further appends and returns whatever is still buffered.
    pub(crate) fn close(&self) -> Option<SealedBatch> {
        let mut state = self.state.lock();
        state.closed = true;
        if state.buffer.requests.is_empty() {
            return None;
        }
        Some(state.seal())
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffer.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::request_with_payload;

    fn thresholds(max_actions: Option<usize>, max_bytes: Option<usize>) -> Thresholds {
        Thresholds {
            max_actions,
            max_bytes,
        }
    }

    #[test]
    fn test_count_threshold() {
        let acc = Accumulator::new(thresholds(Some(3), None));

        let (req, _rx) = request_with_payload(0, "{}");
        assert!(matches!(
            acc.append(req),
            Append::Buffered {
                start_timer: Some(1)
            }
        ));
        let (req, _rx) = request_with_payload(1, "{}");
        assert!(matches!(
            acc.append(req),
            Append::Buffered { start_timer: None }
        ));

        let (req, _rx) = request_with_payload(2, "{}");
        let Append::Sealed(batch) = acc.append(req) else {
            panic!("expected a sealed batch");
        };
        assert_eq!(batch.id, 1);
        let sequences: Vec<u64> = batch.requests.iter().map(|r| r.sequence()).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(acc.buffered(), 0);

        // the next buffer is a new generation
        let (req, _rx) = request_with_payload(3, "{}");
        assert!(matches!(
            acc.append(req),
            Append::Buffered {
                start_timer: Some(2)
            }
        ));
        batch.requests.into_iter().for_each(|r| r.ack());
    }

    #[test]
    fn test_size_threshold() {
        let payload = "x".repeat(100);
        // each request accounts for 100 bytes of payload plus overhead
        let acc = Accumulator::new(thresholds(None, Some(250)));

        let (req, _rx1) = request_with_payload(0, &payload);
        assert!(matches!(acc.append(req), Append::Buffered { .. }));
        let (req, _rx2) = request_with_payload(1, &payload);
        let Append::Sealed(batch) = acc.append(req) else {
            panic!("expected a sealed batch");
        };
        assert_eq!(batch.requests.len(), 2);
        assert!(batch.bytes >= 250);
        batch.requests.into_iter().for_each(|r| r.ack());
    }

    #[test]
    fn test_single_action_seals_without_timer() {
        let acc = Accumulator::new(thresholds(Some(1), None));
        let (req, _rx) = request_with_payload(0, "{}");
        let Append::Sealed(batch) = acc.append(req) else {
            panic!("expected a sealed batch");
        };
        assert_eq!(batch.requests.len(), 1);
        batch.requests.into_iter().for_each(|r| r.ack());
    }

    #[test]
    fn test_no_thresholds_never_seals_on_append() {
        let acc = Accumulator::new(Thresholds::default());
        let mut receivers = Vec::new();
        for i in 0..1000 {
            let (req, rx) = request_with_payload(i, "{}");
            receivers.push(rx);
            assert!(matches!(acc.append(req), Append::Buffered { .. }));
        }
        assert_eq!(acc.buffered(), 1000);
        let batch = acc.close().unwrap();
        batch.requests.into_iter().for_each(|r| r.ack());
    }

    #[test]
    fn test_stale_generation_is_noop() {
        let acc = Accumulator::new(thresholds(Some(2), None));
        let (req, _rx1) = request_with_payload(0, "{}");
        acc.append(req);
        let (req, _rx2) = request_with_payload(1, "{}");
        let Append::Sealed(batch) = acc.append(req) else {
            panic!("expected a sealed batch");
        };
        batch.requests.into_iter().for_each(|r| r.ack());

        // generation 1 was sealed by the count trigger
        assert!(acc.seal_if_generation(1).is_none());

        let (req, _rx3) = request_with_payload(2, "{}");
        acc.append(req);
        let batch = acc.seal_if_generation(2).unwrap();
        assert_eq!(batch.id, 2);
        assert_eq!(batch.requests.len(), 1);
        batch.requests.into_iter().for_each(|r| r.ack());
    }

    #[tokio::test]
    async fn test_close_rejects_appends() {
        let acc = Accumulator::new(thresholds(Some(10), None));
        let (req, _rx) = request_with_payload(0, "{}");
        acc.append(req);

        let batch = acc.close().unwrap();
        assert_eq!(batch.requests.len(), 1);
        batch.requests.into_iter().for_each(|r| r.ack());
        assert!(acc.close().is_none());

        let (req, rx) = request_with_payload(1, "{}");
        let Append::Rejected(req) = acc.append(req) else {
            panic!("expected the request to be rejected");
        };
        req.fail("closed");
        assert_eq!(rx.await.unwrap(), crate::record::ReadAck::Nak);
    }
}
