use tokio::time::Instant;
use tracing::{error, warn};

use crate::metrics::SinkMetrics;
use crate::record::RecordRequest;
use crate::writer::{RemoteWriter, WriteOutcome};

/// Writes every record on its own and resolves it before returning. There is no retry here,
/// redelivery of failed records is up to the source.
pub(crate) struct SingleProcessor<W> {
    writer: W,
    metrics: SinkMetrics,
}

impl<W> SingleProcessor<W>
where
    W: RemoteWriter,
{
    pub(crate) fn new(writer: W, metrics: SinkMetrics) -> Self {
        Self { writer, metrics }
    }

    pub(crate) async fn process(&self, request: RecordRequest) {
        let start = Instant::now();
        let result = self.writer.index(request.document()).await;
        self.metrics.observe_write_time(start.elapsed());

        match result {
            Ok(WriteOutcome::Created) => {
                self.metrics.record_ack();
                request.ack();
            }
            Ok(WriteOutcome::Other(result)) => {
                warn!(sequence = request.sequence(), %result, "Document was not created");
                self.metrics.record_fail(1);
                request.fail(&format!("unexpected write result {result}"));
            }
            Err(e) => {
                error!(?e, sequence = request.sequence(), "Failed to write record");
                self.metrics.record_fail(1);
                request.fail(&e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::record::ReadAck;
    use crate::test_utils::{MockWriter, request_with_payload};

    fn processor(writer: &MockWriter) -> (SingleProcessor<MockWriter>, SinkMetrics) {
        let metrics = SinkMetrics::new("test-index");
        (SingleProcessor::new(writer.clone(), metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_created_is_acked() {
        let writer = MockWriter::new();
        let (processor, metrics) = processor(&writer);

        let (req, mut rx) = request_with_payload(1, r#"{"a":1}"#);
        processor.process(req).await;

        // resolved before process returned
        assert_eq!(rx.try_recv().unwrap(), ReadAck::Ack);
        assert_eq!(writer.index_calls().len(), 1);
        assert_eq!(writer.index_calls()[0].payload.as_ref(), br#"{"a":1}"#);
        assert_eq!(metrics.ack_count(), 1);
    }

    #[tokio::test]
    async fn test_other_result_is_failed() {
        let writer = MockWriter::new();
        writer.push_index_reply(Ok(WriteOutcome::Other("updated".to_string())));
        let (processor, metrics) = processor(&writer);

        let (req, mut rx) = request_with_payload(1, "{}");
        processor.process(req).await;
        assert_eq!(rx.try_recv().unwrap(), ReadAck::Nak);
        assert_eq!(metrics.fail_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_failed_not_propagated() {
        let writer = MockWriter::new();
        writer
            .push_index_reply(Err(Error::Transport("connection refused".to_string())))
            .push_index_reply(Ok(WriteOutcome::Created));
        let (processor, _) = processor(&writer);

        let (req, mut rx) = request_with_payload(1, "{}");
        processor.process(req).await;
        assert_eq!(rx.try_recv().unwrap(), ReadAck::Nak);

        // no retry, and the next record goes through
        let (req, mut rx) = request_with_payload(2, "{}");
        processor.process(req).await;
        assert_eq!(rx.try_recv().unwrap(), ReadAck::Ack);
        assert_eq!(writer.index_calls().len(), 2);
    }
}
