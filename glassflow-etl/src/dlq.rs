use chrono::Utc;
use tracing::warn;

use crate::bus::{BusError, MessageBus};
use crate::envelope::{DlqEntry, EventEnvelope};
use crate::retry::RetryPolicy;
use crate::streams;

/// Publishes rejected records onto the pipeline's DLQ subject. Shared by
/// every operator that can reject a record; counting and purging go through
/// the manager.
#[derive(Clone)]
pub struct DlqWriter {
    bus: MessageBus,
    pipeline_id: String,
    subject: String,
    retry: RetryPolicy,
}

impl DlqWriter {
    pub fn new(bus: MessageBus, pipeline_id: &str, retry: RetryPolicy) -> Self {
        Self {
            bus,
            pipeline_id: pipeline_id.to_string(),
            subject: streams::dlq_subject(pipeline_id),
            retry,
        }
    }

    /// Publishes one rejected record and waits for the durable ack. The
    /// caller must only ack its input once this returns Ok, so a rejected
    /// record is never lost between the input stream and the DLQ.
    pub async fn publish(
        &self,
        failing_operator: &str,
        source_stream: &str,
        envelope: EventEnvelope,
        reason: impl Into<String>,
    ) -> Result<(), BusError> {
        let reason = reason.into();
        let msg_id = format!(
            "{}/{}/{}",
            envelope.message_id(&self.subject),
            failing_operator,
            source_stream,
        );
        let entry = DlqEntry {
            pipeline_id: self.pipeline_id.clone(),
            source_stream: source_stream.to_string(),
            failing_operator: failing_operator.to_string(),
            reason: reason.clone(),
            ts: Utc::now(),
            original_envelope: envelope,
        };

        let payload = serde_json::to_vec(&entry)
            .map_err(|e| BusError::Publish(format!("DLQ entry serialization: {e}")))?;

        warn!(
            pipeline_id = %self.pipeline_id,
            operator = failing_operator,
            reason = %reason,
            "routing record to DLQ"
        );
        metrics::counter!("pipeline_dlq_records", "operator" => failing_operator.to_string())
            .increment(1);

        self.bus
            .publish_retrying(&self.subject, &msg_id, payload, &self.retry)
            .await?;
        Ok(())
    }
}
