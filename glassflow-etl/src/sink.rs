//! Batching ClickHouse sink.
//!
//! Rows accumulate until the batch is full or the oldest buffered row has
//! waited `max_delay_time`. A flush maps every envelope to a typed row
//! (mapping failures divert to the DLQ), issues one insert for the rest,
//! and only then acks. The batch is atomic with respect to ClickHouse:
//! all rows inserted and acked, or all nak'd for redelivery, or all routed
//! to the DLQ on a terminal server error.

use std::time::{Duration, Instant};

use health::LivenessHandle;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusMessage, DurableConsumer};
use crate::clickhouse::{is_retriable, ClickHouseInserter};
use crate::dlq::DlqWriter;
use crate::envelope::EventEnvelope;
use crate::mapper::{map_field, ColumnValue, MappingError};
use crate::operator::{OperatorCommand, OperatorContext, OperatorState};
use crate::pipeline_config::ColumnMapping;
use crate::retry::RetryPolicy;

/// Whether the buffered batch must be flushed now.
pub fn should_flush(
    buffered: usize,
    max_batch_size: usize,
    first_buffered_at: Option<Instant>,
    max_delay: Duration,
) -> bool {
    if buffered == 0 {
        return false;
    }
    if buffered >= max_batch_size {
        return true;
    }
    first_buffered_at
        .map(|first| first.elapsed() >= max_delay)
        .unwrap_or(false)
}

/// Maps one envelope to a row in mapping order. For joined payloads each
/// mapping resolves inside its side's sub-object; an unpaired side reads as
/// missing fields, so its columns must be nullable to survive.
pub fn map_envelope(
    envelope: &EventEnvelope,
    mappings: &[ColumnMapping],
    join_active: bool,
) -> Result<Vec<ColumnValue>, MappingError> {
    if envelope.parse_error {
        return Err(MappingError::MalformedPayload);
    }

    let mut row = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let root = if join_active {
            envelope
                .payload_json
                .get(&mapping.source_id)
                .unwrap_or(&Value::Null)
        } else {
            &envelope.payload_json
        };
        row.push(map_field(
            root,
            &mapping.field_name,
            mapping.column_type,
            mapping.nullable,
        )?);
    }
    Ok(row)
}

pub struct SinkWorker {
    pipeline_id: String,
    consumer: DurableConsumer,
    mappings: Vec<ColumnMapping>,
    join_active: bool,
    inserter: ClickHouseInserter,
    max_batch_size: usize,
    max_delay: Duration,
    insert_timeout: Duration,
    retry: RetryPolicy,
    dlq: DlqWriter,
    /// Stream the sink consumes, recorded on DLQ entries.
    source_stream: String,
    fetch_timeout: Duration,
    ctx: OperatorContext,
    cancel: CancellationToken,
    liveness: LivenessHandle,
    liveness_deadline: Duration,
}

struct Pending {
    message: BusMessage,
    envelope: EventEnvelope,
}

impl SinkWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: &str,
        consumer: DurableConsumer,
        mappings: Vec<ColumnMapping>,
        join_active: bool,
        inserter: ClickHouseInserter,
        max_batch_size: usize,
        max_delay: Duration,
        insert_timeout: Duration,
        retry: RetryPolicy,
        dlq: DlqWriter,
        source_stream: String,
        fetch_timeout: Duration,
        ctx: OperatorContext,
        cancel: CancellationToken,
        liveness: LivenessHandle,
        liveness_deadline: Duration,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            consumer,
            mappings,
            join_active,
            inserter,
            max_batch_size: max_batch_size.max(1),
            max_delay,
            insert_timeout,
            retry,
            dlq,
            source_stream,
            fetch_timeout,
            ctx,
            cancel,
            liveness,
            liveness_deadline,
        }
    }

    pub async fn run(mut self) {
        info!(pipeline_id = %self.pipeline_id, "sink starting");
        self.ctx.reporter.state(OperatorState::Running);

        let mut liveness_tick = tokio::time::interval(self.liveness_deadline / 3);
        let mut paused = false;
        let mut buffer: Vec<Pending> = Vec::new();
        let mut first_buffered_at: Option<Instant> = None;

        loop {
            // Never sleep past the batch deadline while rows are waiting.
            let fetch_timeout = match first_buffered_at {
                Some(first) => self
                    .max_delay
                    .saturating_sub(first.elapsed())
                    .min(self.fetch_timeout)
                    .max(Duration::from_millis(10)),
                None => self.fetch_timeout,
            };
            let fetch_max = self.max_batch_size.saturating_sub(buffer.len()).max(1);

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = liveness_tick.tick() => {
                    self.liveness.report_healthy().await;
                    if let Ok(pending) = self.consumer.pending().await {
                        self.ctx.reporter.backlog(pending);
                    }
                }

                command = self.ctx.commands.recv() => {
                    match command {
                        Some(OperatorCommand::Pause) => {
                            // Soft pause: finish the in-flight batch first.
                            self.ctx.reporter.state(OperatorState::Pausing);
                            self.flush(&mut buffer, &mut first_buffered_at).await;
                            paused = true;
                            self.ctx.reporter.state(OperatorState::Paused);
                        }
                        Some(OperatorCommand::Resume) => {
                            paused = false;
                            self.ctx.reporter.state(OperatorState::Running);
                        }
                        Some(OperatorCommand::Terminate) | None => break,
                    }
                }

                fetched = self.consumer.fetch(fetch_max, fetch_timeout), if !paused => {
                    match fetched {
                        Ok(messages) => {
                            for message in messages {
                                match serde_json::from_slice::<EventEnvelope>(message.payload()) {
                                    Ok(envelope) => {
                                        if buffer.is_empty() {
                                            first_buffered_at = Some(Instant::now());
                                        }
                                        buffer.push(Pending { message, envelope });
                                    }
                                    Err(err) => {
                                        warn!(error = %err, "dropping undecodable bus message");
                                        if let Err(err) = message.term().await {
                                            warn!(error = %err, "term failed");
                                        }
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "sink fetch failed");
                            self.ctx.reporter.error(&err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }

                    if should_flush(
                        buffer.len(),
                        self.max_batch_size,
                        first_buffered_at,
                        self.max_delay,
                    ) {
                        self.flush(&mut buffer, &mut first_buffered_at).await;
                    }
                }
            }
        }

        // Hard stop: one bounded attempt to drain the local batch, then nak
        // whatever is left for the next run.
        self.ctx.reporter.state(OperatorState::Stopping);
        self.flush(&mut buffer, &mut first_buffered_at).await;
        for pending in buffer {
            if let Err(err) = pending.message.nak(None).await {
                warn!(error = %err, "nak on shutdown failed");
            }
        }
        self.ctx.reporter.state(OperatorState::Stopped);
        info!(pipeline_id = %self.pipeline_id, "sink stopped");
    }

    /// Flushes the batch. On return the buffer is empty unless the insert
    /// budget was exhausted, in which case the rows were nak'd and the
    /// buffer cleared anyway.
    async fn flush(&self, buffer: &mut Vec<Pending>, first_buffered_at: &mut Option<Instant>) {
        *first_buffered_at = None;
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        let batch_len = batch.len();

        // Split mappable rows from DLQ-bound ones, preserving arrival order.
        let mut rows = Vec::with_capacity(batch_len);
        let mut mappable = Vec::with_capacity(batch_len);
        for pending in batch {
            match map_envelope(&pending.envelope, &self.mappings, self.join_active) {
                Ok(row) => {
                    rows.push(row);
                    mappable.push(pending);
                }
                Err(err) => {
                    self.divert(pending, err.to_string()).await;
                }
            }
        }

        if rows.is_empty() {
            return;
        }

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.release(mappable).await;
                    return;
                }
                outcome = tokio::time::timeout(
                    self.insert_timeout,
                    self.inserter.insert(&rows),
                ) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    for pending in &mappable {
                        if let Err(err) = pending.message.ack().await {
                            warn!(error = %err, "ack after insert failed");
                        }
                    }
                    if self.ctx.reporter.current_state() == OperatorState::Unhealthy {
                        self.ctx.reporter.state(OperatorState::Running);
                    }
                    self.ctx.reporter.success();
                    metrics::counter!("pipeline_sink_rows_inserted").increment(rows.len() as u64);
                    metrics::histogram!("pipeline_sink_flush_ms")
                        .record(started.elapsed().as_millis() as f64);
                    return;
                }

                Ok(Err(err)) if !is_retriable(&err) => {
                    let reason = err.to_string();
                    warn!(error = %reason, "terminal insert error, routing batch to DLQ");
                    for pending in mappable {
                        self.divert(pending, reason.clone()).await;
                    }
                    return;
                }

                Ok(Err(err)) => {
                    if attempt >= self.retry.max_attempts {
                        self.give_up(mappable, &err.to_string()).await;
                        return;
                    }
                    let backoff = self.retry.jittered_interval(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "insert failed, backing off"
                    );
                    self.ctx.reporter.error(&err);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.release(mappable).await;
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }

                Err(_elapsed) => {
                    if attempt >= self.retry.max_attempts {
                        self.give_up(mappable, "insert timed out").await;
                        return;
                    }
                    let backoff = self.retry.jittered_interval(attempt);
                    warn!(attempt, "insert timed out, backing off");
                    self.ctx.reporter.error("insert timed out");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.release(mappable).await;
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn divert(&self, pending: Pending, reason: String) {
        match self
            .dlq
            .publish("sink", &self.source_stream, pending.envelope, reason)
            .await
        {
            Ok(()) => {
                if let Err(err) = pending.message.ack().await {
                    warn!(error = %err, "ack after DLQ publish failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "DLQ publish failed, leaving record for redelivery");
                if let Err(err) = pending.message.nak(Some(Duration::from_secs(1))).await {
                    warn!(error = %err, "nak failed");
                }
            }
        }
    }

    /// Hands un-inserted records back to the bus on cancellation.
    async fn release(&self, mappable: Vec<Pending>) {
        for pending in mappable {
            if let Err(err) = pending.message.nak(None).await {
                warn!(error = %err, "nak on cancellation failed");
            }
        }
    }

    /// Retry budget exhausted: hand the whole batch back to the bus and go
    /// unhealthy until a later flush succeeds.
    async fn give_up(&self, mappable: Vec<Pending>, error: &str) {
        warn!(error, "insert retry budget exhausted, nak'ing batch");
        self.ctx.reporter.state(OperatorState::Unhealthy);
        self.ctx.reporter.error(error);
        metrics::counter!("pipeline_sink_batches_abandoned").increment(1);
        for pending in mappable {
            if let Err(err) = pending.message.nak(Some(Duration::from_secs(5))).await {
                warn!(error = %err, "nak failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ColumnType;
    use serde_json::json;

    fn mapping(source: &str, field: &str, column: &str, ty: ColumnType, nullable: bool) -> ColumnMapping {
        ColumnMapping {
            source_id: source.to_string(),
            field_name: field.to_string(),
            column_name: column.to_string(),
            column_type: ty,
            nullable,
        }
    }

    #[test]
    fn flush_triggers() {
        assert!(!should_flush(0, 10, None, Duration::from_secs(1)));
        assert!(should_flush(10, 10, Some(Instant::now()), Duration::from_secs(1)));
        assert!(should_flush(15, 10, Some(Instant::now()), Duration::from_secs(1)));
        // Below the size threshold and before the deadline.
        assert!(!should_flush(3, 10, Some(Instant::now()), Duration::from_secs(60)));
        // Past the deadline.
        let old = Instant::now() - Duration::from_secs(2);
        assert!(should_flush(3, 10, Some(old), Duration::from_secs(1)));
    }

    #[test]
    fn maps_flat_payload() {
        let envelope = EventEnvelope::from_record(
            "users",
            0,
            1,
            None,
            br#"{"id": 7, "name": "John"}"#,
        );
        let mappings = vec![
            mapping("users", "id", "id", ColumnType::Int64, false),
            mapping("users", "name", "name", ColumnType::String, false),
        ];

        let row = map_envelope(&envelope, &mappings, false).unwrap();
        assert_eq!(row, vec![ColumnValue::Int(7), ColumnValue::String("John".to_string())]);
    }

    #[test]
    fn maps_joined_payload_by_source() {
        let left = EventEnvelope::from_record("users", 0, 1, None, br#"{"name": "John"}"#);
        let right = EventEnvelope::from_record("emails", 0, 2, None, br#"{"email": "j@x"}"#);
        let joined = EventEnvelope::joined("users", "emails", Some(left), Some(right));

        let mappings = vec![
            mapping("users", "name", "name", ColumnType::String, false),
            mapping("emails", "email", "email", ColumnType::String, false),
        ];

        let row = map_envelope(&joined, &mappings, true).unwrap();
        assert_eq!(
            row,
            vec![
                ColumnValue::String("John".to_string()),
                ColumnValue::String("j@x".to_string()),
            ]
        );
    }

    #[test]
    fn unpaired_side_needs_nullable_columns() {
        let left = EventEnvelope::from_record("users", 0, 1, None, br#"{"name": "John"}"#);
        let unpaired = EventEnvelope::joined("users", "emails", Some(left), None);

        let nullable = vec![
            mapping("users", "name", "name", ColumnType::String, false),
            mapping("emails", "email", "email", ColumnType::String, true),
        ];
        let row = map_envelope(&unpaired, &nullable, true).unwrap();
        assert_eq!(row[1], ColumnValue::Null);

        let strict = vec![
            mapping("users", "name", "name", ColumnType::String, false),
            mapping("emails", "email", "email", ColumnType::String, false),
        ];
        assert!(matches!(
            map_envelope(&unpaired, &strict, true),
            Err(MappingError::MissingField { .. })
        ));
    }

    #[test]
    fn malformed_payload_is_a_mapping_error() {
        let envelope = EventEnvelope::from_record("users", 0, 1, None, b"oops {");
        let mappings = vec![mapping("users", "id", "id", ColumnType::Int64, true)];
        assert_eq!(
            map_envelope(&envelope, &mappings, false),
            Err(MappingError::MalformedPayload)
        );
    }

    #[test]
    fn mapping_error_reason_mentions_the_field() {
        let envelope = EventEnvelope::from_record("users", 0, 1, None, json!({"id": "x"}).to_string().as_bytes());
        let mappings = vec![mapping("users", "id", "id", ColumnType::Int64, false)];
        let err = map_envelope(&envelope, &mappings, false).unwrap_err();
        assert!(err.to_string().contains("id"));
    }
}
