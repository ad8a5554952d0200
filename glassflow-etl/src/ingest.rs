//! Kafka ingestor: one worker per configured topic. Wraps each record in
//! the event envelope, publishes it to the topic's input subject and only
//! then stores the Kafka offset. A crash between fetch and publish replays
//! the record from the last stored offset; a crash after the publish ack is
//! absorbed by the bus's duplicate window.

use std::time::Duration;

use common_kafka::config::{KafkaConnection, KafkaTuning};
use common_kafka::consumer::{FetchedRecord, InitialOffset, TopicConsumer};
use health::LivenessHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::envelope::EventEnvelope;
use crate::operator::{OperatorCommand, OperatorContext, OperatorState};
use crate::retry::RetryPolicy;
use crate::streams;

enum LoopOutcome {
    Continue,
    Shutdown,
}

pub struct IngestorWorker {
    pipeline_id: String,
    topic: String,
    consumer: TopicConsumer,
    bus: MessageBus,
    subject: String,
    publish_retry: RetryPolicy,
    ctx: OperatorContext,
    cancel: CancellationToken,
    liveness: LivenessHandle,
    liveness_deadline: Duration,
}

impl IngestorWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: &str,
        topic: &str,
        initial_offset: InitialOffset,
        connection: &KafkaConnection,
        tuning: &KafkaTuning,
        bus: MessageBus,
        publish_retry: RetryPolicy,
        ctx: OperatorContext,
        cancel: CancellationToken,
        liveness: LivenessHandle,
        liveness_deadline: Duration,
    ) -> Result<Self, rdkafka::error::KafkaError> {
        let consumer = TopicConsumer::new(
            connection,
            tuning,
            &streams::consumer_group(pipeline_id),
            topic,
            initial_offset,
        )?;

        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            topic: topic.to_string(),
            consumer,
            bus,
            subject: streams::input_subject(pipeline_id, topic),
            publish_retry,
            ctx,
            cancel,
            liveness,
            liveness_deadline,
        })
    }

    pub async fn run(mut self) {
        info!(
            pipeline_id = %self.pipeline_id,
            topic = %self.topic,
            "ingestor starting"
        );
        self.ctx.reporter.state(OperatorState::Running);

        let mut liveness_tick = tokio::time::interval(self.liveness_deadline / 3);
        let mut paused = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = liveness_tick.tick() => {
                    self.liveness.report_healthy().await;
                }

                command = self.ctx.commands.recv() => {
                    match command {
                        Some(OperatorCommand::Pause) => self.pause(&mut paused),
                        Some(OperatorCommand::Resume) => self.resume(&mut paused),
                        Some(OperatorCommand::Terminate) | None => break,
                    }
                }

                record = self.consumer.recv(), if !paused => {
                    match record {
                        Ok(record) => {
                            if let LoopOutcome::Shutdown =
                                self.handle_record(record, &mut paused).await
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(topic = %self.topic, error = %err, "kafka recv error");
                            self.ctx.reporter.error(&err);
                            metrics::counter!(
                                "pipeline_ingest_kafka_errors",
                                "topic" => self.topic.clone()
                            )
                            .increment(1);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        self.stop();
    }

    fn pause(&self, paused: &mut bool) {
        if *paused {
            return;
        }
        if let Err(err) = self.consumer.pause() {
            warn!(topic = %self.topic, error = %err, "failed to pause kafka consumer");
            self.ctx.reporter.error(&err);
        }
        *paused = true;
        self.ctx.reporter.state(OperatorState::Paused);
        info!(pipeline_id = %self.pipeline_id, topic = %self.topic, "ingestor paused");
    }

    fn resume(&self, paused: &mut bool) {
        if !*paused {
            return;
        }
        if let Err(err) = self.consumer.resume() {
            warn!(topic = %self.topic, error = %err, "failed to resume kafka consumer");
            self.ctx.reporter.error(&err);
        }
        *paused = false;
        self.ctx.reporter.state(OperatorState::Running);
        info!(pipeline_id = %self.pipeline_id, topic = %self.topic, "ingestor resumed");
    }

    fn stop(&self) {
        self.ctx.reporter.state(OperatorState::Stopping);
        if let Err(err) = self.consumer.commit_stored() {
            warn!(topic = %self.topic, error = %err, "offset commit on shutdown failed");
        }
        self.ctx.reporter.state(OperatorState::Stopped);
        info!(pipeline_id = %self.pipeline_id, topic = %self.topic, "ingestor stopped");
    }

    /// Publishes the record's envelope and stores the offset. The publish is
    /// retried until durable: giving up would either lose the record or
    /// stall the partition anyway, so the worker goes unhealthy and keeps
    /// trying until the bus recovers or the pipeline is torn down.
    async fn handle_record(&mut self, record: FetchedRecord, paused: &mut bool) -> LoopOutcome {
        if record.payload.is_empty() {
            // Tombstones carry no payload to map; skip but advance.
            if let Err(err) = record.offset_handle.store() {
                warn!(topic = %self.topic, error = %err, "offset store failed");
            }
            return LoopOutcome::Continue;
        }

        let envelope = EventEnvelope::from_record(
            &self.topic,
            record.partition,
            record.offset,
            record.key,
            &record.payload,
        );
        if envelope.parse_error {
            metrics::counter!(
                "pipeline_ingest_malformed_payloads",
                "topic" => self.topic.clone()
            )
            .increment(1);
        }

        let msg_id = envelope.message_id(&self.subject);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!(topic = %self.topic, error = %err, "envelope serialization failed");
                self.ctx.reporter.error(&err);
                return LoopOutcome::Continue;
            }
        };

        let mut attempt = 0u32;
        loop {
            let publish = self
                .bus
                .publish_retrying(&self.subject, &msg_id, payload.clone(), &self.publish_retry);

            tokio::select! {
                _ = self.cancel.cancelled() => return LoopOutcome::Shutdown,

                command = self.ctx.commands.recv() => {
                    match command {
                        // The in-flight record finishes its publish+store
                        // cycle before the pause takes effect.
                        Some(OperatorCommand::Pause) => {
                            self.ctx.reporter.state(OperatorState::Pausing);
                            self.pause_consumer_only(paused);
                        }
                        Some(OperatorCommand::Resume) => self.resume(paused),
                        Some(OperatorCommand::Terminate) | None => return LoopOutcome::Shutdown,
                    }
                }

                result = publish => {
                    match result {
                        Ok(_seq) => {
                            if let Err(err) = record.offset_handle.store() {
                                warn!(topic = %self.topic, error = %err, "offset store failed");
                            }
                            if self.ctx.reporter.current_state() == OperatorState::Unhealthy {
                                self.ctx.reporter.state(OperatorState::Running);
                            }
                            if *paused {
                                self.ctx.reporter.state(OperatorState::Paused);
                            }
                            self.ctx.reporter.success();
                            metrics::counter!(
                                "pipeline_ingest_records",
                                "topic" => self.topic.clone()
                            )
                            .increment(1);
                            return LoopOutcome::Continue;
                        }
                        Err(err) => {
                            attempt += 1;
                            warn!(
                                topic = %self.topic,
                                attempt,
                                error = %err,
                                "bus publish budget exhausted, ingestor unhealthy"
                            );
                            self.ctx.reporter.state(OperatorState::Unhealthy);
                            self.ctx.reporter.error(&err);
                            tokio::time::sleep(self.publish_retry.maximum_interval).await;
                        }
                    }
                }
            }
        }
    }

    fn pause_consumer_only(&self, paused: &mut bool) {
        if *paused {
            return;
        }
        if let Err(err) = self.consumer.pause() {
            warn!(topic = %self.topic, error = %err, "failed to pause kafka consumer");
        }
        *paused = true;
    }
}
