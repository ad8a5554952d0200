use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message, Timestamp,
};
use tracing::debug;

use crate::config::{KafkaConnection, KafkaTuning};

/// Where a freshly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Earliest,
    Latest,
}

impl InitialOffset {
    fn as_rdkafka(&self) -> &'static str {
        match self {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        }
    }
}

/// A single-topic consumer that never auto-stores offsets. Callers receive
/// an [`OffsetHandle`] with every record and store it only once the record
/// has been made durable downstream; the periodic auto-commit then commits
/// stored offsets, so the committed position never passes unacknowledged
/// work.
#[derive(Clone)]
pub struct TopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

/// One record fetched from the topic, with its source coordinates. The
/// payload is copied out of librdkafka's buffer so the handle can outlive
/// the poll loop.
pub struct FetchedRecord {
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
    /// Broker append time in epoch milliseconds, when available.
    pub timestamp_ms: Option<i64>,
    pub offset_handle: OffsetHandle,
}

impl TopicConsumer {
    pub fn new(
        connection: &KafkaConnection,
        tuning: &KafkaTuning,
        group_id: &str,
        topic: &str,
        initial_offset: InitialOffset,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        connection.apply(&mut client_config);
        client_config
            .set("group.id", group_id)
            .set("auto.offset.reset", initial_offset.as_rdkafka())
            .set("session.timeout.ms", tuning.kafka_session_timeout_ms.to_string())
            .set("fetch.min.bytes", tuning.kafka_fetch_min_bytes.to_string())
            .set("fetch.wait.max.ms", tuning.kafka_fetch_wait_max_ms.to_string())
            .set(
                "statistics.interval.ms",
                tuning.kafka_statistics_interval_ms.to_string(),
            )
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                tuning.kafka_auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false");

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic])?;
        debug!(topic, group_id, "kafka consumer subscribed");

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: topic.to_string(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn recv(&self) -> Result<FetchedRecord, KafkaError> {
        let message = self.inner.consumer.recv().await?;

        let timestamp_ms = match message.timestamp() {
            Timestamp::CreateTime(ms) | Timestamp::LogAppendTime(ms) => Some(ms),
            Timestamp::NotAvailable => None,
        };

        Ok(FetchedRecord {
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            key: message.key().map(|k| k.to_vec()),
            partition: message.partition(),
            offset: message.offset(),
            timestamp_ms,
            offset_handle: OffsetHandle {
                handle: Arc::downgrade(&self.inner),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    /// Stop fetching from all assigned partitions without leaving the group.
    pub fn pause(&self) -> Result<(), KafkaError> {
        let assignment = self.inner.consumer.assignment()?;
        self.inner.consumer.pause(&assignment)
    }

    pub fn resume(&self) -> Result<(), KafkaError> {
        let assignment = self.inner.consumer.assignment()?;
        self.inner.consumer.resume(&assignment)
    }

    /// Synchronously commit whatever offsets have been stored so far. Used
    /// on drain so a restart does not replay acknowledged records.
    pub fn commit_stored(&self) -> Result<(), KafkaError> {
        match self.inner.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing stored yet is not a failure.
            Err(KafkaError::ConsumerCommit(code))
                if code == rdkafka::types::RDKafkaErrorCode::NoOffset =>
            {
                Ok(())
            }
            other => other,
        }
    }
}

/// Deferred offset store for one record. Dropping the handle without calling
/// [`OffsetHandle::store`] leaves the record uncommitted, so it is redelivered
/// after a restart.
pub struct OffsetHandle {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl OffsetHandle {
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_offset_names() {
        assert_eq!(InitialOffset::Earliest.as_rdkafka(), "earliest");
        assert_eq!(InitialOffset::Latest.as_rdkafka(), "latest");
    }
}
