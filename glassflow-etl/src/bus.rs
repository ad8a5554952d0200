//! JetStream adapter: named persistent streams, durable pull consumers,
//! publish with duplicate suppression, purge/count/delete, and the
//! key-value bucket backing pipeline recovery.
//!
//! The bus is the single source of truth for progress between operators.
//! Messages persist until acked and are redelivered on nak or ack-wait
//! expiry, which is what the at-least-once contract of the whole pipeline
//! rests on.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::Config as StreamConfig,
    AckKind, Context,
};
use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("stream operation failed: {0}")]
    Stream(String),
    #[error("consumer operation failed: {0}")]
    Consumer(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("key-value operation failed: {0}")]
    Kv(String),
}

#[derive(Clone)]
pub struct MessageBus {
    jetstream: Context,
}

impl MessageBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        info!(url, "connecting to message bus");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Creates the stream if it does not exist yet. Existing streams are
    /// left untouched so a restart reattaches to in-flight state.
    pub async fn ensure_stream(
        &self,
        name: &str,
        subjects: Vec<String>,
        max_age: Duration,
        max_bytes: i64,
    ) -> Result<(), BusError> {
        let config = StreamConfig {
            name: name.to_string(),
            subjects,
            max_age,
            max_bytes,
            // Publish retries within this horizon collapse onto the stored copy.
            duplicate_window: Duration::from_secs(120),
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        debug!(stream = name, "stream ensured");
        Ok(())
    }

    pub async fn delete_stream(&self, name: &str) -> Result<(), BusError> {
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        info!(stream = name, "stream deleted");
        Ok(())
    }

    /// Publishes and waits for the durable ack. `msg_id` drives server-side
    /// duplicate suppression within the stream's duplicate window, so a
    /// retried publish does not double-store the record.
    pub async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, Bytes::from(payload))
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(ack.sequence)
    }

    /// [`publish`](Self::publish) with bounded jittered retries for
    /// transient failures.
    pub async fn publish_retrying(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
        policy: &RetryPolicy,
    ) -> Result<u64, BusError> {
        let mut attempt = 0u32;
        loop {
            match self.publish(subject, msg_id, payload.clone()).await {
                Ok(seq) => return Ok(seq),
                Err(err) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(err);
                    }
                    let backoff = policy.jittered_interval(attempt);
                    warn!(
                        subject,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "bus publish failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Durable pull consumer on `stream`, filtered to `filter_subject`.
    /// Ack state survives restarts under `durable_name`.
    pub async fn subscribe(
        &self,
        stream: &str,
        durable_name: &str,
        deliver_policy: DeliverPolicy,
        filter_subject: &str,
    ) -> Result<DurableConsumer, BusError> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;

        let config = pull::Config {
            durable_name: Some(durable_name.to_string()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy,
            filter_subject: filter_subject.to_string(),
            ack_wait: Duration::from_secs(30),
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(durable_name, config)
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;

        debug!(consumer = durable_name, "durable consumer attached");
        Ok(DurableConsumer { consumer })
    }

    pub async fn delete_consumer(&self, stream: &str, durable_name: &str) -> Result<(), BusError> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        stream
            .delete_consumer(durable_name)
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;
        Ok(())
    }

    /// Removes messages from a stream, optionally only those on one subject.
    /// Returns the number of purged messages.
    pub async fn purge(&self, stream: &str, subject: Option<&str>) -> Result<u64, BusError> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;

        let response = match subject {
            Some(subject) => stream
                .purge()
                .filter(subject)
                .await
                .map_err(|e| BusError::Stream(e.to_string()))?,
            None => stream
                .purge()
                .await
                .map_err(|e| BusError::Stream(e.to_string()))?,
        };
        Ok(response.purged)
    }

    /// Number of stored messages, for the whole stream or one subject.
    /// Subject counts go through a throwaway consumer because stream info
    /// only carries the total.
    pub async fn count(&self, stream: &str, subject: Option<&str>) -> Result<u64, BusError> {
        let mut stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;

        let Some(subject) = subject else {
            let info = stream
                .info()
                .await
                .map_err(|e| BusError::Stream(e.to_string()))?;
            return Ok(info.state.messages);
        };

        let mut consumer = stream
            .create_consumer(pull::Config {
                ack_policy: AckPolicy::Explicit,
                deliver_policy: DeliverPolicy::All,
                filter_subject: subject.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;

        let info = consumer
            .info()
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;
        let pending = info.num_pending;
        let name = info.name.clone();

        if let Err(err) = stream.delete_consumer(&name).await {
            warn!(consumer = name, error = %err, "failed to drop counting consumer");
        }
        Ok(pending)
    }

    /// The key-value bucket used for pipeline persistence.
    pub async fn key_value(&self, bucket: &str) -> Result<KvStore, BusError> {
        let store = self
            .jetstream
            .create_key_value(jetstream::kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(KvStore { store })
    }
}

#[derive(Clone)]
pub struct KvStore {
    store: jetstream::kv::Store,
}

impl KvStore {
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BusError> {
        self.store
            .put(key, Bytes::from(value))
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let entry = self
            .store
            .get(key)
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(entry.map(|bytes| bytes.to_vec()))
    }

    pub async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.store
            .delete(key)
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>, BusError> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;

        let mut collected = Vec::new();
        while let Some(key) = keys.next().await {
            match key {
                Ok(key) => collected.push(key),
                Err(err) => warn!(error = %err, "skipping unreadable key"),
            }
        }
        Ok(collected)
    }
}

pub struct DurableConsumer {
    consumer: jetstream::consumer::Consumer<pull::Config>,
}

impl DurableConsumer {
    /// Fetches up to `max_messages`, waiting at most `timeout`. Returns an
    /// empty batch on expiry; an empty batch is how idle workers get back
    /// to their command channels.
    pub async fn fetch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;

        let mut messages = Vec::new();
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => messages.push(BusMessage { inner: message }),
                Err(err) => {
                    warn!(error = %err, "failed to receive message");
                    break;
                }
            }
        }
        Ok(messages)
    }

    /// Undelivered message count, used as the operator backlog hint.
    pub async fn pending(&mut self) -> Result<u64, BusError> {
        let info = self
            .consumer
            .info()
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;
        Ok(info.num_pending)
    }
}

pub struct BusMessage {
    inner: jetstream::Message,
}

impl BusMessage {
    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.inner
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    /// Request redelivery, optionally after a delay.
    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.inner
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    /// Drop the message without redelivery.
    pub async fn term(&self) -> Result<(), BusError> {
        self.inner
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
