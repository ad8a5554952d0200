//! First-wins windowed deduplication.
//!
//! One fetch loop per topic routes records onto key-hash shards; each shard
//! task owns its slice of the key table, so no lock is ever taken on the
//! hot path and per-key ordering is preserved. Survivors are republished on
//! the topic's dedup subject, duplicates are acked away, and records with a
//! missing or mistyped key go to the DLQ.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use health::LivenessHandle;
use serde_json::Value;
use siphasher::sip::SipHasher13;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusMessage, DurableConsumer, MessageBus};
use crate::dlq::DlqWriter;
use crate::envelope::EventEnvelope;
use crate::mapper::extract_field;
use crate::operator::{OperatorCommand, OperatorContext, OperatorState, StatusReporter};
use crate::pipeline_config::{DeduplicationConfig, KeyType};
use crate::retry::RetryPolicy;
use crate::streams;

/// Eviction cadence: frequent enough that expired keys do not linger, but
/// never busier than once a second.
pub fn sweep_interval(window: Duration) -> Duration {
    (window / 16).min(Duration::from_secs(1)).max(Duration::from_millis(10))
}

pub fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = SipHasher13::new();
    hasher.write(key.as_bytes());
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Canonical string form of the dedup key, checked against the configured
/// key type. Missing or mistyped keys are terminal for the record.
pub fn extract_key(payload: &Value, path: &str, key_type: KeyType) -> Result<String, String> {
    let value = extract_field(payload, path)
        .ok_or_else(|| format!("dedup key {path:?} missing from payload"))?;

    match key_type {
        KeyType::String => value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| format!("dedup key {path:?} is not a string")),
        KeyType::Int => value
            .as_i64()
            .map(|i| i.to_string())
            .ok_or_else(|| format!("dedup key {path:?} is not an integer")),
        KeyType::Float => value
            .as_f64()
            .map(|f| f.to_string())
            .ok_or_else(|| format!("dedup key {path:?} is not a float")),
        KeyType::Bool => value
            .as_bool()
            .map(|b| b.to_string())
            .ok_or_else(|| format!("dedup key {path:?} is not a boolean")),
    }
}

/// One shard's slice of the key table: key to first-seen ingest time.
pub struct DedupTable {
    window_ms: i64,
    entries: HashMap<String, i64>,
    high_watermark: usize,
}

impl DedupTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            entries: HashMap::new(),
            high_watermark: 0,
        }
    }

    /// First-wins check against the envelope's ingest time. Returns true if
    /// the record is the first for its key within the window and must be
    /// emitted; records it as the new window anchor when the previous one
    /// has lapsed.
    pub fn observe(&mut self, key: &str, ingest_ms: i64) -> bool {
        match self.entries.get(key) {
            Some(first_seen) if (ingest_ms - first_seen).abs() <= self.window_ms => false,
            _ => {
                self.entries.insert(key.to_string(), ingest_ms);
                self.high_watermark = self.high_watermark.max(self.entries.len());
                true
            }
        }
    }

    /// Drops entries whose window has fully elapsed. Returns the number of
    /// evicted keys.
    pub fn evict(&mut self, now_ms: i64) -> usize {
        let window_ms = self.window_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, first_seen| now_ms - *first_seen <= window_ms);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }
}

struct ShardJob {
    message: BusMessage,
    envelope: EventEnvelope,
    key: String,
}

pub struct DedupWorker {
    pipeline_id: String,
    topic: String,
    config: DeduplicationConfig,
    bus: MessageBus,
    consumer: DurableConsumer,
    output_subject: String,
    dlq: DlqWriter,
    publish_retry: RetryPolicy,
    shards: usize,
    fetch_timeout: Duration,
    ctx: OperatorContext,
    cancel: CancellationToken,
    liveness: LivenessHandle,
    liveness_deadline: Duration,
}

impl DedupWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: &str,
        topic: &str,
        config: DeduplicationConfig,
        bus: MessageBus,
        consumer: DurableConsumer,
        dlq: DlqWriter,
        publish_retry: RetryPolicy,
        shards: usize,
        fetch_timeout: Duration,
        ctx: OperatorContext,
        cancel: CancellationToken,
        liveness: LivenessHandle,
        liveness_deadline: Duration,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            topic: topic.to_string(),
            config,
            bus,
            consumer,
            output_subject: streams::dedup_subject(pipeline_id, topic),
            dlq,
            publish_retry,
            shards: shards.max(1),
            fetch_timeout,
            ctx,
            cancel,
            liveness,
            liveness_deadline,
        }
    }

    pub async fn run(self) {
        let DedupWorker {
            pipeline_id,
            topic,
            config,
            bus,
            mut consumer,
            output_subject,
            dlq,
            publish_retry,
            shards,
            fetch_timeout,
            ctx,
            cancel,
            liveness,
            liveness_deadline,
        } = self;
        let OperatorContext {
            mut commands,
            reporter,
        } = ctx;
        let reporter = Arc::new(reporter);

        info!(pipeline_id = %pipeline_id, topic = %topic, shards, "deduplicator starting");

        let mut shard_txs = Vec::with_capacity(shards);
        let mut shard_tasks = JoinSet::new();
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel::<ShardJob>(256);
            shard_txs.push(tx);
            shard_tasks.spawn(shard_task(
                topic.clone(),
                shard,
                DedupTable::new(config.window),
                sweep_interval(config.window),
                rx,
                bus.clone(),
                output_subject.clone(),
                publish_retry,
                reporter.clone(),
                cancel.child_token(),
            ));
        }

        reporter.state(OperatorState::Running);
        let mut liveness_tick = tokio::time::interval(liveness_deadline / 3);
        let mut paused = false;
        let input_stream = streams::input_stream(&pipeline_id, &topic);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = liveness_tick.tick() => {
                    liveness.report_healthy().await;
                    if let Ok(pending) = consumer.pending().await {
                        reporter.backlog(pending);
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(OperatorCommand::Pause) => {
                            paused = true;
                            reporter.state(OperatorState::Paused);
                        }
                        Some(OperatorCommand::Resume) => {
                            paused = false;
                            reporter.state(OperatorState::Running);
                        }
                        Some(OperatorCommand::Terminate) | None => break,
                    }
                }

                batch = consumer.fetch(64, fetch_timeout), if !paused => {
                    let batch = match batch {
                        Ok(batch) => batch,
                        Err(err) => {
                            warn!(topic = %topic, error = %err, "dedup fetch failed");
                            reporter.error(&err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    for message in batch {
                        route_message(
                            message,
                            &config,
                            &shard_txs,
                            &dlq,
                            &input_stream,
                            &reporter,
                        )
                        .await;
                    }
                }
            }
        }

        reporter.state(OperatorState::Stopping);
        // Dropping the senders lets the shards drain their queues and exit.
        drop(shard_txs);
        while shard_tasks.join_next().await.is_some() {}
        reporter.state(OperatorState::Stopped);
        info!(pipeline_id = %pipeline_id, topic = %topic, "deduplicator stopped");
    }
}

async fn route_message(
    message: BusMessage,
    config: &DeduplicationConfig,
    shard_txs: &[mpsc::Sender<ShardJob>],
    dlq: &DlqWriter,
    input_stream: &str,
    reporter: &StatusReporter,
) {
    let envelope: EventEnvelope = match serde_json::from_slice(message.payload()) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Not one of ours; redelivery cannot fix it.
            warn!(error = %err, "dropping undecodable bus message");
            if let Err(err) = message.term().await {
                warn!(error = %err, "term failed");
            }
            return;
        }
    };

    let key = match extract_key(&envelope.payload_json, &config.key_path, config.key_type) {
        Ok(key) => key,
        Err(reason) => {
            match dlq
                .publish("deduplicator", input_stream, envelope, reason)
                .await
            {
                Ok(()) => {
                    if let Err(err) = message.ack().await {
                        warn!(error = %err, "ack after DLQ publish failed");
                    }
                }
                Err(err) => {
                    reporter.error(&err);
                    if let Err(err) = message.nak(Some(Duration::from_secs(1))).await {
                        warn!(error = %err, "nak failed");
                    }
                }
            }
            return;
        }
    };

    let shard = shard_for(&key, shard_txs.len());
    if shard_txs[shard]
        .send(ShardJob {
            message,
            envelope,
            key,
        })
        .await
        .is_err()
    {
        // Shard is gone; the un-acked message will be redelivered.
        warn!(shard, "dedup shard channel closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn shard_task(
    topic: String,
    shard: usize,
    mut table: DedupTable,
    sweep_every: Duration,
    mut jobs: mpsc::Receiver<ShardJob>,
    bus: MessageBus,
    output_subject: String,
    publish_retry: RetryPolicy,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_every);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let evicted = table.evict(chrono::Utc::now().timestamp_millis());
                if evicted > 0 {
                    metrics::counter!(
                        "pipeline_dedup_evicted_keys",
                        "topic" => topic.clone()
                    )
                    .increment(evicted as u64);
                }
                metrics::gauge!(
                    "pipeline_dedup_key_watermark",
                    "topic" => topic.clone(),
                    "shard" => shard.to_string()
                )
                .set(table.high_watermark() as f64);
            }

            job = jobs.recv() => {
                let Some(job) = job else { break };
                process_job(
                    job,
                    &topic,
                    &mut table,
                    &bus,
                    &output_subject,
                    &publish_retry,
                    &reporter,
                    &cancel,
                )
                .await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    job: ShardJob,
    topic: &str,
    table: &mut DedupTable,
    bus: &MessageBus,
    output_subject: &str,
    publish_retry: &RetryPolicy,
    reporter: &StatusReporter,
    cancel: &CancellationToken,
) {
    let ingest_ms = job.envelope.ingest_ts.timestamp_millis();

    if !table.observe(&job.key, ingest_ms) {
        metrics::counter!("pipeline_dedup_dropped", "topic" => topic.to_string()).increment(1);
        if let Err(err) = job.message.ack().await {
            warn!(error = %err, "ack of duplicate failed");
        }
        return;
    }

    let msg_id = job.envelope.message_id(output_subject);
    let payload = match serde_json::to_vec(&job.envelope) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "envelope re-serialization failed");
            return;
        }
    };

    let publish = bus.publish_retrying(output_subject, &msg_id, payload, publish_retry);
    tokio::select! {
        _ = cancel.cancelled() => {
            // Redelivery replays the record and first-wins stays intact:
            // the key is already anchored in the table.
        }
        result = publish => {
            match result {
                Ok(_) => {
                    reporter.success();
                    metrics::counter!("pipeline_dedup_emitted", "topic" => topic.to_string())
                        .increment(1);
                    if let Err(err) = job.message.ack().await {
                        warn!(error = %err, "ack of survivor failed");
                    }
                }
                Err(err) => {
                    reporter.state(OperatorState::Unhealthy);
                    reporter.error(&err);
                    if let Err(err) = job.message.nak(Some(Duration::from_secs(1))).await {
                        warn!(error = %err, "nak failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MINUTE_MS: i64 = 60_000;

    #[test]
    fn first_wins_within_window() {
        let mut table = DedupTable::new(Duration::from_secs(3600));
        assert!(table.observe("A", 0));
        assert!(!table.observe("A", MINUTE_MS));
        assert!(table.observe("B", 3 * MINUTE_MS));
        assert!(!table.observe("A", 30 * MINUTE_MS));
    }

    #[test]
    fn window_expiry_reopens_the_key() {
        let mut table = DedupTable::new(Duration::from_secs(3600));
        assert!(table.observe("A", 0));
        // Two hours later the window has elapsed: the key is emitted again.
        assert!(table.observe("A", 120 * MINUTE_MS));
        assert!(!table.observe("A", 121 * MINUTE_MS));
    }

    #[test]
    fn eviction_prunes_expired_entries_only() {
        let mut table = DedupTable::new(Duration::from_secs(60));
        table.observe("old", 0);
        table.observe("fresh", 90_000);
        assert_eq!(table.evict(120_000), 1);
        assert_eq!(table.len(), 1);
        assert!(!table.observe("fresh", 100_000));
        // "old" was evicted, so it reads as first again.
        assert!(table.observe("old", 121_000));
    }

    #[test]
    fn high_watermark_tracks_peak_size() {
        let mut table = DedupTable::new(Duration::from_secs(60));
        for i in 0..10 {
            table.observe(&format!("k{i}"), 0);
        }
        table.evict(120_000);
        assert_eq!(table.len(), 0);
        assert_eq!(table.high_watermark(), 10);
    }

    #[test]
    fn shard_routing_is_stable_and_in_range() {
        for shards in [1usize, 4, 8] {
            for key in ["a", "b", "user-123", ""] {
                let first = shard_for(key, shards);
                assert!(first < shards);
                assert_eq!(first, shard_for(key, shards));
            }
        }
    }

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(sweep_interval(Duration::from_secs(3600)), Duration::from_secs(1));
        assert_eq!(
            sweep_interval(Duration::from_secs(8)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn key_extraction_respects_types() {
        let payload = json!({"event_id": "A", "count": 3, "nested": {"flag": true}});

        assert_eq!(
            extract_key(&payload, "event_id", KeyType::String).as_deref(),
            Ok("A")
        );
        assert_eq!(
            extract_key(&payload, "count", KeyType::Int).as_deref(),
            Ok("3")
        );
        assert_eq!(
            extract_key(&payload, "nested.flag", KeyType::Bool).as_deref(),
            Ok("true")
        );
        assert!(extract_key(&payload, "event_id", KeyType::Int).is_err());
        assert!(extract_key(&payload, "missing", KeyType::String).is_err());
    }
}
