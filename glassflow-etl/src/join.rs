//! Two-sided temporal join on a shared key.
//!
//! One fetch task per side feeds a single buffer owner, which keeps the
//! keyed buffers `BL`/`BR` under single-writer discipline. A match within
//! the window emits one joined row; the orientation decides which side's
//! buffer entries survive a match and which side is emitted unpaired when
//! its window expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use health::LivenessHandle;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusMessage, DurableConsumer, MessageBus};
use crate::dlq::DlqWriter;
use crate::envelope::EventEnvelope;
use crate::mapper::extract_field;
use crate::operator::{OperatorCommand, OperatorContext, OperatorState, StatusReporter};
use crate::pipeline_config::Orientation;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Join keys are scalars; the canonical string form keys the buffers.
pub fn canonical_key(payload: &Value, path: &str) -> Result<String, String> {
    let value =
        extract_field(payload, path).ok_or_else(|| format!("join key {path:?} missing"))?;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(format!("join key {path:?} is null")),
        Value::Array(_) | Value::Object(_) => {
            Err(format!("join key {path:?} is not a scalar"))
        }
    }
}

struct Buffered {
    envelope: EventEnvelope,
    arrival_ms: i64,
}

/// An emission from the buffers: a matched pair, or one side alone after
/// window expiry under a left/right orientation.
#[derive(Debug)]
pub struct JoinedPair {
    pub left: Option<EventEnvelope>,
    pub right: Option<EventEnvelope>,
}

pub struct JoinBuffers {
    window_ms: i64,
    orientation: Orientation,
    left: HashMap<String, Buffered>,
    right: HashMap<String, Buffered>,
    high_watermark: usize,
}

impl JoinBuffers {
    pub fn new(window: Duration, orientation: Orientation) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            orientation,
            left: HashMap::new(),
            right: HashMap::new(),
            high_watermark: 0,
        }
    }

    /// Handles one arrival. Pairs with the opposite buffer when the ingest
    /// times are within the window, otherwise buffers the event (a newer
    /// event replaces an older one with the same key, without emission).
    ///
    /// The outer side of a left/right join keeps its matched entry so it can
    /// pair again; the other side's entry is consumed by the match.
    pub fn on_event(
        &mut self,
        side: Side,
        key: &str,
        envelope: EventEnvelope,
        now_ms: i64,
    ) -> Option<JoinedPair> {
        let window_ms = self.window_ms;
        let (opposite, keep_opposite) = match side {
            Side::Left => (&mut self.right, self.orientation == Orientation::Right),
            Side::Right => (&mut self.left, self.orientation == Orientation::Left),
        };

        let matched = opposite.get(key).is_some_and(|candidate| {
            (envelope.ingest_ts.timestamp_millis()
                - candidate.envelope.ingest_ts.timestamp_millis())
            .abs()
                <= window_ms
        });

        if matched {
            let opposite_envelope = if keep_opposite {
                opposite.get(key).map(|buffered| buffered.envelope.clone())
            } else {
                opposite.remove(key).map(|buffered| buffered.envelope)
            };
            if let Some(opposite_envelope) = opposite_envelope {
                let pair = match side {
                    Side::Left => JoinedPair {
                        left: Some(envelope),
                        right: Some(opposite_envelope),
                    },
                    Side::Right => JoinedPair {
                        left: Some(opposite_envelope),
                        right: Some(envelope),
                    },
                };
                return Some(pair);
            }
        }

        let own = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        own.insert(
            key.to_string(),
            Buffered {
                envelope,
                arrival_ms: now_ms,
            },
        );
        self.high_watermark = self.high_watermark.max(self.len());
        None
    }

    /// Removes entries older than the window. Under a left/right
    /// orientation the expiring outer-side entries come back as unpaired
    /// rows; everything else is dropped silently.
    pub fn evict(&mut self, now_ms: i64) -> Vec<JoinedPair> {
        let window_ms = self.window_ms;
        let mut emissions = Vec::new();

        let expired_left: Vec<String> = self
            .left
            .iter()
            .filter(|(_, buffered)| now_ms - buffered.arrival_ms > window_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired_left {
            if let Some(buffered) = self.left.remove(&key) {
                if self.orientation == Orientation::Left {
                    emissions.push(JoinedPair {
                        left: Some(buffered.envelope),
                        right: None,
                    });
                }
            }
        }

        let expired_right: Vec<String> = self
            .right
            .iter()
            .filter(|(_, buffered)| now_ms - buffered.arrival_ms > window_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired_right {
            if let Some(buffered) = self.right.remove(&key) {
                if self.orientation == Orientation::Right {
                    emissions.push(JoinedPair {
                        left: None,
                        right: Some(buffered.envelope),
                    });
                }
            }
        }

        emissions
    }

    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }
}

struct SideJob {
    side: Side,
    message: BusMessage,
    envelope: EventEnvelope,
    key: String,
}

/// Everything one side of the join needs: its topic, its durable consumer
/// and the key path within that topic's payloads.
pub struct JoinSide {
    pub topic: String,
    pub consumer: DurableConsumer,
    pub join_key: String,
    pub source_stream: String,
}

pub struct JoinWorker {
    pipeline_id: String,
    left: JoinSide,
    right: JoinSide,
    window: Duration,
    orientation: Orientation,
    bus: MessageBus,
    output_subject: String,
    dlq: DlqWriter,
    publish_retry: RetryPolicy,
    buffer_limit: usize,
    fetch_timeout: Duration,
    ctx: OperatorContext,
    cancel: CancellationToken,
    liveness: LivenessHandle,
    liveness_deadline: Duration,
}

impl JoinWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: &str,
        left: JoinSide,
        right: JoinSide,
        window: Duration,
        orientation: Orientation,
        bus: MessageBus,
        output_subject: String,
        dlq: DlqWriter,
        publish_retry: RetryPolicy,
        buffer_limit: usize,
        fetch_timeout: Duration,
        ctx: OperatorContext,
        cancel: CancellationToken,
        liveness: LivenessHandle,
        liveness_deadline: Duration,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            left,
            right,
            window,
            orientation,
            bus,
            output_subject,
            dlq,
            publish_retry,
            buffer_limit,
            fetch_timeout,
            ctx,
            cancel,
            liveness,
            liveness_deadline,
        }
    }

    pub async fn run(self) {
        let JoinWorker {
            pipeline_id,
            left,
            right,
            window,
            orientation,
            bus,
            output_subject,
            dlq,
            publish_retry,
            buffer_limit,
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

        info!(
            pipeline_id = %pipeline_id,
            left = %left.topic,
            right = %right.topic,
            ?orientation,
            "joiner starting"
        );

        let left_source_id = left.topic.clone();
        let right_source_id = right.topic.clone();

        let (job_tx, mut job_rx) = mpsc::channel::<SideJob>(256);
        let (paused_tx, paused_rx) = watch::channel(false);

        let mut fetchers = JoinSet::new();
        for (side, join_side) in [(Side::Left, left), (Side::Right, right)] {
            fetchers.spawn(side_fetcher(
                side,
                join_side,
                job_tx.clone(),
                dlq.clone(),
                paused_rx.clone(),
                cancel.child_token(),
                fetch_timeout,
                reporter.clone(),
            ));
        }
        drop(job_tx);

        let mut buffers = JoinBuffers::new(window, orientation);
        let sweep_every = crate::dedup::sweep_interval(window);
        let mut sweep = tokio::time::interval(sweep_every);
        let mut liveness_tick = tokio::time::interval(liveness_deadline / 3);

        reporter.state(OperatorState::Running);

        loop {
            let paused = *paused_rx.borrow();
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = liveness_tick.tick() => {
                    liveness.report_healthy().await;
                    metrics::gauge!(
                        "pipeline_join_buffered_keys",
                        "pipeline" => pipeline_id.clone()
                    )
                    .set(buffers.len() as f64);
                }

                command = commands.recv() => {
                    match command {
                        Some(OperatorCommand::Pause) => {
                            _ = paused_tx.send(true);
                            reporter.state(OperatorState::Paused);
                        }
                        Some(OperatorCommand::Resume) => {
                            _ = paused_tx.send(false);
                            reporter.state(OperatorState::Running);
                        }
                        Some(OperatorCommand::Terminate) | None => break,
                    }
                }

                _ = sweep.tick(), if !paused => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    for pair in buffers.evict(now_ms) {
                        publish_pair(
                            pair,
                            &left_source_id,
                            &right_source_id,
                            &bus,
                            &output_subject,
                            &publish_retry,
                            &reporter,
                            None,
                            &mut buffers,
                        )
                        .await;
                    }
                }

                job = job_rx.recv() => {
                    let Some(job) = job else { break };
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let emitted = buffers.on_event(job.side, &job.key, job.envelope, now_ms);

                    match emitted {
                        Some(pair) => {
                            publish_pair(
                                pair,
                                &left_source_id,
                                &right_source_id,
                                &bus,
                                &output_subject,
                                &publish_retry,
                                &reporter,
                                Some(&job.message),
                                &mut buffers,
                            )
                            .await;
                        }
                        None => {
                            if let Err(err) = job.message.ack().await {
                                warn!(error = %err, "ack of buffered event failed");
                            }
                        }
                    }

                    if buffers.len() > buffer_limit
                        && reporter.current_state() == OperatorState::Running
                    {
                        warn!(
                            pipeline_id = %pipeline_id,
                            buffered = buffers.len(),
                            limit = buffer_limit,
                            "join buffers over limit"
                        );
                        reporter.state(OperatorState::Unhealthy);
                    } else if buffers.len() <= buffer_limit
                        && reporter.current_state() == OperatorState::Unhealthy
                    {
                        reporter.state(OperatorState::Running);
                    }
                }
            }
        }

        reporter.state(OperatorState::Stopping);
        cancel.cancel();
        while fetchers.join_next().await.is_some() {}
        reporter.state(OperatorState::Stopped);
        info!(pipeline_id = %pipeline_id, "joiner stopped");
    }
}

/// Publishes one joined row. For matched pairs the input message is acked
/// on success and nak'd on failure; expiry emissions have no message left
/// to ack, so on failure the envelope goes back into its buffer for the
/// next sweep.
#[allow(clippy::too_many_arguments)]
async fn publish_pair(
    pair: JoinedPair,
    left_source_id: &str,
    right_source_id: &str,
    bus: &MessageBus,
    output_subject: &str,
    publish_retry: &RetryPolicy,
    reporter: &StatusReporter,
    message: Option<&BusMessage>,
    buffers: &mut JoinBuffers,
) {
    let msg_id = pair_message_id(output_subject, &pair);
    let joined = EventEnvelope::joined(
        left_source_id,
        right_source_id,
        pair.left.clone(),
        pair.right.clone(),
    );

    let payload = match serde_json::to_vec(&joined) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "joined envelope serialization failed");
            return;
        }
    };

    match bus
        .publish_retrying(output_subject, &msg_id, payload, publish_retry)
        .await
    {
        Ok(_) => {
            reporter.success();
            let kind = match (&pair.left, &pair.right) {
                (Some(_), Some(_)) => "matched",
                _ => "unpaired",
            };
            metrics::counter!("pipeline_join_emitted", "kind" => kind).increment(1);
            if let Some(message) = message {
                if let Err(err) = message.ack().await {
                    warn!(error = %err, "ack of joined event failed");
                }
            }
        }
        Err(err) => {
            reporter.state(OperatorState::Unhealthy);
            reporter.error(&err);
            match message {
                Some(message) => {
                    if let Err(err) = message.nak(Some(Duration::from_secs(1))).await {
                        warn!(error = %err, "nak failed");
                    }
                }
                None => {
                    // Expiry emission: requeue for the next sweep.
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let (Some(envelope), None) = (&pair.left, &pair.right) {
                        buffers.left.insert(
                            envelope_requeue_key(envelope),
                            Buffered {
                                envelope: envelope.clone(),
                                arrival_ms: now_ms,
                            },
                        );
                    } else if let (None, Some(envelope)) = (&pair.left, &pair.right) {
                        buffers.right.insert(
                            envelope_requeue_key(envelope),
                            Buffered {
                                envelope: envelope.clone(),
                                arrival_ms: now_ms,
                            },
                        );
                    }
                }
            }
        }
    }
}

fn envelope_requeue_key(envelope: &EventEnvelope) -> String {
    format!("requeued/{}/{}", envelope.partition, envelope.kafka_offset)
}

fn pair_message_id(subject: &str, pair: &JoinedPair) -> String {
    let side = |envelope: &Option<EventEnvelope>| match envelope {
        Some(e) => format!("{}-{}", e.partition, e.kafka_offset),
        None => "null".to_string(),
    };
    format!("{subject}/{}/{}", side(&pair.left), side(&pair.right))
}

#[allow(clippy::too_many_arguments)]
async fn side_fetcher(
    side: Side,
    mut join_side: JoinSide,
    jobs: mpsc::Sender<SideJob>,
    dlq: DlqWriter,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    fetch_timeout: Duration,
    reporter: Arc<StatusReporter>,
) {
    loop {
        if *paused.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
            }
        }

        let batch = tokio::select! {
            _ = cancel.cancelled() => return,
            batch = join_side.consumer.fetch(64, fetch_timeout) => batch,
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                warn!(topic = %join_side.topic, error = %err, "join fetch failed");
                reporter.error(&err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Ok(pending) = join_side.consumer.pending().await {
            reporter.backlog(pending);
        }

        for message in batch {
            let envelope: EventEnvelope = match serde_json::from_slice(message.payload()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable bus message");
                    if let Err(err) = message.term().await {
                        warn!(error = %err, "term failed");
                    }
                    continue;
                }
            };

            let key = match canonical_key(&envelope.payload_json, &join_side.join_key) {
                Ok(key) => key,
                Err(reason) => {
                    match dlq
                        .publish("joiner", &join_side.source_stream, envelope, reason)
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
                    continue;
                }
            };

            if jobs
                .send(SideJob {
                    side,
                    message,
                    envelope,
                    key,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(source: &str, offset: i64, ingest_ms: i64, payload: Value) -> EventEnvelope {
        let mut envelope = EventEnvelope::from_record(
            source,
            0,
            offset,
            None,
            payload.to_string().as_bytes(),
        );
        envelope.ingest_ts = chrono::DateTime::from_timestamp_millis(ingest_ms).unwrap();
        envelope
    }

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn inner_join_pairs_within_window() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(3600), Orientation::Inner);

        let left = envelope("users", 1, 0, json!({"user_id": 123, "name": "John"}));
        assert!(buffers.on_event(Side::Left, "123", left, 0).is_none());

        let right = envelope("emails", 1, 10_000, json!({"user_id": 123, "email": "j@x"}));
        let pair = buffers.on_event(Side::Right, "123", right, 10_000).unwrap();

        assert!(pair.left.is_some());
        assert!(pair.right.is_some());
        // Inner joins consume both entries.
        assert!(buffers.is_empty());
    }

    #[test]
    fn out_of_window_events_do_not_pair() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(3600), Orientation::Inner);

        let left = envelope("users", 1, 0, json!({"k": 1}));
        buffers.on_event(Side::Left, "1", left, 0);

        let right = envelope("emails", 1, 2 * HOUR_MS, json!({"k": 1}));
        assert!(buffers
            .on_event(Side::Right, "1", right, 2 * HOUR_MS)
            .is_none());
        // Both sides now buffered, no emission.
        assert_eq!(buffers.len(), 2);
    }

    #[test]
    fn inner_eviction_is_silent() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(60), Orientation::Inner);
        buffers.on_event(Side::Left, "1", envelope("users", 1, 0, json!({})), 0);

        let emissions = buffers.evict(2 * 60_000);
        assert!(emissions.is_empty());
        assert!(buffers.is_empty());
    }

    #[test]
    fn left_orientation_emits_unpaired_left_on_expiry() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(60), Orientation::Left);
        buffers.on_event(
            Side::Left,
            "1",
            envelope("users", 7, 0, json!({"name": "John"})),
            0,
        );
        buffers.on_event(Side::Right, "other", envelope("emails", 9, 0, json!({})), 0);

        let emissions = buffers.evict(2 * 60_000);
        assert_eq!(emissions.len(), 1);
        let pair = &emissions[0];
        assert_eq!(pair.left.as_ref().unwrap().kafka_offset, 7);
        assert!(pair.right.is_none());
        assert!(buffers.is_empty());
    }

    #[test]
    fn right_orientation_keeps_right_entry_across_matches() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(3600), Orientation::Right);

        buffers.on_event(Side::Right, "1", envelope("emails", 1, 0, json!({})), 0);

        let first = buffers.on_event(Side::Left, "1", envelope("users", 2, 1000, json!({})), 1000);
        assert!(first.is_some());

        // The right entry stayed, so a second left event pairs again.
        let second =
            buffers.on_event(Side::Left, "1", envelope("users", 3, 2000, json!({})), 2000);
        assert!(second.is_some());
    }

    #[test]
    fn inner_match_consumes_the_buffered_entry() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(3600), Orientation::Inner);

        buffers.on_event(Side::Right, "1", envelope("emails", 1, 0, json!({})), 0);
        assert!(buffers
            .on_event(Side::Left, "1", envelope("users", 2, 1000, json!({})), 1000)
            .is_some());

        // Entry consumed: the next left event buffers instead of pairing.
        assert!(buffers
            .on_event(Side::Left, "1", envelope("users", 3, 2000, json!({})), 2000)
            .is_none());
    }

    #[test]
    fn same_side_duplicate_replaces_without_emission() {
        let mut buffers = JoinBuffers::new(Duration::from_secs(3600), Orientation::Inner);

        buffers.on_event(Side::Left, "1", envelope("users", 1, 0, json!({})), 0);
        assert!(buffers
            .on_event(Side::Left, "1", envelope("users", 2, 1000, json!({})), 1000)
            .is_none());
        assert_eq!(buffers.len(), 1);

        // The newer entry is the one that pairs.
        let pair = buffers
            .on_event(Side::Right, "1", envelope("emails", 9, 1500, json!({})), 1500)
            .unwrap();
        assert_eq!(pair.left.as_ref().unwrap().kafka_offset, 2);
    }

    #[test]
    fn canonical_key_forms() {
        let payload = json!({"id": 42, "name": "x", "ok": true, "nested": {"deep": 7}});
        assert_eq!(canonical_key(&payload, "id").as_deref(), Ok("42"));
        assert_eq!(canonical_key(&payload, "name").as_deref(), Ok("x"));
        assert_eq!(canonical_key(&payload, "ok").as_deref(), Ok("true"));
        assert_eq!(canonical_key(&payload, "nested.deep").as_deref(), Ok("7"));
        assert!(canonical_key(&payload, "nested").is_err());
        assert!(canonical_key(&payload, "missing").is_err());
    }
}
