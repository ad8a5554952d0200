use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bus message carrying one source record plus its origin coordinates.
/// Built once by the ingestor and preserved verbatim across dedup, so a
/// replayed message dedups and joins the same way it did the first time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub source_id: String,
    pub ingest_ts: DateTime<Utc>,
    pub kafka_offset: i64,
    pub partition: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_bytes: Option<Vec<u8>>,
    pub payload_json: Value,
    /// Set when the Kafka payload was not valid JSON; `payload_json` then
    /// holds the raw bytes as a lossy string and the sink routes the record
    /// to the DLQ.
    #[serde(default)]
    pub parse_error: bool,
}

/// Source id used on envelopes produced by the joiner.
pub const JOINED_SOURCE_ID: &str = "joined";

impl EventEnvelope {
    pub fn from_record(
        source_id: &str,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: &[u8],
    ) -> Self {
        let (payload_json, parse_error) = match serde_json::from_slice::<Value>(payload) {
            Ok(value) => (value, false),
            Err(_) => (Value::String(String::from_utf8_lossy(payload).into_owned()), true),
        };

        Self {
            source_id: source_id.to_string(),
            ingest_ts: Utc::now(),
            kafka_offset: offset,
            partition,
            key_bytes: key,
            payload_json,
            parse_error,
        }
    }

    /// Merges a matched (or half-matched) pair into the joined envelope.
    /// The payload keys the two sides by their source ids; an unpaired side
    /// is present as `null` so the sink's nullability rules apply.
    pub fn joined(
        left_source_id: &str,
        right_source_id: &str,
        left: Option<EventEnvelope>,
        right: Option<EventEnvelope>,
    ) -> Self {
        let parse_error = left.as_ref().map(|e| e.parse_error).unwrap_or(false)
            || right.as_ref().map(|e| e.parse_error).unwrap_or(false);
        let ingest_ts = match (&left, &right) {
            (Some(l), Some(r)) => l.ingest_ts.max(r.ingest_ts),
            (Some(l), None) => l.ingest_ts,
            (None, Some(r)) => r.ingest_ts,
            (None, None) => Utc::now(),
        };
        let anchor = left.as_ref().or(right.as_ref());
        let (kafka_offset, partition) = anchor
            .map(|e| (e.kafka_offset, e.partition))
            .unwrap_or((-1, -1));

        let payload_json = serde_json::json!({
            left_source_id: left.map(|e| e.payload_json).unwrap_or(Value::Null),
            right_source_id: right.map(|e| e.payload_json).unwrap_or(Value::Null),
        });

        Self {
            source_id: JOINED_SOURCE_ID.to_string(),
            ingest_ts,
            kafka_offset,
            partition,
            key_bytes: None,
            payload_json,
            parse_error,
        }
    }

    /// Bus message id used for server-side duplicate suppression when the
    /// publish is retried. Scoped per subject so a dedup republish is not
    /// swallowed as a duplicate of the ingest publish.
    pub fn message_id(&self, subject: &str) -> String {
        format!("{subject}/{}/{}", self.partition, self.kafka_offset)
    }
}

/// One rejected record, as published on the pipeline's DLQ subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub pipeline_id: String,
    pub source_stream: String,
    pub failing_operator: String,
    pub reason: String,
    pub ts: DateTime<Utc>,
    pub original_envelope: EventEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_valid_json() {
        let envelope =
            EventEnvelope::from_record("users", 2, 42, Some(b"k".to_vec()), br#"{"id": 1}"#);
        assert_eq!(envelope.source_id, "users");
        assert_eq!(envelope.partition, 2);
        assert_eq!(envelope.kafka_offset, 42);
        assert!(!envelope.parse_error);
        assert_eq!(envelope.payload_json["id"], 1);
    }

    #[test]
    fn tags_malformed_json() {
        let envelope = EventEnvelope::from_record("users", 0, 7, None, b"not json {");
        assert!(envelope.parse_error);
        assert_eq!(
            envelope.payload_json,
            serde_json::Value::String("not json {".to_string())
        );
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope::from_record("users", 1, 9, None, br#"{"a":true}"#);
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.source_id, "users");
        assert_eq!(back.kafka_offset, 9);
        assert_eq!(back.payload_json, envelope.payload_json);
    }

    #[test]
    fn joined_payload_keys_sides_by_source() {
        let left = EventEnvelope::from_record("users", 0, 1, None, br#"{"name":"John"}"#);
        let right = EventEnvelope::from_record("emails", 0, 5, None, br#"{"email":"j@x"}"#);
        let joined = EventEnvelope::joined("users", "emails", Some(left), Some(right));

        assert_eq!(joined.source_id, JOINED_SOURCE_ID);
        assert_eq!(joined.payload_json["users"]["name"], "John");
        assert_eq!(joined.payload_json["emails"]["email"], "j@x");
    }

    #[test]
    fn unpaired_side_is_null() {
        let left = EventEnvelope::from_record("users", 0, 1, None, br#"{"name":"John"}"#);
        let joined = EventEnvelope::joined("users", "emails", Some(left), None);

        assert_eq!(joined.payload_json["users"]["name"], "John");
        assert!(joined.payload_json["emails"].is_null());
        assert_eq!(joined.kafka_offset, 1);
    }

    #[test]
    fn message_id_is_subject_scoped() {
        let envelope = EventEnvelope::from_record("users", 3, 17, None, br#"{}"#);
        assert_eq!(
            envelope.message_id("gf-p1-users.input"),
            "gf-p1-users.input/3/17"
        );
        assert_ne!(
            envelope.message_id("gf-p1-users.input"),
            envelope.message_id("gf-p1-users.dedup")
        );
    }
}
