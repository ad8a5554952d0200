//! Deterministic bus naming for one pipeline.
//!
//! Stream and consumer names are derived from the pipeline id alone so that
//! a restarted process reattaches to the exact same durable state. Renaming
//! anything here strands in-flight messages, so the scheme is covered by
//! bit-exact tests.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Key-value bucket holding pipeline configs and last-known states.
pub const PIPELINES_BUCKET: &str = "gf-pipelines";

/// Stable 8-hex-digit tag for consumer names, derived from the pipeline id.
pub fn short_id(pipeline_id: &str) -> String {
    let mut hasher = SipHasher13::new();
    hasher.write(pipeline_id.as_bytes());
    format!("{:08x}", hasher.finish() as u32)
}

pub fn input_stream(pipeline_id: &str, topic: &str) -> String {
    format!("gf-{pipeline_id}-{topic}")
}

pub fn input_subject(pipeline_id: &str, topic: &str) -> String {
    format!("gf-{pipeline_id}-{topic}.input")
}

pub fn dedup_subject(pipeline_id: &str, topic: &str) -> String {
    format!("gf-{pipeline_id}-{topic}.dedup")
}

pub fn consumer_group(pipeline_id: &str) -> String {
    format!("glassflow-consumer-group-{pipeline_id}")
}

pub fn joined_stream(pipeline_id: &str) -> String {
    format!("gf-{pipeline_id}-joined")
}

pub fn joined_subject(pipeline_id: &str) -> String {
    format!("gf-{pipeline_id}-joined.out")
}

pub fn join_left_consumer(pipeline_id: &str) -> String {
    format!("gf-nats-jl-{}", short_id(pipeline_id))
}

pub fn join_right_consumer(pipeline_id: &str) -> String {
    format!("gf-nats-jr-{}", short_id(pipeline_id))
}

pub fn sink_consumer(pipeline_id: &str) -> String {
    format!("gf-nats-si-{}", short_id(pipeline_id))
}

/// The dedup consumer is per topic; the topic keeps the two dedup durables
/// of a two-topic pipeline apart.
pub fn dedup_consumer(pipeline_id: &str, topic: &str) -> String {
    format!("gf-nats-dd-{}-{topic}", short_id(pipeline_id))
}

pub fn dlq_stream(pipeline_id: &str) -> String {
    format!("gf-{pipeline_id}-DLQ")
}

pub fn dlq_subject(pipeline_id: &str) -> String {
    format!("gf-{pipeline_id}-DLQ.failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_scheme_is_bit_exact() {
        assert_eq!(input_stream("p1", "users"), "gf-p1-users");
        assert_eq!(input_subject("p1", "users"), "gf-p1-users.input");
        assert_eq!(dedup_subject("p1", "users"), "gf-p1-users.dedup");
        assert_eq!(consumer_group("p1"), "glassflow-consumer-group-p1");
        assert_eq!(joined_stream("p1"), "gf-p1-joined");
        assert_eq!(joined_subject("p1"), "gf-p1-joined.out");
        assert_eq!(dlq_stream("p1"), "gf-p1-DLQ");
        assert_eq!(dlq_subject("p1"), "gf-p1-DLQ.failed");
    }

    #[test]
    fn short_id_is_stable_and_hex() {
        let a = short_id("pipeline-a");
        let b = short_id("pipeline-a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_id_distinguishes_pipelines() {
        assert_ne!(short_id("pipeline-a"), short_id("pipeline-b"));
    }

    #[test]
    fn consumer_names_carry_the_short_id() {
        let short = short_id("p1");
        assert_eq!(join_left_consumer("p1"), format!("gf-nats-jl-{short}"));
        assert_eq!(join_right_consumer("p1"), format!("gf-nats-jr-{short}"));
        assert_eq!(sink_consumer("p1"), format!("gf-nats-si-{short}"));
    }
}
