use std::time::Duration;

use envconfig::Envconfig;

pub use common_kafka::config::KafkaTuning;

use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaTuning,

    #[envconfig(from = "NATS_URL", default = "nats://localhost:4222")]
    pub nats_url: String,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub bind_port: u16,

    // Bus stream retention: age in hours, bytes (-1 = unbounded).
    #[envconfig(from = "BUS_STREAM_MAX_AGE_HOURS", default = "168")]
    pub bus_stream_max_age_hours: u64,

    #[envconfig(from = "BUS_STREAM_MAX_BYTES", default = "-1")]
    pub bus_stream_max_bytes: i64,

    #[envconfig(from = "BUS_PUBLISH_MAX_RETRIES", default = "5")]
    pub bus_publish_max_retries: u32,

    #[envconfig(from = "BUS_PUBLISH_INITIAL_BACKOFF_MS", default = "100")]
    pub bus_publish_initial_backoff_ms: u64,

    #[envconfig(from = "BUS_PUBLISH_MAX_BACKOFF_MS", default = "5000")]
    pub bus_publish_max_backoff_ms: u64,

    // Poll granularity for durable-consumer fetches; bounds how quickly
    // workers notice pause/terminate commands while idle.
    #[envconfig(from = "BUS_FETCH_TIMEOUT_MS", default = "1000")]
    pub bus_fetch_timeout_ms: u64,

    #[envconfig(from = "DEDUP_SHARDS", default = "8")]
    pub dedup_shards: usize,

    #[envconfig(from = "JOIN_BUFFER_LIMIT", default = "1000000")]
    pub join_buffer_limit: usize,

    #[envconfig(from = "SINK_MAX_RETRIES", default = "5")]
    pub sink_max_retries: u32,

    #[envconfig(from = "SINK_RETRY_INITIAL_BACKOFF_MS", default = "1000")]
    pub sink_retry_initial_backoff_ms: u64,

    #[envconfig(from = "SINK_RETRY_MAX_BACKOFF_MS", default = "30000")]
    pub sink_retry_max_backoff_ms: u64,

    #[envconfig(from = "SINK_INSERT_TIMEOUT_MS", default = "30000")]
    pub sink_insert_timeout_ms: u64,

    #[envconfig(from = "PAUSE_TIMEOUT_SECS", default = "60")]
    pub pause_timeout_secs: u64,

    #[envconfig(from = "TERMINATE_DRAIN_TIMEOUT_SECS", default = "30")]
    pub terminate_drain_timeout_secs: u64,

    // Refuse to create a second active pipeline. For resource-constrained
    // single-pipeline deployments.
    #[envconfig(from = "SINGLE_ACTIVE_PIPELINE", default = "false")]
    pub single_active_pipeline: bool,

    #[envconfig(from = "LIVENESS_DEADLINE_SECS", default = "30")]
    pub liveness_deadline_secs: u64,
}

impl Config {
    pub fn bus_publish_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.bus_publish_max_retries,
            Duration::from_millis(self.bus_publish_initial_backoff_ms),
            Duration::from_millis(self.bus_publish_max_backoff_ms),
        )
    }

    pub fn sink_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.sink_max_retries,
            Duration::from_millis(self.sink_retry_initial_backoff_ms),
            Duration::from_millis(self.sink_retry_max_backoff_ms),
        )
    }

    pub fn bus_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_fetch_timeout_ms)
    }

    pub fn sink_insert_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_insert_timeout_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }

    pub fn terminate_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_drain_timeout_secs)
    }

    pub fn liveness_deadline(&self) -> Duration {
        Duration::from_secs(self.liveness_deadline_secs)
    }

    pub fn bus_stream_max_age(&self) -> Duration {
        Duration::from_secs(self.bus_stream_max_age_hours * 3600)
    }
}
