//! Shared helpers for the integration suites. These tests drive live
//! Kafka, NATS and ClickHouse instances on localhost (docker-compose) and
//! are serialized through a global mutex so consumer groups and streams do
//! not interfere.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use envconfig::Envconfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use uuid::Uuid;

use glassflow_etl::bus::MessageBus;
use glassflow_etl::config::Config;
use glassflow_etl::mapper::ColumnType;
use glassflow_etl::pipeline_config::{
    ColumnMapping, DeduplicationConfig, InitialOffsetSpec, JoinConfig, JoinKind, JoinSourceSpec,
    KeyType, Orientation, PipelineConfig, SinkConfig, SourceConfig, SourceKind, TopicSpec,
};
use glassflow_etl::PipelineManager;

use common_kafka::config::{KafkaAuth, KafkaConnection, SecurityProtocol};
use health::LivenessRegistry;

pub const KAFKA_BROKERS: &str = "localhost:9092";
pub const NATS_URL: &str = "nats://localhost:4222";
pub const CLICKHOUSE_URL: &str = "http://localhost:8123";

static TEST_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes integration tests that share Kafka/NATS/ClickHouse.
pub fn lock() -> MutexGuard<'static, ()> {
    TEST_MUTEX
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..12])
}

pub async fn create_topics(topics: Vec<&str>) -> anyhow::Result<()> {
    let admin_client: AdminClient<_> = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .create()?;

    let new_topics: Vec<NewTopic> = topics
        .into_iter()
        .map(|topic| NewTopic::new(topic, 1, TopicReplication::Fixed(1)))
        .collect();

    let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));
    // Existing topics are fine.
    drop(admin_client.create_topics(&new_topics, &opts).await);
    Ok(())
}

pub async fn produce_json(
    topic: &str,
    messages: Vec<serde_json::Value>,
) -> anyhow::Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("message.timeout.ms", "5000")
        .create()?;

    for message in messages {
        let payload = message.to_string();
        let record = FutureRecord::<str, str>::to(topic).payload(&payload);
        producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to produce: {e}"))?;
    }
    Ok(())
}

pub async fn produce_raw(topic: &str, payload: &str) -> anyhow::Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("message.timeout.ms", "5000")
        .create()?;
    let record = FutureRecord::<str, str>::to(topic).payload(payload);
    producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
        .map_err(|(e, _)| anyhow::anyhow!("failed to produce: {e}"))?;
    Ok(())
}

pub fn clickhouse_client() -> clickhouse::Client {
    clickhouse::Client::default()
        .with_url(CLICKHOUSE_URL)
        .with_database("default")
}

pub async fn exec_ddl(sql: &str) -> anyhow::Result<()> {
    clickhouse_client().query(sql).execute().await?;
    Ok(())
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct CountRow {
    n: u64,
}

pub async fn count_rows(table: &str) -> anyhow::Result<u64> {
    let row: CountRow = clickhouse_client()
        .query(&format!("SELECT count() AS n FROM {table}"))
        .fetch_one()
        .await?;
    Ok(row.n)
}

/// Polls `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

pub fn service_config() -> Config {
    Config::init_from_env().expect("service config from defaults")
}

pub async fn manager() -> PipelineManager {
    let bus = MessageBus::connect(NATS_URL).await.expect("bus connect");
    PipelineManager::new(service_config(), bus, LivenessRegistry::new("test-liveness"))
        .await
        .expect("manager")
}

pub fn kafka_connection() -> KafkaConnection {
    KafkaConnection {
        brokers: vec![KAFKA_BROKERS.to_string()],
        protocol: SecurityProtocol::Plaintext,
        auth: KafkaAuth::default(),
    }
}

pub fn topic_spec(name: &str) -> TopicSpec {
    TopicSpec {
        name: name.to_string(),
        initial_offset: InitialOffsetSpec::Earliest,
        partitions: Some(1),
        deduplication: None,
    }
}

pub fn dedup_spec(key_path: &str, window: Duration) -> DeduplicationConfig {
    DeduplicationConfig {
        enabled: true,
        key_path: key_path.to_string(),
        key_type: KeyType::String,
        window,
    }
}

pub fn sink_spec(table: &str, mappings: Vec<ColumnMapping>) -> SinkConfig {
    SinkConfig {
        host: "localhost".to_string(),
        port: 8123,
        database: "default".to_string(),
        table: table.to_string(),
        username: None,
        password: None,
        secure: false,
        skip_verify: false,
        column_mappings: mappings,
        max_batch_size: 1000,
        max_delay_time: Duration::from_secs(1),
    }
}

pub fn mapping(source: &str, field: &str, column: &str, ty: ColumnType) -> ColumnMapping {
    ColumnMapping {
        source_id: source.to_string(),
        field_name: field.to_string(),
        column_name: column.to_string(),
        column_type: ty,
        nullable: false,
    }
}

pub fn nullable_mapping(source: &str, field: &str, column: &str, ty: ColumnType) -> ColumnMapping {
    ColumnMapping {
        source_id: source.to_string(),
        field_name: field.to_string(),
        column_name: column.to_string(),
        column_type: ty,
        nullable: true,
    }
}

pub fn single_topic_pipeline(
    pipeline_id: &str,
    topic: TopicSpec,
    sink: SinkConfig,
) -> PipelineConfig {
    PipelineConfig {
        pipeline_id: pipeline_id.to_string(),
        name: format!("test pipeline {pipeline_id}"),
        source: SourceConfig {
            kind: SourceKind::Kafka,
            connection: kafka_connection(),
            topics: vec![topic],
        },
        join: None,
        sink,
        schema_versions: Default::default(),
    }
}

pub fn join_pipeline(
    pipeline_id: &str,
    left: TopicSpec,
    right: TopicSpec,
    join_key: &str,
    window: Duration,
    orientation: Orientation,
    sink: SinkConfig,
) -> PipelineConfig {
    let sources = vec![
        JoinSourceSpec {
            source_id: left.name.clone(),
            join_key: join_key.to_string(),
            time_window: window,
            orientation,
        },
        JoinSourceSpec {
            source_id: right.name.clone(),
            join_key: join_key.to_string(),
            time_window: window,
            orientation,
        },
    ];
    PipelineConfig {
        pipeline_id: pipeline_id.to_string(),
        name: format!("test join pipeline {pipeline_id}"),
        source: SourceConfig {
            kind: SourceKind::Kafka,
            connection: kafka_connection(),
            topics: vec![left, right],
        },
        join: Some(JoinConfig {
            enabled: true,
            kind: JoinKind::Temporal,
            sources,
        }),
        sink,
        schema_versions: Default::default(),
    }
}
