//! The declarative pipeline definition, as handed over by the
//! configuration layer. Immutable per pipeline instance; the manager
//! validates it once at create time and persists it verbatim.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common_kafka::config::KafkaConnection;
use common_kafka::consumer::InitialOffset;

use crate::mapper::ColumnType;

/// Longest allowed dedup / join window.
pub const MAX_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub join: Option<JoinConfig>,
    pub sink: SinkConfig,
    /// Declared fields per source topic, newest version per source.
    #[serde(default)]
    pub schema_versions: HashMap<String, SchemaVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub connection: KafkaConnection,
    pub topics: Vec<TopicSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Kafka,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    #[serde(default = "default_initial_offset")]
    pub initial_offset: InitialOffsetSpec,
    /// Partition count hint for sizing; not enforced against the broker.
    #[serde(default)]
    pub partitions: Option<i32>,
    #[serde(default)]
    pub deduplication: Option<DeduplicationConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffsetSpec {
    Earliest,
    Latest,
}

fn default_initial_offset() -> InitialOffsetSpec {
    InitialOffsetSpec::Earliest
}

impl From<InitialOffsetSpec> for InitialOffset {
    fn from(spec: InitialOffsetSpec) -> Self {
        match spec {
            InitialOffsetSpec::Earliest => InitialOffset::Earliest,
            InitialOffsetSpec::Latest => InitialOffset::Latest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dotted path of the dedup key within the payload.
    pub key_path: String,
    pub key_type: KeyType,
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    Int,
    Float,
    Bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: JoinKind,
    /// Exactly two entries: the left side first, then the right.
    pub sources: Vec<JoinSourceSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Temporal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSourceSpec {
    /// Topic name this side reads from.
    pub source_id: String,
    /// Dotted path of the join key within the payload.
    pub join_key: String,
    #[serde(with = "duration_secs")]
    pub time_window: Duration,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Left,
    Right,
    Inner,
}

impl JoinConfig {
    pub fn is_active(&self) -> bool {
        self.enabled
    }

    pub fn left(&self) -> &JoinSourceSpec {
        &self.sources[0]
    }

    pub fn right(&self) -> &JoinSourceSpec {
        &self.sources[1]
    }

    /// The left entry's orientation decides how unpaired rows are emitted.
    pub fn orientation(&self) -> Orientation {
        self.sources[0].orientation
    }

    /// The pairing window; both sides must declare the same.
    pub fn window(&self) -> Duration {
        self.sources[0].time_window
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub skip_verify: bool,
    pub column_mappings: Vec<ColumnMapping>,
    pub max_batch_size: usize,
    #[serde(with = "duration_secs")]
    pub max_delay_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Topic the field comes from; resolves the side of a joined payload.
    pub source_id: String,
    /// Dotted path within that source's payload.
    pub field_name: String,
    pub column_name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl PipelineConfig {
    /// Structural validation, run once before a pipeline is created.
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.pipeline_id.trim().is_empty() {
            return Err("pipeline_id must not be empty".to_string());
        }
        if self
            .pipeline_id
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(format!(
                "pipeline_id {:?} may only contain alphanumerics, '-' and '_'",
                self.pipeline_id
            ));
        }
        if self.source.connection.brokers.is_empty() {
            return Err("source.connection.brokers must not be empty".to_string());
        }
        match self.source.topics.len() {
            1 | 2 => {}
            n => return Err(format!("expected one or two topics, got {n}")),
        }

        let mut seen = std::collections::HashSet::new();
        for topic in &self.source.topics {
            if topic.name.trim().is_empty() {
                return Err("topic name must not be empty".to_string());
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(format!("duplicate topic {:?}", topic.name));
            }
            if let Some(dedup) = &topic.deduplication {
                if dedup.enabled {
                    if dedup.key_path.trim().is_empty() {
                        return Err(format!(
                            "topic {:?}: deduplication.key_path must not be empty",
                            topic.name
                        ));
                    }
                    if dedup.window.is_zero() || dedup.window > MAX_WINDOW {
                        return Err(format!(
                            "topic {:?}: deduplication window must be within (0, 7d]",
                            topic.name
                        ));
                    }
                }
            }
        }

        match (self.join.as_ref().filter(|j| j.is_active()), self.source.topics.len()) {
            (Some(join), 2) => self.validate_join(join)?,
            (Some(_), _) => return Err("join requires two source topics".to_string()),
            (None, 2) => {
                return Err("two source topics require a join configuration".to_string())
            }
            (None, _) => {}
        }

        self.validate_sink()
    }

    fn validate_join(&self, join: &JoinConfig) -> Result<(), String> {
        if join.sources.len() != 2 {
            return Err(format!(
                "join requires exactly two sources, got {}",
                join.sources.len()
            ));
        }
        for source in &join.sources {
            if !self.source.topics.iter().any(|t| t.name == source.source_id) {
                return Err(format!(
                    "join source {:?} is not a configured topic",
                    source.source_id
                ));
            }
            if source.join_key.trim().is_empty() {
                return Err("join_key must not be empty".to_string());
            }
            if source.time_window.is_zero() || source.time_window > MAX_WINDOW {
                return Err("join time_window must be within (0, 7d]".to_string());
            }
        }
        if join.sources[0].source_id == join.sources[1].source_id {
            return Err("join sources must be distinct topics".to_string());
        }
        if join.sources[0].time_window != join.sources[1].time_window {
            return Err("both join sources must declare the same time_window".to_string());
        }
        Ok(())
    }

    fn validate_sink(&self) -> Result<(), String> {
        if self.sink.table.trim().is_empty() {
            return Err("sink.table must not be empty".to_string());
        }
        if self.sink.column_mappings.is_empty() {
            return Err("sink.column_mappings must not be empty".to_string());
        }
        if self.sink.max_batch_size == 0 {
            return Err("sink.max_batch_size must be at least 1".to_string());
        }
        if self.sink.max_delay_time.is_zero() {
            return Err("sink.max_delay_time must be positive".to_string());
        }
        let joined = self.join.as_ref().map(|j| j.is_active()).unwrap_or(false);
        for mapping in &self.sink.column_mappings {
            let known = self
                .source
                .topics
                .iter()
                .any(|t| t.name == mapping.source_id);
            if !known {
                return Err(format!(
                    "column {:?} maps unknown source {:?}",
                    mapping.column_name, mapping.source_id
                ));
            }
            if !joined && mapping.source_id != self.source.topics[0].name {
                return Err(format!(
                    "column {:?} maps source {:?} but the pipeline reads {:?}",
                    mapping.column_name, mapping.source_id, self.source.topics[0].name
                ));
            }
        }
        Ok(())
    }

    /// Whether the given topic has dedup turned on.
    pub fn dedup_for(&self, topic: &str) -> Option<&DeduplicationConfig> {
        self.source
            .topics
            .iter()
            .find(|t| t.name == topic)
            .and_then(|t| t.deduplication.as_ref())
            .filter(|d| d.enabled)
    }

    pub fn join_active(&self) -> bool {
        self.join.as_ref().map(|j| j.is_active()).unwrap_or(false)
    }
}
