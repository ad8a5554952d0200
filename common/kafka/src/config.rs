use envconfig::Envconfig;
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

/// Service-wide Kafka tuning knobs. Connection coordinates (brokers,
/// security, topics) are per-pipeline and arrive with the pipeline
/// configuration, not from the environment.
#[derive(Envconfig, Clone)]
pub struct KafkaTuning {
    #[envconfig(default = "6000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "1")]
    pub kafka_fetch_min_bytes: u32,

    #[envconfig(default = "100")]
    pub kafka_fetch_wait_max_ms: u32,

    // Interval between auto-commits of *stored* offsets. Offsets are only
    // stored after downstream durability, so auto-commit never advances
    // past acknowledged work.
    #[envconfig(default = "5000")]
    pub kafka_auto_commit_interval_ms: u32,

    #[envconfig(default = "10000")]
    pub kafka_statistics_interval_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl Default for SecurityProtocol {
    fn default() -> Self {
        SecurityProtocol::Plaintext
    }
}

impl SecurityProtocol {
    fn as_rdkafka(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KafkaAuth {
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    #[serde(default)]
    pub mechanism: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Disable broker certificate verification on TLS protocols.
    #[serde(default)]
    pub skip_verify: bool,
}

/// Per-pipeline broker coordinates, part of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConnection {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub protocol: SecurityProtocol,
    #[serde(default)]
    pub auth: KafkaAuth,
}

impl KafkaConnection {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Applies connection settings onto an rdkafka client config.
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("security.protocol", self.protocol.as_rdkafka());

        if matches!(
            self.protocol,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        ) {
            if let Some(mechanism) = &self.auth.mechanism {
                client_config.set("sasl.mechanism", mechanism);
            }
            if let Some(username) = &self.auth.username {
                client_config.set("sasl.username", username);
            }
            if let Some(password) = &self.auth.password {
                client_config.set("sasl.password", password);
            }
        }

        if matches!(
            self.protocol,
            SecurityProtocol::Ssl | SecurityProtocol::SaslSsl
        ) && self.auth.skip_verify
        {
            client_config.set("enable.ssl.certificate.verification", "false");
        }
    }
}
