// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bindable settings for buffering, decode limits, egress targets and in-process loggers.
//!
//! Every struct deserializes with `serde` and falls back to its defaults for missing keys,
//! so the same types back YAML files and environment overrides. Durations are expressed in
//! seconds (integer or float).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::entry::Severity;
use crate::errors::ConfigError;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_BATCH_AGE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTRIBUTE_COUNT: usize = 128;
pub const DEFAULT_KAFKA_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ELASTICSEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Size and age bounds of one buffering engine
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_batch_size: usize,
    #[serde(deserialize_with = "deserialize_duration_from_seconds")]
    pub max_batch_age: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: DEFAULT_MAX_BATCH_AGE,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_age.is_zero() {
            return Err(ConfigError::Invalid(
                "max_batch_age must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Budgets applied to every decoded log record
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryLimits {
    pub max_attribute_count: usize,
    /// Maximum length in characters of any attribute value or message. `None` is unbounded.
    pub max_attribute_length: Option<usize>,
}

impl Default for TelemetryLimits {
    fn default() -> Self {
        Self {
            max_attribute_count: DEFAULT_MAX_ATTRIBUTE_COUNT,
            max_attribute_length: None,
        }
    }
}

impl TelemetryLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attribute_count == 0 {
            return Err(ConfigError::Invalid(
                "max_attribute_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressType {
    #[default]
    Kafka,
    Elasticsearch,
}

impl fmt::Display for EgressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressType::Kafka => f.write_str("kafka"),
            EgressType::Elasticsearch => f.write_str("elasticsearch"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic_name: String,
    /// When set, entries are buffered and flushed in batches instead of sent per request
    pub batching: Option<BufferConfig>,
    #[serde(deserialize_with = "deserialize_duration_from_seconds")]
    pub message_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            topic_name: String::new(),
            batching: None,
            message_timeout: DEFAULT_KAFKA_MESSAGE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub ingest_url: String,
    pub data_stream_name: String,
    pub batching: Option<BufferConfig>,
    #[serde(deserialize_with = "deserialize_duration_from_seconds")]
    pub timeout: Duration,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            ingest_url: String::new(),
            data_stream_name: String::new(),
            batching: None,
            timeout: DEFAULT_ELASTICSEARCH_TIMEOUT,
        }
    }
}

/// Selects the sink log entries are shipped to
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    #[serde(rename = "type")]
    pub egress_type: EgressType,
    pub kafka: Option<KafkaConfig>,
    pub elasticsearch: Option<ElasticsearchConfig>,
}

impl EgressConfig {
    /// Batching settings of the selected sink, if asynchronous batching is enabled for it
    pub fn batching(&self) -> Option<&BufferConfig> {
        match self.egress_type {
            EgressType::Kafka => self.kafka.as_ref().and_then(|k| k.batching.as_ref()),
            EgressType::Elasticsearch => self
                .elasticsearch
                .as_ref()
                .and_then(|e| e.batching.as_ref()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.egress_type {
            EgressType::Kafka => {
                let kafka = self.kafka.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("egress type is kafka but no kafka section".to_string())
                })?;
                if kafka.bootstrap_servers.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "kafka.bootstrap_servers must not be empty".to_string(),
                    ));
                }
                if kafka.topic_name.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "kafka.topic_name must not be empty".to_string(),
                    ));
                }
            }
            EgressType::Elasticsearch => {
                let elasticsearch = self.elasticsearch.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "egress type is elasticsearch but no elasticsearch section".to_string(),
                    )
                })?;
                if elasticsearch.ingest_url.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "elasticsearch.ingest_url must not be empty".to_string(),
                    ));
                }
                if elasticsearch.data_stream_name.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "elasticsearch.data_stream_name must not be empty".to_string(),
                    ));
                }
            }
        }
        if let Some(batching) = self.batching() {
            batching.validate()?;
        }
        Ok(())
    }
}

/// Options for loggers handed out by [`crate::logger::LoggerFactory`]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggerOptions {
    pub enabled: bool,
    pub minimum_level: Severity,
    /// Defaults to `unknown_service:<process name>`
    pub service_name: Option<String>,
    pub service_version: String,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_level: Severity::Info,
            service_name: None,
            service_version: "1.0.0".to_string(),
        }
    }
}

pub fn deserialize_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(v))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative durations are not allowed"))
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Duration::try_from_secs_f64(v).map_err(|e| E::custom(format!("invalid duration: {e}")))
        }
        // Environment overrides arrive as strings
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let seconds: f64 = v
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid duration in seconds: {v}")))?;
            self.visit_f64(seconds)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}
