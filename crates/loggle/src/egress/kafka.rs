// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::egress::{EgressOutcome, EgressSink, LogDocument};
use crate::entry::{LogRecordEntry, ResourceContext};
use crate::errors::EgressError;

/// Delivery failure for a single message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProduceError {
    /// No broker could be reached, so nothing in the batch can be delivered
    #[error("Broker unreachable: {0}")]
    BrokerUnavailable(String),

    /// The broker refused this message only
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Minimal producer surface used by [`KafkaEgress`]. Resolves once the broker has
/// acknowledged the message or delivery definitively failed.
#[async_trait]
pub trait KafkaProducer: Send + Sync {
    async fn produce(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), ProduceError>;
}

/// Produces one message per entry with a fresh UUID key and the JSON document as value
pub struct KafkaEgress {
    producer: Arc<dyn KafkaProducer>,
    topic: String,
}

impl KafkaEgress {
    pub fn new(producer: Arc<dyn KafkaProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    #[cfg(feature = "kafka")]
    pub fn from_config(config: &KafkaConfig) -> Result<Self, EgressError> {
        let producer = rd::RdKafkaProducer::new(config)?;
        Ok(Self::new(Arc::new(producer), config.topic_name.clone()))
    }

    #[cfg(not(feature = "kafka"))]
    pub fn from_config(_config: &KafkaConfig) -> Result<Self, EgressError> {
        Err(EgressError::Configuration(
            "kafka egress requires the `kafka` feature".to_string(),
        ))
    }
}

#[async_trait]
impl EgressSink for KafkaEgress {
    async fn send(
        &self,
        batch: Vec<LogRecordEntry>,
        resource: &ResourceContext,
    ) -> Result<EgressOutcome, EgressError> {
        let attempted = batch.len();
        let messages = batch
            .iter()
            .map(|entry| {
                LogDocument::new(entry, resource)
                    .to_json()
                    .map(|payload| (Uuid::new_v4().to_string(), payload))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let deliveries = join_all(
            messages
                .iter()
                .map(|(key, payload)| self.producer.produce(&self.topic, key, payload)),
        )
        .await;

        let mut failed = 0;
        let mut unreachable = None;
        for delivery in deliveries {
            match delivery {
                Ok(()) => {}
                Err(ProduceError::BrokerUnavailable(reason)) => {
                    failed += 1;
                    unreachable.get_or_insert(reason);
                }
                Err(ProduceError::Rejected(reason)) => {
                    failed += 1;
                    debug!("EGRESS | Kafka rejected message: {reason}");
                }
            }
        }

        if let Some(reason) = unreachable {
            error!(
                "EGRESS | Kafka brokers unreachable, {failed} of {attempted} messages undelivered: {reason}"
            );
            return Err(EgressError::BrokerUnavailable(reason));
        }
        if failed > 0 {
            warn!(
                "EGRESS | Kafka failed to deliver {failed} of {attempted} messages to {}",
                self.topic
            );
        } else {
            debug!("EGRESS | Kafka delivered {attempted} messages to {}", self.topic);
        }

        Ok(EgressOutcome::new(attempted, failed))
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}

#[cfg(feature = "kafka")]
mod rd {
    use std::time::Duration;

    use async_trait::async_trait;
    use rdkafka::config::ClientConfig;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;

    use super::{KafkaProducer, ProduceError};
    use crate::config::KafkaConfig;
    use crate::errors::EgressError;

    pub struct RdKafkaProducer {
        producer: FutureProducer,
        queue_timeout: Duration,
    }

    impl RdKafkaProducer {
        pub fn new(config: &KafkaConfig) -> Result<Self, EgressError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &config.bootstrap_servers)
                .set(
                    "message.timeout.ms",
                    config.message_timeout.as_millis().to_string(),
                )
                .create()
                .map_err(|e| {
                    EgressError::Configuration(format!("unable to create kafka producer: {e}"))
                })?;
            Ok(Self {
                producer,
                queue_timeout: config.message_timeout,
            })
        }
    }

    fn classify(err: KafkaError) -> ProduceError {
        match err.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::MessageTimedOut,
            ) => ProduceError::BrokerUnavailable(err.to_string()),
            _ => ProduceError::Rejected(err.to_string()),
        }
    }

    #[async_trait]
    impl KafkaProducer for RdKafkaProducer {
        async fn produce(
            &self,
            topic: &str,
            key: &str,
            payload: &[u8],
        ) -> Result<(), ProduceError> {
            let record = FutureRecord::to(topic).key(key).payload(payload);
            match self
                .producer
                .send(record, Timeout::After(self.queue_timeout))
                .await
            {
                Ok(_) => Ok(()),
                Err((err, _message)) => Err(classify(err)),
            }
        }
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry::Severity;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProducer {
        messages: Mutex<Vec<(String, String, Vec<u8>)>>,
        // Indexes of messages that fail, and how
        failures: Vec<(usize, ProduceError)>,
    }

    #[async_trait]
    impl KafkaProducer for RecordingProducer {
        async fn produce(
            &self,
            topic: &str,
            key: &str,
            payload: &[u8],
        ) -> Result<(), ProduceError> {
            let index = {
                let mut messages = self.messages.lock().unwrap();
                messages.push((topic.to_string(), key.to_string(), payload.to_vec()));
                messages.len() - 1
            };
            match self.failures.iter().find(|(i, _)| *i == index) {
                Some((_, err)) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn batch(size: usize) -> Vec<LogRecordEntry> {
        (0..size)
            .map(|i| LogRecordEntry::new(Severity::Error, format!("boom {i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_one_message_per_entry_with_unique_keys() {
        let producer = Arc::new(RecordingProducer::default());
        let sink = KafkaEgress::new(producer.clone(), "logs");
        let resource = ResourceContext {
            service_name: Some("svc-k".to_string()),
            ..ResourceContext::default()
        };

        let outcome = sink.send(batch(3), &resource).await.unwrap();
        assert_eq!(outcome, EgressOutcome::new(3, 0));

        let messages = producer.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|(topic, _, _)| topic == "logs"));
        assert_ne!(messages[0].1, messages[1].1);
        assert!(Uuid::parse_str(&messages[0].1).is_ok());

        let document: serde_json::Value = serde_json::from_slice(&messages[2].2).unwrap();
        assert_eq!(document["message"], "boom 2");
        assert_eq!(document["severity"], "Error");
        assert_eq!(document["service"]["name"], "svc-k");
    }

    #[tokio::test]
    async fn test_rejected_messages_are_counted() {
        let producer = Arc::new(RecordingProducer {
            failures: vec![(1, ProduceError::Rejected("message too large".into()))],
            ..RecordingProducer::default()
        });
        let sink = KafkaEgress::new(producer, "logs");

        let outcome = sink
            .send(batch(4), &ResourceContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.attempted(), 4);
        assert_eq!(outcome.failed(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_batch() {
        let producer = Arc::new(RecordingProducer {
            failures: vec![(0, ProduceError::BrokerUnavailable("all brokers down".into()))],
            ..RecordingProducer::default()
        });
        let sink = KafkaEgress::new(producer, "logs");

        let result = sink.send(batch(2), &ResourceContext::default()).await;
        assert!(matches!(result, Err(EgressError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let producer = Arc::new(RecordingProducer::default());
        let sink = KafkaEgress::new(producer.clone(), "logs");

        let outcome = sink
            .send(Vec::new(), &ResourceContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, EgressOutcome::default());
        assert!(producer.messages.lock().unwrap().is_empty());
    }
}
